//! Watch-and-spend synchronization of a UTXO wallet against a pool of
//! untrusted Electrum-style servers.

pub mod codec;
pub mod config;
pub mod protocol;
pub mod utils;
pub mod wallet;
