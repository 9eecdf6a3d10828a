//! Collaborator codecs consumed by the sync core.
//!
//! The engine never builds or signs transactions itself. It only needs to
//! read inputs and outputs out of raw transactions, hash locking scripts into
//! Electrum scripthashes, and render derived scripts as display addresses.
//! Everything currency specific is injected through [`NetworkParams`].

/// Script hashing and address rendering
pub mod script;
/// Raw transaction parsing
pub mod tx;

pub use script::*;
pub use tx::{BitcoinTxCodec, TxCodec};

/// Errors raised while decoding collaborator data formats
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error("Invalid hex: {0}")]
	InvalidHex(#[from] hex::FromHexError),

	#[error("Unexpected end of data at offset {0}")]
	UnexpectedEnd(usize),

	#[error("Trailing bytes after transaction: {0}")]
	TrailingBytes(usize),

	#[error("Invalid header: {0}")]
	InvalidHeader(String),

	#[error("Address encoding error: {0}")]
	AddressEncoding(String),
}
