//! Wallet Synchronization Module
//!
//! This module provides the core logic and services for keeping a wallet's
//! addresses, transactions and UTXOs in sync with a pool of servers.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `engine`: The actor that owns connections and caches, and the public handle to it.
//! - `state`: The synchronous core holding every cache; all result handlers live here.
//! - `scheduler`: Decides which task a connection should run next.
//! - `server_pool`: Server reputation and the header cache shared across wallets.
//! - `events`: Event types and handler traits used to report changes.
//! - `progress_tracker`: Tracks sync progress and statistics.
//! - `state_persistence` / `repositories`: Saving and loading caches.

/// Engine actor and public handle
pub mod engine;
/// Event system for decoupled communication during sync
pub mod events;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Storage backends for cached state
pub mod repositories;
/// Pure task selection
pub mod scheduler;
/// Shared server reputation and header cache
pub mod server_pool;
/// Caches and result handlers
pub mod state;
/// Cache snapshot persistence and flush policy
pub mod state_persistence;

pub use engine::{SyncEngine, SyncEngineHandle};
