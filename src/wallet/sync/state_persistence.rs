//! State persistence service for wallet synchronization.
//!
//! Every cache (address records, raw transactions, transaction heights,
//! block headers and server reputations) is stored as its own JSON blob
//! through a [`CacheRepository`]. Caches are loaded wholesale when an engine
//! starts and flushed by the engine according to a [`FlushPolicy`].

use crate::config::PersistenceConfig;
use crate::wallet::sync::repositories::{CacheRepository, FileCacheRepository, PersistenceError};
use crate::wallet::sync::server_pool::ServerRecord;
use crate::wallet::{AddressRecord, HeaderRecord, ScriptHash, TxHeightRecord, Txid};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const ADDRESSES_CACHE: &str = "addresses";
pub const TRANSACTIONS_CACHE: &str = "transactions";
pub const TX_HEIGHTS_CACHE: &str = "tx_heights";
pub const HEADERS_CACHE: &str = "headers";
pub const SERVERS_CACHE: &str = "servers";

/// An address record together with its forced used flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAddress {
	pub script_hash: ScriptHash,
	#[serde(flatten)]
	pub record: AddressRecord,
	/// Set when the address was marked used locally
	#[serde(default)]
	pub used: bool,
}

/// Everything an engine persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
	pub addresses: Vec<PersistedAddress>,
	/// Raw transactions, hex encoded
	pub transactions: BTreeMap<Txid, String>,
	pub tx_heights: BTreeMap<Txid, TxHeightRecord>,
	pub headers: BTreeMap<u64, HeaderRecord>,
	pub servers: Vec<ServerRecord>,
}

/// Service for managing state persistence operations.
pub struct StatePersistenceService {
	repo: Box<dyn CacheRepository>,
}

impl StatePersistenceService {
	/// Create a new state persistence service for the given data directory.
	pub fn new(data_dir: PathBuf) -> Self {
		Self::with_repository(Box::new(FileCacheRepository::new(data_dir)))
	}

	pub fn with_repository(repo: Box<dyn CacheRepository>) -> Self {
		Self { repo }
	}

	pub async fn save(&self, snapshot: &CacheSnapshot) -> Result<(), PersistenceError> {
		self.save_cache(ADDRESSES_CACHE, &snapshot.addresses).await?;
		self.save_cache(TRANSACTIONS_CACHE, &snapshot.transactions)
			.await?;
		self.save_cache(TX_HEIGHTS_CACHE, &snapshot.tx_heights).await?;
		self.save_cache(HEADERS_CACHE, &snapshot.headers).await?;
		self.save_cache(SERVERS_CACHE, &snapshot.servers).await?;

		info!(
			"Persisted {} addresses, {} transactions, {} headers",
			snapshot.addresses.len(),
			snapshot.transactions.len(),
			snapshot.headers.len()
		);
		Ok(())
	}

	/// Load every cache. Missing caches come back empty.
	pub async fn load(&self) -> Result<CacheSnapshot, PersistenceError> {
		Ok(CacheSnapshot {
			addresses: self.load_cache(ADDRESSES_CACHE).await?.unwrap_or_default(),
			transactions: self
				.load_cache(TRANSACTIONS_CACHE)
				.await?
				.unwrap_or_default(),
			tx_heights: self.load_cache(TX_HEIGHTS_CACHE).await?.unwrap_or_default(),
			headers: self.load_cache(HEADERS_CACHE).await?.unwrap_or_default(),
			servers: self.load_cache(SERVERS_CACHE).await?.unwrap_or_default(),
		})
	}

	async fn save_cache<T: Serialize + Sync>(
		&self,
		name: &str,
		value: &T,
	) -> Result<(), PersistenceError> {
		let content = serde_json::to_value(value)?;
		self.repo.save(name, &content).await
	}

	async fn load_cache<T: DeserializeOwned>(
		&self,
		name: &str,
	) -> Result<Option<T>, PersistenceError> {
		match self.repo.load(name).await? {
			Some(content) => match serde_json::from_value(content) {
				Ok(value) => Ok(Some(value)),
				Err(e) => {
					// A cache from an incompatible version is refetched from servers
					warn!("Discarding unreadable {} cache: {}", name, e);
					Ok(None)
				}
			},
			None => Ok(None),
		}
	}
}

/// Decides when dirty caches are written out.
///
/// A flush happens once the save interval has elapsed since the previous one,
/// or earlier when sync progress advanced by at least `progress_delta`.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
	save_interval: Duration,
	progress_delta: f64,
	last_flush: Instant,
	last_progress: f64,
}

impl FlushPolicy {
	pub fn new(config: &PersistenceConfig) -> Self {
		Self {
			save_interval: config.save_interval(),
			progress_delta: config.progress_flush_delta,
			last_flush: Instant::now(),
			last_progress: 0.0,
		}
	}

	pub fn should_flush(&self, dirty: bool, progress: f64) -> bool {
		dirty
			&& (self.last_flush.elapsed() >= self.save_interval
				|| progress - self.last_progress >= self.progress_delta)
	}

	pub fn mark_flushed(&mut self, progress: f64) {
		self.last_flush = Instant::now();
		self.last_progress = progress;
	}
}
