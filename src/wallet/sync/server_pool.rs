//! Process-wide server reputation table and header cache.
//!
//! One pool is shared by every engine of a currency. Scores move up on
//! successful replies and down on failures, and `get_servers` favours
//! well-scored, low latency servers while still giving the rest a chance.

use crate::codec::{CodecError, header_timestamp};
use crate::config::PoolConfig;
use crate::wallet::HeaderRecord;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

pub const MAX_SCORE: i64 = 500;
pub const MIN_SCORE: i64 = -100;

/// Weight of the newest sample in the latency moving average
const LATENCY_SMOOTHING: f64 = 0.3;

/// Reputation of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
	pub uri: String,
	pub score: i64,
	/// Moving average of reply latency in milliseconds
	#[serde(default)]
	pub latency_ms: Option<f64>,
}

impl ServerRecord {
	fn new(uri: String) -> Self {
		Self {
			uri,
			score: 0,
			latency_ms: None,
		}
	}
}

pub struct ServerPool {
	servers: RwLock<HashMap<String, ServerRecord>>,
	headers: RwLock<BTreeMap<u64, HeaderRecord>>,
	best_height: AtomicU64,
	rng: Mutex<StdRng>,
	selection_decay: f64,
	min_acceptance: f64,
}

impl ServerPool {
	pub fn new(config: &PoolConfig) -> Self {
		Self::with_rng(config, StdRng::from_os_rng())
	}

	/// Build a pool with a caller supplied random source.
	pub fn with_rng(config: &PoolConfig, rng: StdRng) -> Self {
		Self {
			servers: RwLock::new(HashMap::new()),
			headers: RwLock::new(BTreeMap::new()),
			best_height: AtomicU64::new(0),
			rng: Mutex::new(rng),
			selection_decay: config.selection_decay,
			min_acceptance: config.min_acceptance,
		}
	}

	/// Register endpoints. Known ones keep their reputation. Returns how many
	/// were new.
	pub fn add_servers<I, S>(&self, uris: I) -> usize
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut servers = self.servers.write();
		let mut added = 0;
		for uri in uris {
			let uri = uri.as_ref().trim();
			if uri.is_empty() || servers.contains_key(uri) {
				continue;
			}
			servers.insert(uri.to_string(), ServerRecord::new(uri.to_string()));
			added += 1;
		}
		added
	}

	/// Pick up to `n` endpoints, none of which contains any of the
	/// `exclude_patterns`.
	///
	/// Candidates are ranked by score, then latency. Walking the ranking, the
	/// candidate at rank `i` is accepted with probability
	/// `max(min_acceptance, decay^i)`; passes repeat over whatever is left
	/// until `n` are picked or nothing remains.
	pub fn get_servers(&self, n: usize, exclude_patterns: &[String]) -> Vec<String> {
		let mut candidates: Vec<ServerRecord> = self
			.servers
			.read()
			.values()
			.filter(|record| {
				!exclude_patterns
					.iter()
					.any(|pattern| !pattern.is_empty() && record.uri.contains(pattern.as_str()))
			})
			.cloned()
			.collect();
		candidates.sort_by(|a, b| {
			b.score
				.cmp(&a.score)
				.then_with(|| {
					let a = a.latency_ms.unwrap_or(f64::MAX);
					let b = b.latency_ms.unwrap_or(f64::MAX);
					a.total_cmp(&b)
				})
				.then_with(|| a.uri.cmp(&b.uri))
		});

		let mut rng = self.rng.lock();
		let mut picked = Vec::with_capacity(n.min(candidates.len()));
		while picked.len() < n && !candidates.is_empty() {
			let mut remaining = Vec::new();
			for (rank, candidate) in candidates.into_iter().enumerate() {
				let probability = self
					.selection_decay
					.powi(rank as i32)
					.max(self.min_acceptance)
					.clamp(0.0, 1.0);
				if picked.len() < n && rng.random_bool(probability) {
					picked.push(candidate.uri);
				} else {
					remaining.push(candidate);
				}
			}
			candidates = remaining;
		}

		picked
	}

	/// Reward a successful reply. Score is capped at [`MAX_SCORE`].
	pub fn server_score_up(&self, uri: &str, latency: Duration) {
		let mut servers = self.servers.write();
		let record = servers
			.entry(uri.to_string())
			.or_insert_with(|| ServerRecord::new(uri.to_string()));
		record.score = (record.score + 1).min(MAX_SCORE);
		let sample = latency.as_secs_f64() * 1000.0;
		record.latency_ms = Some(match record.latency_ms {
			Some(avg) => avg + LATENCY_SMOOTHING * (sample - avg),
			None => sample,
		});
	}

	/// Penalize a failure. Score is floored at [`MIN_SCORE`].
	pub fn server_score_down(&self, uri: &str, penalty: i64) {
		let mut servers = self.servers.write();
		let record = servers
			.entry(uri.to_string())
			.or_insert_with(|| ServerRecord::new(uri.to_string()));
		record.score = (record.score - penalty).max(MIN_SCORE);
		debug!("Server {} score down to {}", uri, record.score);
	}

	pub fn score(&self, uri: &str) -> Option<i64> {
		self.servers.read().get(uri).map(|record| record.score)
	}

	pub fn header(&self, height: u64) -> Option<HeaderRecord> {
		self.headers.read().get(&height).cloned()
	}

	pub fn has_header(&self, height: u64) -> bool {
		self.headers.read().contains_key(&height)
	}

	/// Cache a header. Headers are append-only; returns `false` when one was
	/// already stored at this height.
	pub fn add_header(&self, height: u64, header: &str) -> Result<bool, CodecError> {
		if self.has_header(height) {
			return Ok(false);
		}
		let timestamp = header_timestamp(header)?;
		let mut headers = self.headers.write();
		if headers.contains_key(&height) {
			return Ok(false);
		}
		headers.insert(
			height,
			HeaderRecord {
				header: header.to_lowercase(),
				timestamp,
			},
		);
		Ok(true)
	}

	pub fn best_height(&self) -> u64 {
		self.best_height.load(Ordering::Acquire)
	}

	/// Raise the best known height. Returns whether it increased.
	pub fn update_best_height(&self, height: u64) -> bool {
		self.best_height.fetch_max(height, Ordering::AcqRel) < height
	}

	pub fn snapshot_servers(&self) -> Vec<ServerRecord> {
		let mut records: Vec<ServerRecord> = self.servers.read().values().cloned().collect();
		records.sort_by(|a, b| a.uri.cmp(&b.uri));
		records
	}

	/// Merge persisted reputations. Entries already in the pool keep their
	/// in-memory state.
	pub fn restore_servers(&self, records: Vec<ServerRecord>) {
		let mut servers = self.servers.write();
		for record in records {
			servers.entry(record.uri.clone()).or_insert(record);
		}
	}

	pub fn snapshot_headers(&self) -> BTreeMap<u64, HeaderRecord> {
		self.headers.read().clone()
	}

	pub fn restore_headers(&self, headers: BTreeMap<u64, HeaderRecord>) {
		let mut cached = self.headers.write();
		for (height, record) in headers {
			cached.entry(height).or_insert(record);
		}
	}
}

/// Delay schedule between reconnect attempts.
///
/// Doubles on every consecutive failure up to the configured cap and starts
/// over once a connection succeeds.
pub struct Reconnector {
	backoff: ExponentialBackoff,
}

impl Reconnector {
	pub fn new(config: &PoolConfig) -> Self {
		let backoff = ExponentialBackoff {
			current_interval: config.reconnect_initial(),
			initial_interval: config.reconnect_initial(),
			randomization_factor: 0.0,
			multiplier: 2.0,
			max_interval: config.max_reconnect_delay(),
			max_elapsed_time: None,
			..Default::default()
		};
		Self { backoff }
	}

	pub fn next_delay(&mut self) -> Duration {
		self.backoff
			.next_backoff()
			.unwrap_or(self.backoff.max_interval)
	}

	pub fn reset(&mut self) {
		self.backoff.reset();
	}
}
