//! Runtime configuration.
//!
//! Every section has a `Default` matching what a mainnet wallet would use,
//! and the whole tree can be loaded from a JSON file where omitted fields
//! fall back to those defaults.

use crate::codec::NetworkParams;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-connection protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
	/// Maximum number of requests in flight before backpressure kicks in
	pub queue_size: usize,
	/// A single request slower than this fails on its own
	pub task_timeout_secs: u64,
	/// Idle time before a keepalive ping is sent
	pub keepalive_secs: u64,
	/// Silence from the server longer than this replaces the connection
	pub hang_timeout_secs: u64,
	pub connect_timeout_secs: u64,
	/// Longest frame accepted from a server before the connection is dropped
	pub max_frame_bytes: usize,
	/// Skip certificate and hostname checks on TLS transports. On by default
	/// because most public Electrum servers use self-signed certificates;
	/// the wallet never trusts a single server's answers anyway.
	pub accept_invalid_certs: bool,
	pub client_name: String,
	pub protocol_version: String,
}

impl ConnectionConfig {
	pub fn task_timeout(&self) -> Duration {
		Duration::from_secs(self.task_timeout_secs)
	}

	pub fn keepalive_interval(&self) -> Duration {
		Duration::from_secs(self.keepalive_secs)
	}

	pub fn hang_timeout(&self) -> Duration {
		Duration::from_secs(self.hang_timeout_secs)
	}

	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.connect_timeout_secs)
	}
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			queue_size: 10,
			task_timeout_secs: 30,
			keepalive_secs: 60,
			hang_timeout_secs: 150,
			connect_timeout_secs: 10,
			max_frame_bytes: 4 * 1024 * 1024,
			accept_invalid_certs: true,
			client_name: concat!("utxo-state-sync ", env!("CARGO_PKG_VERSION")).to_string(),
			protocol_version: "1.4".to_string(),
		}
	}
}

/// Server selection and reconnection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
	/// Number of servers kept connected at once
	pub max_connections: usize,
	/// Servers negotiating an older protocol version are dropped
	pub min_protocol_version: String,
	/// Acceptance probability multiplier per rank when picking servers
	pub selection_decay: f64,
	/// Floor for the acceptance probability
	pub min_acceptance: f64,
	pub reconnect_initial_ms: u64,
	pub max_reconnect_delay_secs: u64,
	/// Score taken away when a connection drops
	pub disconnect_penalty: i64,
	/// Score taken away when a single task fails
	pub task_failure_penalty: i64,
}

impl PoolConfig {
	pub fn reconnect_initial(&self) -> Duration {
		Duration::from_millis(self.reconnect_initial_ms)
	}

	pub fn max_reconnect_delay(&self) -> Duration {
		Duration::from_secs(self.max_reconnect_delay_secs)
	}
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_connections: 2,
			min_protocol_version: "1.1".to_string(),
			selection_decay: 0.5,
			min_acceptance: 0.1,
			reconnect_initial_ms: 1000,
			max_reconnect_delay_secs: 30,
			disconnect_penalty: 10,
			task_failure_penalty: 1,
		}
	}
}

/// Cache persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
	pub enabled: bool,
	pub data_dir: PathBuf,
	/// Minimum time between two flushes of dirty caches
	pub save_interval_secs: u64,
	/// Progress advance that forces a flush before the interval elapses
	pub progress_flush_delta: f64,
}

impl PersistenceConfig {
	pub fn save_interval(&self) -> Duration {
		Duration::from_secs(self.save_interval_secs)
	}
}

impl Default for PersistenceConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			data_dir: PathBuf::from("data"),
			save_interval_secs: 10,
			progress_flush_delta: 0.1,
		}
	}
}

/// Top level configuration of one wallet's sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	pub connection: ConnectionConfig,
	pub pool: PoolConfig,
	pub persistence: PersistenceConfig,
	pub network: NetworkParams,
	/// Consecutive unused addresses kept past the last used one
	pub gap_limit: usize,
	/// Minimum progress increase worth reporting
	pub progress_throttle: f64,
	/// Seed list of server URIs
	pub servers: Vec<String>,
	/// Server URIs containing any of these substrings are never used
	pub exclude_patterns: Vec<String>,
	/// Esplora-style endpoints used as additional broadcast backends
	pub http_broadcasters: Vec<String>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			connection: ConnectionConfig::default(),
			pool: PoolConfig::default(),
			persistence: PersistenceConfig::default(),
			network: NetworkParams::default(),
			gap_limit: 10,
			progress_throttle: 0.1,
			servers: Vec::new(),
			exclude_patterns: Vec::new(),
			http_broadcasters: Vec::new(),
		}
	}
}

impl EngineConfig {
	/// Load a configuration file. Missing fields take their defaults.
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
			path: path.to_path_buf(),
			source: e,
		})?;
		let config: Self = serde_json::from_str(&content)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.connection.queue_size == 0 {
			return Err(ConfigError::Invalid(
				"connection.queue_size must be positive".to_string(),
			));
		}
		if self.connection.max_frame_bytes == 0 {
			return Err(ConfigError::Invalid(
				"connection.max_frame_bytes must be positive".to_string(),
			));
		}
		if self.pool.max_connections == 0 {
			return Err(ConfigError::Invalid(
				"pool.max_connections must be positive".to_string(),
			));
		}
		if self.gap_limit == 0 {
			return Err(ConfigError::Invalid("gap_limit must be positive".to_string()));
		}
		if !(0.0..=1.0).contains(&self.pool.selection_decay) {
			return Err(ConfigError::Invalid(
				"pool.selection_decay must be within [0, 1]".to_string(),
			));
		}
		Ok(())
	}
}

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read {path:?}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Invalid configuration: {0}")]
	Invalid(String),
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn test_partial_file_falls_back_to_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{"gap_limit": 20, "servers": ["electrum://a.example:50001"], "pool": {{"max_connections": 4}}}}"#
		)
		.unwrap();

		let config = EngineConfig::from_file(file.path()).unwrap();
		assert_eq!(config.gap_limit, 20);
		assert_eq!(config.pool.max_connections, 4);
		assert_eq!(config.pool.min_protocol_version, "1.1");
		assert_eq!(config.connection, ConnectionConfig::default());
		assert_eq!(config.servers.len(), 1);
	}

	#[test]
	fn test_invalid_values_are_rejected() {
		let config = EngineConfig {
			gap_limit: 0,
			..Default::default()
		};
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
	}
}
