use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use utxo_state_sync::codec::BitcoinTxCodec;
use utxo_state_sync::config::EngineConfig;
use utxo_state_sync::utils::format_amount;
use utxo_state_sync::wallet::SyncEngine;
use utxo_state_sync::wallet::keys::{Bip32ScriptDeriver, KeyManager, ScriptDeriver, ScriptFormat};
use utxo_state_sync::wallet::sync::events::LoggingEventHandler;
use utxo_state_sync::wallet::sync::server_pool::ServerPool;

/// Configuration file, defaults apply when it does not exist
const CONFIG_ENV: &str = "UTXO_SYNC_CONFIG";
/// Comma separated server URIs added to the configured ones
const SERVERS_ENV: &str = "UTXO_SYNC_SERVERS";
const DATA_DIR_ENV: &str = "UTXO_SYNC_DATA_DIR";
/// Account extended public key to watch
const XPUB_ENV: &str = "UTXO_SYNC_XPUB";
/// `p2pkh`, `p2sh_p2wpkh` or `p2wpkh`
const FORMAT_ENV: &str = "UTXO_SYNC_FORMAT";

fn load_config() -> Result<EngineConfig, String> {
	let path = PathBuf::from(std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.json".into()));
	let mut config = if path.exists() {
		EngineConfig::from_file(&path).map_err(|e| e.to_string())?
	} else {
		warn!("No config file at {:?}, using defaults", path);
		EngineConfig::default()
	};

	if let Ok(servers) = std::env::var(SERVERS_ENV) {
		config.servers.extend(
			servers
				.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string),
		);
	}
	if let Ok(data_dir) = std::env::var(DATA_DIR_ENV) {
		config.persistence.data_dir = PathBuf::from(data_dir);
	}
	config.validate().map_err(|e| e.to_string())?;
	Ok(config)
}

fn script_format() -> Result<ScriptFormat, String> {
	let format = std::env::var(FORMAT_ENV).unwrap_or_else(|_| "p2wpkh".into());
	serde_json::from_value(serde_json::Value::String(format.clone()))
		.map_err(|_| format!("Unknown script format {}", format))
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");

	let config = match load_config() {
		Ok(config) => config,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return;
		}
	};
	let Ok(xpub) = std::env::var(XPUB_ENV) else {
		error!("Set {} to the account extended public key to watch", XPUB_ENV);
		return;
	};
	let format = match script_format() {
		Ok(format) => format,
		Err(e) => {
			error!("{}", e);
			return;
		}
	};
	let deriver = match Bip32ScriptDeriver::from_xpub_str(&xpub, format, config.network.clone()) {
		Ok(deriver) => deriver,
		Err(e) => {
			error!("Failed to parse account key: {}", e);
			return;
		}
	};

	let pool = Arc::new(ServerPool::new(&config.pool));
	let gap_limit = config.gap_limit;
	let mut engine = match SyncEngine::new(config, pool, Arc::new(BitcoinTxCodec::new())) {
		Ok(engine) => engine,
		Err(e) => {
			error!("Failed to create sync engine: {}", e);
			return;
		}
	};
	engine.register_handler(Box::new(LoggingEventHandler));
	let engine = match engine.start().await {
		Ok(handle) => handle,
		Err(e) => {
			error!("Failed to start sync engine: {}", e);
			return;
		}
	};

	info!("Created sync engine");

	let derivers: Vec<Arc<dyn ScriptDeriver>> = vec![Arc::new(deriver)];
	let keys = match KeyManager::new(derivers, Arc::new(engine.clone()), gap_limit) {
		Ok(keys) => Arc::new(keys),
		Err(e) => {
			error!("Failed to create key manager: {}", e);
			return;
		}
	};
	match engine.address_records().await {
		Ok(records) => {
			keys.restore(&records).await;
		}
		Err(e) => warn!("Could not read cached addresses: {}", e),
	}
	if let Err(e) = keys.set_look_ahead().await {
		error!("Failed to derive addresses: {}", e);
		return;
	}
	if let Some(address) = keys.get_receive_address(format).await {
		info!("Receive address: {} ({})", address.display_address, address.path);
	}

	let look_ahead = {
		let keys = keys.clone();
		let events = engine.subscribe_events();
		tokio::spawn(async move { keys.run_look_ahead(events).await })
	};

	if let Err(e) = engine.connect().await {
		error!("Failed to connect: {}", e);
		return;
	}

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to wait for ctrl-c: {}", e);
	}

	match engine.get_balance().await {
		Ok(balance) => info!(
			"Balance: {} across {} transactions",
			format_amount(balance),
			engine.get_num_transactions().await.unwrap_or(0)
		),
		Err(e) => error!("Failed to read balance: {}", e),
	}
	if let Err(e) = engine.disconnect().await {
		error!("Failed to disconnect cleanly: {}", e);
	}
	look_ahead.abort();
	info!("Wallet sync service stopped");
}
