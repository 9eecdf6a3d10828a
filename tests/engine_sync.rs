//! End-to-end sync against an in-process Electrum-style server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use utxo_state_sync::codec::{BitcoinTxCodec, TxCodec, script_hash};
use utxo_state_sync::config::EngineConfig;
use utxo_state_sync::wallet::keys::{
	Chain, DerivedScript, KeyError, KeyManager, ScriptDeriver, ScriptFormat,
};
use utxo_state_sync::wallet::sync::events::EngineEvent;
use utxo_state_sync::wallet::sync::server_pool::ServerPool;
use utxo_state_sync::wallet::{ScriptHash, SyncEngine, SyncEngineHandle, Txid, WalletSyncError};

const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

fn script(n: u8) -> Vec<u8> {
	vec![0x51, n]
}

fn write_varint(out: &mut Vec<u8>, n: usize) {
	assert!(n < 0xfd);
	out.push(n as u8);
}

/// Legacy serialization with empty input scripts.
fn raw_tx(inputs: &[(&Txid, u32)], outputs: &[(u8, u64)]) -> (Txid, Vec<u8>) {
	let mut raw = Vec::new();
	raw.extend_from_slice(&1u32.to_le_bytes());
	write_varint(&mut raw, inputs.len());
	for (txid, vout) in inputs {
		let mut prev = hex::decode(txid.as_str()).unwrap();
		prev.reverse();
		raw.extend_from_slice(&prev);
		raw.extend_from_slice(&vout.to_le_bytes());
		write_varint(&mut raw, 0);
		raw.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
	}
	write_varint(&mut raw, outputs.len());
	for (n, value) in outputs {
		raw.extend_from_slice(&value.to_le_bytes());
		let script = script(*n);
		write_varint(&mut raw, script.len());
		raw.extend_from_slice(&script);
	}
	raw.extend_from_slice(&0u32.to_le_bytes());
	let txid = BitcoinTxCodec::new().txid(&raw).unwrap();
	(txid, raw)
}

/// What the fake server knows about the chain
#[derive(Default)]
struct FakeChain {
	status: HashMap<String, String>,
	history: HashMap<String, Value>,
	unspent: HashMap<String, Value>,
	transactions: HashMap<String, String>,
	reject_broadcasts: bool,
}

impl FakeChain {
	fn fund(&mut self, script_hash: &ScriptHash, txid: &Txid, raw: &[u8], value: u64, height: i64) {
		let sh = script_hash.as_str().to_string();
		self.status.insert(sh.clone(), format!("status-{}", txid));
		self.history.insert(
			sh.clone(),
			json!([{ "tx_hash": txid.as_str(), "height": height }]),
		);
		self.unspent.insert(
			sh,
			json!([{ "tx_hash": txid.as_str(), "tx_pos": 0, "height": height, "value": value }]),
		);
		self.transactions
			.insert(txid.as_str().to_string(), hex::encode(raw));
	}

	fn answer(&self, method: &str, params: &[Value]) -> Result<Value, String> {
		let first = params.first().and_then(Value::as_str).unwrap_or_default();
		match method {
			"server.version" => Ok(json!(["FakeServer 0.1", "1.4"])),
			"server.ping" => Ok(Value::Null),
			"blockchain.headers.subscribe" => Ok(json!({ "height": 100, "hex": GENESIS_HEADER })),
			"blockchain.block.header" => Ok(json!(GENESIS_HEADER)),
			"blockchain.estimatefee" => Ok(json!(0.0001)),
			"blockchain.scripthash.subscribe" => {
				Ok(self.status.get(first).map(|s| json!(s)).unwrap_or(Value::Null))
			}
			"blockchain.scripthash.get_history" => {
				Ok(self.history.get(first).cloned().unwrap_or(json!([])))
			}
			"blockchain.scripthash.listunspent" => {
				Ok(self.unspent.get(first).cloned().unwrap_or(json!([])))
			}
			"blockchain.transaction.get" => self
				.transactions
				.get(first)
				.map(|raw| json!(raw))
				.ok_or_else(|| "No such transaction".to_string()),
			"blockchain.transaction.broadcast" => {
				if self.reject_broadcasts {
					return Err("bad-txns-inputs-missingorspent".to_string());
				}
				let raw = hex::decode(first).map_err(|e| e.to_string())?;
				let txid = BitcoinTxCodec::new()
					.txid(&raw)
					.map_err(|e| e.to_string())?;
				Ok(json!(txid.as_str()))
			}
			other => Err(format!("unknown method {}", other)),
		}
	}
}

async fn serve_client(socket: TcpStream, chain: Arc<FakeChain>) {
	let (read, mut write) = socket.into_split();
	let mut lines = BufReader::new(read).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		let request: Value = serde_json::from_str(&line).unwrap();
		let params = request["params"].as_array().cloned().unwrap_or_default();
		let method = request["method"].as_str().unwrap_or_default();
		let reply = match chain.answer(method, &params) {
			Ok(result) => json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
			Err(message) => json!({
				"jsonrpc": "2.0",
				"id": request["id"],
				"error": { "code": 1, "message": message }
			}),
		};
		if write
			.write_all(format!("{}\n", reply).as_bytes())
			.await
			.is_err()
		{
			return;
		}
	}
}

async fn spawn_server(chain: FakeChain) -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let chain = Arc::new(chain);
	tokio::spawn(async move {
		while let Ok((socket, _)) = listener.accept().await {
			tokio::spawn(serve_client(socket, chain.clone()));
		}
	});
	format!("tcp://{}", addr)
}

fn config(data_dir: &std::path::Path, servers: Vec<String>) -> EngineConfig {
	let mut config = EngineConfig::default();
	config.servers = servers;
	config.pool.max_connections = 1;
	config.persistence.data_dir = data_dir.to_path_buf();
	config
}

async fn start(config: EngineConfig) -> SyncEngineHandle {
	let pool = Arc::new(ServerPool::new(&config.pool));
	SyncEngine::new(config, pool, Arc::new(BitcoinTxCodec::new()))
		.unwrap()
		.start()
		.await
		.unwrap()
}

async fn wait_for(events: &mut broadcast::Receiver<EngineEvent>, wanted: EngineEvent) {
	tokio::time::timeout(Duration::from_secs(10), async {
		loop {
			match events.recv().await {
				Ok(event) if event == wanted => return,
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(e) => panic!("event channel closed: {}", e),
			}
		}
	})
	.await
	.unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted));
}

async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	tokio::time::timeout(Duration::from_secs(10), async {
		while !check().await {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await
	.expect("condition never held");
}

#[tokio::test]
async fn test_sync_broadcast_and_restart() {
	let wallet = script_hash(&script(1));
	let coinbase = Txid::new("11".repeat(32));
	let (funding, funding_raw) = raw_tx(&[(&coinbase, 0)], &[(1, 5000)]);
	let mut chain = FakeChain::default();
	chain.fund(&wallet, &funding, &funding_raw, 5000, 100);
	let server = spawn_server(chain).await;

	let dir = tempfile::tempdir().unwrap();
	let engine = start(config(dir.path(), vec![server])).await;
	let mut events = engine.subscribe_events();

	engine
		.add_address(wallet.clone(), "wallet-1".into(), "m/0/0".into())
		.await
		.unwrap();
	engine.connect().await.unwrap();

	wait_for(&mut events, EngineEvent::BalanceChanged { balance: 5000 }).await;
	let handle = &engine;
	eventually(move || async move {
		let heights: Vec<i64> = handle
			.get_utxos()
			.await
			.unwrap()
			.iter()
			.map(|u| u.height)
			.collect();
		handle.progress().await.unwrap() >= 1.0 && heights == vec![100]
	})
	.await;
	let utxos = engine.get_utxos().await.unwrap();
	assert_eq!(utxos.len(), 1);
	assert_eq!(utxos[0].height, 100);
	assert_eq!(engine.get_num_transactions().await.unwrap(), 1);

	// Fee estimate comes back in sat/vbyte
	let fee = engine.estimate_fee(2).await.unwrap().unwrap();
	assert!((fee - 10.0).abs() < 1e-9);

	// Spend everything to a foreign script and echo it locally
	let (spend, spend_raw) = raw_tx(&[(&funding, 0)], &[(9, 4000)]);
	assert_eq!(engine.broadcast_tx(&spend_raw).await.unwrap(), spend);
	engine.save_tx(&spend, spend_raw).await.unwrap();
	assert_eq!(engine.get_balance().await.unwrap(), 0);

	engine.disconnect().await.unwrap();
	assert!(engine.estimate_fee(2).await.is_err());

	// Caches come back without any server
	let restarted = start(config(dir.path(), Vec::new())).await;
	let info = restarted.get_address_info(wallet).await.unwrap().unwrap();
	assert!(info.used);
	assert_eq!(info.txids.len(), 2);
	assert_eq!(restarted.get_balance().await.unwrap(), 0);
}

#[tokio::test]
async fn test_broadcast_rejected_everywhere_fails() {
	let chain = FakeChain {
		reject_broadcasts: true,
		..Default::default()
	};
	let server = spawn_server(chain).await;
	let dir = tempfile::tempdir().unwrap();
	let engine = start(config(dir.path(), vec![server.clone()])).await;
	let mut events = engine.subscribe_events();
	engine.connect().await.unwrap();
	wait_for(
		&mut events,
		EngineEvent::Connected {
			server: server.clone(),
		},
	)
	.await;

	let (_, raw) = raw_tx(&[(&Txid::new("22".repeat(32)), 0)], &[(3, 10)]);
	let err = engine.broadcast_tx(&raw).await.unwrap_err();
	assert!(err.to_string().contains("bad-txns-inputs-missingorspent"));
	engine.disconnect().await.unwrap();
}

/// Scripts `[0x51, chain, index]`
struct SimpleDeriver;

#[async_trait]
impl ScriptDeriver for SimpleDeriver {
	fn format(&self) -> ScriptFormat {
		ScriptFormat::P2wpkh
	}

	fn path(&self, chain: Chain, index: u32) -> String {
		format!("m/{}/{}", chain as u32, index)
	}

	async fn derive(&self, chain: Chain, index: u32) -> Result<DerivedScript, KeyError> {
		Ok(DerivedScript {
			script: vec![0x51, chain as u8, index as u8],
			display_address: format!("address-{}-{}", chain as u32, index),
			path: self.path(chain, index),
		})
	}
}

#[tokio::test]
async fn test_fresh_wallet_watches_gap_limit_addresses() -> Result<(), WalletSyncError> {
	let dir = tempfile::tempdir().unwrap();
	let engine = start(config(dir.path(), Vec::new())).await;
	let keys = KeyManager::new(vec![Arc::new(SimpleDeriver)], Arc::new(engine.clone()), 10)?;

	keys.set_look_ahead().await?;
	let external = keys.addresses(ScriptFormat::P2wpkh, Chain::External).await;
	assert_eq!(external.len(), 10);
	let flags = engine
		.used_flags(external.iter().map(|a| a.script_hash.clone()).collect())
		.await?;
	assert!(flags.iter().all(|used| !used));
	assert_eq!(engine.get_balance().await?, 0);
	assert_eq!(engine.address_records().await?.len(), 20);

	// Marking the newest external address used opens another gap
	engine
		.mark_addresses_used(vec![external[9].script_hash.clone()])
		.await?;
	keys.set_look_ahead().await?;
	assert_eq!(
		keys.addresses(ScriptFormat::P2wpkh, Chain::External).await.len(),
		20
	);
	Ok(())
}
