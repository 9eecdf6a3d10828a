//! Wire types for the Electrum-style JSON-RPC protocol and the task model
//! built on top of it.

use crate::wallet::{ScriptHash, Txid};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const METHOD_VERSION: &str = "server.version";
pub const METHOD_PING: &str = "server.ping";
pub const METHOD_HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
pub const METHOD_BLOCK_HEADER: &str = "blockchain.block.header";
pub const METHOD_TRANSACTION_GET: &str = "blockchain.transaction.get";
pub const METHOD_TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
pub const METHOD_SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub const METHOD_SCRIPTHASH_HISTORY: &str = "blockchain.scripthash.get_history";
pub const METHOD_SCRIPTHASH_UNSPENT: &str = "blockchain.scripthash.listunspent";
pub const METHOD_ESTIMATE_FEE: &str = "blockchain.estimatefee";

/// Transport selected by the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
	Tcp,
	Tls,
	WebSocket,
	SecureWebSocket,
}

/// A parsed `scheme://host:port` server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerUri {
	raw: String,
	pub transport: TransportKind,
	pub host: String,
	pub port: u16,
}

impl ServerUri {
	pub fn as_str(&self) -> &str {
		&self.raw
	}

	/// The `ws://` / `wss://` URL for WebSocket transports.
	pub fn websocket_url(&self) -> String {
		let scheme = match self.transport {
			TransportKind::SecureWebSocket => "wss",
			_ => "ws",
		};
		format!("{}://{}:{}", scheme, self.host, self.port)
	}
}

impl FromStr for ServerUri {
	type Err = ProtocolError;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let (scheme, rest) = raw
			.split_once("://")
			.ok_or_else(|| ProtocolError::InvalidUri(raw.to_string()))?;
		let transport = match scheme.to_ascii_lowercase().as_str() {
			"electrum" | "tcp" => TransportKind::Tcp,
			"electrums" | "ssl" | "tls" => TransportKind::Tls,
			"electrumws" | "ws" => TransportKind::WebSocket,
			"electrumwss" | "wss" => TransportKind::SecureWebSocket,
			_ => return Err(ProtocolError::UnsupportedScheme(scheme.to_string())),
		};
		let rest = rest.trim_end_matches('/');
		let (host, port) = rest
			.rsplit_once(':')
			.ok_or_else(|| ProtocolError::InvalidUri(raw.to_string()))?;
		let port = port
			.parse::<u16>()
			.map_err(|_| ProtocolError::InvalidUri(raw.to_string()))?;
		if host.is_empty() {
			return Err(ProtocolError::InvalidUri(raw.to_string()));
		}

		Ok(Self {
			raw: raw.to_string(),
			transport,
			host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
			port,
		})
	}
}

impl fmt::Display for ServerUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.raw)
	}
}

/// Correlates a forced submission (broadcast, fee estimate) with the caller
/// waiting on it.
pub type TicketId = u64;

/// A unit of work transmitted to one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
	Version {
		client_name: String,
		protocol_version: String,
	},
	SubscribeHeaders,
	GetHeader {
		height: u64,
	},
	GetTransaction {
		txid: Txid,
	},
	SubscribeScriptHash {
		script_hash: ScriptHash,
	},
	/// `fingerprint` is the server status the fetch was scheduled against
	GetHistory {
		script_hash: ScriptHash,
		fingerprint: Option<String>,
	},
	ListUnspent {
		script_hash: ScriptHash,
		fingerprint: Option<String>,
	},
	Broadcast {
		raw_hex: String,
		ticket: TicketId,
	},
	EstimateFee {
		blocks: u32,
		ticket: TicketId,
	},
	Ping,
}

impl Task {
	pub fn method(&self) -> &'static str {
		match self {
			Task::Version { .. } => METHOD_VERSION,
			Task::SubscribeHeaders => METHOD_HEADERS_SUBSCRIBE,
			Task::GetHeader { .. } => METHOD_BLOCK_HEADER,
			Task::GetTransaction { .. } => METHOD_TRANSACTION_GET,
			Task::SubscribeScriptHash { .. } => METHOD_SCRIPTHASH_SUBSCRIBE,
			Task::GetHistory { .. } => METHOD_SCRIPTHASH_HISTORY,
			Task::ListUnspent { .. } => METHOD_SCRIPTHASH_UNSPENT,
			Task::Broadcast { .. } => METHOD_TRANSACTION_BROADCAST,
			Task::EstimateFee { .. } => METHOD_ESTIMATE_FEE,
			Task::Ping => METHOD_PING,
		}
	}

	pub fn params(&self) -> Value {
		match self {
			Task::Version {
				client_name,
				protocol_version,
			} => json!([client_name, protocol_version]),
			Task::SubscribeHeaders | Task::Ping => json!([]),
			Task::GetHeader { height } => json!([height]),
			Task::GetTransaction { txid } => json!([txid.as_str()]),
			Task::SubscribeScriptHash { script_hash }
			| Task::GetHistory { script_hash, .. }
			| Task::ListUnspent { script_hash, .. } => json!([script_hash.as_str()]),
			Task::Broadcast { raw_hex, .. } => json!([raw_hex]),
			Task::EstimateFee { blocks, .. } => json!([blocks]),
		}
	}
}

/// Outgoing request frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
	pub id: u64,
	pub method: &'a str,
	pub params: Value,
}

/// Any incoming frame. Replies carry an `id`, notifications do not.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFrame {
	#[serde(default)]
	pub id: Option<Value>,
	#[serde(default)]
	pub result: Option<Value>,
	#[serde(default)]
	pub error: Option<Value>,
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default)]
	pub params: Option<Value>,
}

/// Chain tip as reported by `blockchain.headers.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNotification {
	pub height: u64,
	pub hex: String,
}

/// One entry of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub tx_hash: Txid,
	pub height: i64,
	#[serde(default)]
	pub fee: Option<u64>,
}

/// One entry of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentEntry {
	pub tx_hash: Txid,
	pub tx_pos: u32,
	pub height: i64,
	pub value: u64,
}

/// A reply decoded according to the task that requested it.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
	Version { server: String, protocol: String },
	Headers(HeaderNotification),
	BlockHeader(String),
	Transaction(String),
	ScriptHashStatus(Option<String>),
	History(Vec<HistoryEntry>),
	Unspent(Vec<UnspentEntry>),
	Broadcast(Txid),
	/// Coin per kilobyte, `None` when the server cannot estimate
	Fee(Option<f64>),
	Pong,
}

impl TaskResult {
	/// Decode a raw reply for the given task. A mismatch is a protocol error.
	pub fn decode(task: &Task, value: Value) -> Result<Self, ProtocolError> {
		let mismatch = |detail: String| ProtocolError::UnexpectedResult {
			method: task.method(),
			detail,
		};

		let result = match task {
			Task::Version { .. } => match &value {
				Value::Array(items) if items.len() >= 2 => {
					let server = items[0].as_str().unwrap_or_default().to_string();
					let protocol = items[1]
						.as_str()
						.ok_or_else(|| mismatch("protocol version is not a string".to_string()))?
						.to_string();
					TaskResult::Version { server, protocol }
				}
				Value::String(protocol) => TaskResult::Version {
					server: String::new(),
					protocol: protocol.clone(),
				},
				other => return Err(mismatch(format!("unexpected version reply {}", other))),
			},
			Task::SubscribeHeaders => TaskResult::Headers(
				serde_json::from_value(value).map_err(|e| mismatch(e.to_string()))?,
			),
			Task::GetHeader { .. } => TaskResult::BlockHeader(
				value
					.as_str()
					.ok_or_else(|| mismatch("header is not a string".to_string()))?
					.to_string(),
			),
			Task::GetTransaction { .. } => TaskResult::Transaction(
				value
					.as_str()
					.ok_or_else(|| mismatch("transaction is not a string".to_string()))?
					.to_string(),
			),
			Task::SubscribeScriptHash { .. } => match value {
				Value::Null => TaskResult::ScriptHashStatus(None),
				Value::String(status) => TaskResult::ScriptHashStatus(Some(status)),
				other => return Err(mismatch(format!("unexpected status {}", other))),
			},
			Task::GetHistory { .. } => TaskResult::History(
				serde_json::from_value(value).map_err(|e| mismatch(e.to_string()))?,
			),
			Task::ListUnspent { .. } => TaskResult::Unspent(
				serde_json::from_value(value).map_err(|e| mismatch(e.to_string()))?,
			),
			Task::Broadcast { .. } => TaskResult::Broadcast(Txid::new(
				value
					.as_str()
					.ok_or_else(|| mismatch("txid is not a string".to_string()))?,
			)),
			Task::EstimateFee { .. } => {
				let fee = value
					.as_f64()
					.ok_or_else(|| mismatch("fee is not a number".to_string()))?;
				TaskResult::Fee((fee > 0.0).then_some(fee))
			}
			Task::Ping => TaskResult::Pong,
		};

		Ok(result)
	}
}

/// Unsolicited server notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
	Headers(HeaderNotification),
	ScriptHash {
		script_hash: ScriptHash,
		status: Option<String>,
	},
}

impl Notification {
	/// Decode a notification frame. Unknown methods yield `Ok(None)`.
	pub fn decode(method: &str, params: Option<Value>) -> Result<Option<Self>, ProtocolError> {
		let params = match params {
			Some(Value::Array(params)) => params,
			_ => {
				return Err(ProtocolError::InvalidFrame(format!(
					"notification {} without params array",
					method
				)));
			}
		};

		match method {
			METHOD_HEADERS_SUBSCRIBE => {
				let header = params.into_iter().next().ok_or_else(|| {
					ProtocolError::InvalidFrame("empty header notification".to_string())
				})?;
				let header = serde_json::from_value(header)?;
				Ok(Some(Notification::Headers(header)))
			}
			METHOD_SCRIPTHASH_SUBSCRIBE => {
				let mut params = params.into_iter();
				let script_hash = params
					.next()
					.and_then(|v| v.as_str().map(ScriptHash::new))
					.ok_or_else(|| {
						ProtocolError::InvalidFrame("scripthash notification without hash".to_string())
					})?;
				let status = params.next().and_then(|v| v.as_str().map(str::to_string));
				Ok(Some(Notification::ScriptHash {
					script_hash,
					status,
				}))
			}
			_ => Ok(None),
		}
	}
}

/// Identifies one connection attempt. Never reused, so events from a stale
/// connection can be told apart from its replacement to the same server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Events a connection reports to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
	Opened,
	/// Fewer than the configured number of requests are outstanding
	QueueSpace,
	Completed {
		task: Task,
		result: TaskResult,
		latency: Duration,
	},
	Failed {
		task: Task,
		error: TaskError,
	},
	Notification(Notification),
	/// Terminal. Every outstanding task has been failed before this is sent
	Closed {
		error: Option<ConnectionError>,
	},
}

/// Malformed replies, unknown ids and schema mismatches
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Reply for unknown request id {0}")]
	UnknownId(u64),

	#[error("Invalid frame: {0}")]
	InvalidFrame(String),

	#[error("Frame exceeds {0} bytes")]
	FrameTooLong(usize),

	#[error("Unexpected result for {method}: {detail}")]
	UnexpectedResult { method: &'static str, detail: String },

	#[error("Invalid server URI: {0}")]
	InvalidUri(String),

	#[error("Unsupported URI scheme: {0}")]
	UnsupportedScheme(String),
}

/// Transport level failures; each one takes the whole connection down
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("TLS error: {0}")]
	TlsError(#[from] tokio_native_tls::native_tls::Error),

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("Protocol error: {0}")]
	ProtocolError(#[from] ProtocolError),

	#[error("Connect timed out after {0:?}")]
	ConnectTimeout(Duration),

	#[error("No traffic for {0:?}")]
	Hang(Duration),

	#[error("Connection closed by server")]
	Closed,
}

/// Failure of a single task
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
	#[error("Request timed out")]
	Timeout,

	#[error("Connection closed")]
	ConnectionClosed,

	#[error("Server error: {0}")]
	Server(String),
}

impl TaskError {
	/// Build a server error from the `error` member of a reply.
	pub fn from_reply(error: &Value) -> Self {
		let message = error
			.get("message")
			.and_then(|m| m.as_str())
			.map(str::to_string)
			.unwrap_or_else(|| error.to_string());
		TaskError::Server(message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_uri_schemes() {
		let uri: ServerUri = "electrums://electrum.example.com:50002".parse().unwrap();
		assert_eq!(uri.transport, TransportKind::Tls);
		assert_eq!(uri.host, "electrum.example.com");
		assert_eq!(uri.port, 50002);

		let uri: ServerUri = "electrumwss://node.example.com:50004/".parse().unwrap();
		assert_eq!(uri.transport, TransportKind::SecureWebSocket);
		assert_eq!(uri.websocket_url(), "wss://node.example.com:50004");

		assert!(matches!(
			"http://example.com:80".parse::<ServerUri>(),
			Err(ProtocolError::UnsupportedScheme(_))
		));
		assert!("electrum://example.com".parse::<ServerUri>().is_err());
	}

	#[test]
	fn test_decode_history_and_unspent() {
		let task = Task::GetHistory {
			script_hash: ScriptHash::new("aa"),
			fingerprint: None,
		};
		let result = TaskResult::decode(
			&task,
			json!([{"tx_hash": "AB", "height": 100}, {"tx_hash": "cd", "height": 0, "fee": 250}]),
		)
		.unwrap();
		match result {
			TaskResult::History(entries) => {
				assert_eq!(entries.len(), 2);
				assert_eq!(entries[0].tx_hash, Txid::new("ab"));
				assert_eq!(entries[1].fee, Some(250));
			}
			other => panic!("unexpected result {:?}", other),
		}

		let task = Task::ListUnspent {
			script_hash: ScriptHash::new("aa"),
			fingerprint: None,
		};
		assert!(TaskResult::decode(&task, json!({"not": "a list"})).is_err());
	}

	#[test]
	fn test_decode_version_and_fee() {
		let task = Task::Version {
			client_name: "test".to_string(),
			protocol_version: "1.4".to_string(),
		};
		assert_eq!(
			TaskResult::decode(&task, json!(["ElectrumX 1.16.0", "1.4"])).unwrap(),
			TaskResult::Version {
				server: "ElectrumX 1.16.0".to_string(),
				protocol: "1.4".to_string()
			}
		);

		let task = Task::EstimateFee {
			blocks: 2,
			ticket: 1,
		};
		assert_eq!(
			TaskResult::decode(&task, json!(-1)).unwrap(),
			TaskResult::Fee(None)
		);
	}

	#[test]
	fn test_decode_notifications() {
		let note = Notification::decode(
			METHOD_SCRIPTHASH_SUBSCRIBE,
			Some(json!(["ABCD", "status"])),
		)
		.unwrap();
		assert_eq!(
			note,
			Some(Notification::ScriptHash {
				script_hash: ScriptHash::new("abcd"),
				status: Some("status".to_string())
			})
		);

		let note =
			Notification::decode(METHOD_HEADERS_SUBSCRIBE, Some(json!([{"height": 5, "hex": "00"}])))
				.unwrap();
		assert!(matches!(note, Some(Notification::Headers(h)) if h.height == 5));

		assert_eq!(
			Notification::decode("server.banner", Some(json!([]))).unwrap(),
			None
		);
		assert!(Notification::decode(METHOD_HEADERS_SUBSCRIBE, None).is_err());
	}
}
