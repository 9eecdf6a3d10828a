use crate::codec::CodecError;
use crate::protocol::ProtocolError;
use crate::wallet::broadcast::BroadcastError;
use crate::wallet::keys::KeyError;
use crate::wallet::sync::repositories::PersistenceError;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash of a locking script, hex encoded in Electrum byte order.
///
/// Primary key for everything address related. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptHash(String);

impl ScriptHash {
	pub fn new(hex: impl Into<String>) -> Self {
		Self(hex.into().to_lowercase())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ScriptHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Transaction id, hex encoded in display byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Txid(String);

impl Txid {
	pub fn new(hex: impl Into<String>) -> Self {
		Self(hex.into().to_lowercase())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Txid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Reference to a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
	pub txid: Txid,
	pub index: u32,
}

impl fmt::Display for OutPoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.txid, self.index)
	}
}

/// An unspent output as reported by a server or folded in from a pending
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
	pub txid: Txid,
	pub index: u32,
	pub value: u64,
}

impl UtxoRef {
	pub fn outpoint(&self) -> OutPoint {
		OutPoint {
			txid: self.txid.clone(),
			index: self.index,
		}
	}
}

/// Per-scripthash sync record.
///
/// Created when an address is first watched and mutated only by fetch
/// handlers. The two fingerprints are the server status hashes that were
/// current when the history and UTXO list were last fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
	pub display_address: String,
	pub path: String,
	pub txids: Vec<Txid>,
	pub utxos: Vec<UtxoRef>,
	#[serde(default)]
	pub history_fingerprint: Option<String>,
	#[serde(default)]
	pub utxo_fingerprint: Option<String>,
}

impl AddressRecord {
	pub fn new(display_address: impl Into<String>, path: impl Into<String>) -> Self {
		Self {
			display_address: display_address.into(),
			path: path.into(),
			..Default::default()
		}
	}

	/// Whether the record points at the transaction through its history or
	/// its UTXO list.
	pub fn references(&self, txid: &Txid) -> bool {
		self.txids.contains(txid) || self.utxos.iter().any(|utxo| &utxo.txid == txid)
	}
}

/// Derived, read-mostly view over an [`AddressRecord`] and the transaction
/// cache. Never references a transaction that is not cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressInfo {
	pub display_address: String,
	pub path: String,
	pub txids: Vec<Txid>,
	pub utxos: Vec<UtxoRef>,
	pub balance: u64,
	pub used: bool,
}

/// A parsed transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
	pub script_hash: ScriptHash,
	pub value: u64,
}

/// The parts of a transaction the sync engine looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTx {
	pub inputs: Vec<OutPoint>,
	pub outputs: Vec<TxOutput>,
}

/// Raw transaction bytes plus the parsed view. Immutable after the first
/// successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
	pub raw: Vec<u8>,
	pub parsed: ParsedTx,
}

/// Height `-1` means unconfirmed.
pub const UNCONFIRMED_HEIGHT: i64 = -1;

/// Confirmation height and first-seen time (unix seconds) of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHeightRecord {
	pub height: i64,
	pub first_seen: i64,
}

impl TxHeightRecord {
	pub fn is_confirmed(&self) -> bool {
		self.height > 0
	}
}

/// A block header blob and the timestamp decoded from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
	pub header: String,
	pub timestamp: u32,
}

/// A spendable output with the address data needed to sign for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletUtxo {
	pub script_hash: ScriptHash,
	pub display_address: String,
	pub path: String,
	pub utxo: UtxoRef,
	pub height: i64,
}

/// Error types surfaced by the wallet sync layer
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Protocol error: {0}")]
	ProtocolError(#[from] ProtocolError),

	#[error("Codec error: {0}")]
	CodecError(#[from] CodecError),

	#[error("Key error: {0}")]
	KeyError(#[from] KeyError),

	#[error("Broadcast error: {0}")]
	BroadcastError(#[from] BroadcastError),

	#[error("Persistence error: {0}")]
	PersistenceError(#[from] PersistenceError),

	#[error("Unknown address: {0}")]
	UnknownAddress(ScriptHash),

	#[error("No connected servers")]
	NotConnected,

	#[error("Sync engine stopped")]
	EngineStopped,

	#[error("Sync error: {0}")]
	SyncError(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_normalized_to_lowercase() {
		assert_eq!(ScriptHash::new("ABCD").as_str(), "abcd");
		assert_eq!(Txid::new("00FF"), Txid::new("00ff"));
	}

	#[test]
	fn record_references_history_and_utxos() {
		let mut record = AddressRecord::new("addr", "m/0/0");
		record.txids.push(Txid::new("aa"));
		record.utxos.push(UtxoRef {
			txid: Txid::new("bb"),
			index: 1,
			value: 10,
		});
		assert!(record.references(&Txid::new("aa")));
		assert!(record.references(&Txid::new("bb")));
		assert!(!record.references(&Txid::new("cc")));
	}
}
