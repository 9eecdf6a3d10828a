//!
//! HD key management and gap limit enforcement.
//!
//! A wallet watches one derivation path per (script format, chain) pair. The
//! `KeyManager` keeps, for each path, the ordered list of addresses derived so
//! far and makes sure at least `gap_limit` of them past the last used one stay
//! unused. New addresses are handed to the sync engine through the
//! [`AddressWatcher`] trait; the key manager never touches engine caches.

use crate::codec::{
	CodecError, NetworkParams, encode_base58check, encode_segwit_v0, hash160, p2pkh_script,
	p2sh_script, p2wpkh_script, script_hash,
};
use crate::wallet::sync::events::EngineEvent;
use crate::wallet::{AddressRecord, ScriptHash, WalletSyncError};

use async_trait::async_trait;
use bip32::{ChildNumber, XPub};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

/// Errors raised while deriving keys and addresses
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
	#[error("BIP32 error: {0}")]
	Bip32Error(#[from] bip32::Error),

	#[error("Codec error: {0}")]
	CodecError(#[from] CodecError),

	#[error("Derivation task failed: {0}")]
	TaskFailed(String),

	#[error("No derivation paths configured")]
	NoPaths,

	#[error("Two derivation paths share the address path {0}")]
	DuplicatePath(String),
}

/// Locking script type of the derived addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFormat {
	P2pkh,
	P2shP2wpkh,
	P2wpkh,
}

/// BIP32 chain index below the account key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
	External = 0,
	Internal = 1,
}

/// Output of one derivation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedScript {
	pub script: Vec<u8>,
	pub display_address: String,
	pub path: String,
}

/// Derives locking scripts for one script format.
#[async_trait]
pub trait ScriptDeriver: Send + Sync {
	fn format(&self) -> ScriptFormat;

	/// Display path of the address at `index` on `chain`.
	fn path(&self, chain: Chain, index: u32) -> String;

	async fn derive(&self, chain: Chain, index: u32) -> Result<DerivedScript, KeyError>;
}

/// Receives newly derived addresses and answers which are in use.
#[async_trait]
pub trait AddressWatcher: Send + Sync {
	/// Start watching an address. Returns `false` if it was already watched.
	async fn add_address(
		&self,
		script_hash: ScriptHash,
		display_address: String,
		path: String,
	) -> Result<bool, WalletSyncError>;

	/// Used flag of each script hash, in order. Unknown ones are unused.
	async fn used_flags(&self, script_hashes: Vec<ScriptHash>) -> Result<Vec<bool>, WalletSyncError>;
}

/// Non-hardened derivation below an account extended public key.
pub struct Bip32ScriptDeriver {
	account: XPub,
	format: ScriptFormat,
	params: NetworkParams,
	path_prefix: String,
}

impl Bip32ScriptDeriver {
	pub fn new(account: XPub, format: ScriptFormat, params: NetworkParams) -> Self {
		Self {
			account,
			format,
			params,
			path_prefix: "m".to_string(),
		}
	}

	/// Parse an `xpub`/`ypub`/`zpub` style account key.
	pub fn from_xpub_str(
		xpub: &str,
		format: ScriptFormat,
		params: NetworkParams,
	) -> Result<Self, KeyError> {
		let account = XPub::from_str(xpub.trim())?;
		Ok(Self::new(account, format, params))
	}

	/// Path of the account key, such as `m/84'/0'/0'`, shown in address paths.
	/// Persisted addresses are matched back to their deriver by this path, so
	/// derivers combined in one [`KeyManager`] need distinct prefixes.
	pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.path_prefix = prefix.into();
		self
	}
}

#[async_trait]
impl ScriptDeriver for Bip32ScriptDeriver {
	fn format(&self) -> ScriptFormat {
		self.format
	}

	fn path(&self, chain: Chain, index: u32) -> String {
		format!("{}/{}/{}", self.path_prefix, chain as u32, index)
	}

	async fn derive(&self, chain: Chain, index: u32) -> Result<DerivedScript, KeyError> {
		let account = self.account.clone();
		let format = self.format;
		let params = self.params.clone();
		let path = self.path(chain, index);

		// EC point multiplication stays off the async workers
		tokio::task::spawn_blocking(move || -> Result<DerivedScript, KeyError> {
			let chain_key = account.derive_child(ChildNumber::new(chain as u32, false)?)?;
			let key = chain_key.derive_child(ChildNumber::new(index, false)?)?;
			let pubkey_hash = hash160(&key.to_bytes());
			let (script, display_address) = render(format, &params, &pubkey_hash)?;
			Ok(DerivedScript {
				script,
				display_address,
				path,
			})
		})
		.await
		.map_err(|e| KeyError::TaskFailed(e.to_string()))?
	}
}

fn render(
	format: ScriptFormat,
	params: &NetworkParams,
	pubkey_hash: &[u8; 20],
) -> Result<(Vec<u8>, String), KeyError> {
	Ok(match format {
		ScriptFormat::P2pkh => (
			p2pkh_script(pubkey_hash),
			encode_base58check(params.pubkey_hash_version, pubkey_hash),
		),
		ScriptFormat::P2wpkh => (
			p2wpkh_script(pubkey_hash),
			encode_segwit_v0(&params.bech32_hrp, pubkey_hash)?,
		),
		ScriptFormat::P2shP2wpkh => {
			let redeem_hash = hash160(&p2wpkh_script(pubkey_hash));
			(
				p2sh_script(&redeem_hash),
				encode_base58check(params.script_hash_version, &redeem_hash),
			)
		}
	})
}

/// One address on a derivation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
	pub script_hash: ScriptHash,
	pub display_address: String,
	pub path: String,
	pub index: u32,
}

struct DerivationPath {
	deriver: Arc<dyn ScriptDeriver>,
	chain: Chain,
	addresses: Vec<DerivedAddress>,
}

impl DerivationPath {
	/// Derive the next index and register it with the watcher.
	async fn derive_next(&mut self, watcher: &dyn AddressWatcher) -> Result<(), WalletSyncError> {
		let index = self.addresses.len() as u32;
		let derived = self.deriver.derive(self.chain, index).await?;
		let address = DerivedAddress {
			script_hash: script_hash(&derived.script),
			display_address: derived.display_address,
			path: derived.path,
			index,
		};
		watcher
			.add_address(
				address.script_hash.clone(),
				address.display_address.clone(),
				address.path.clone(),
			)
			.await?;
		debug!("Derived {} at {}", address.display_address, address.path);
		self.addresses.push(address);
		Ok(())
	}
}

pub struct KeyManager {
	watcher: Arc<dyn AddressWatcher>,
	gap_limit: usize,
	/// Held across every derivation step
	paths: Mutex<Vec<DerivationPath>>,
}

impl KeyManager {
	/// Build a key manager with an external and an internal chain for every
	/// deriver. The first deriver's format is the one change goes to.
	///
	/// Fails with [`KeyError::DuplicatePath`] when two chains would produce the
	/// same address paths, since restoring from persisted records could not
	/// tell them apart.
	pub fn new(
		derivers: Vec<Arc<dyn ScriptDeriver>>,
		watcher: Arc<dyn AddressWatcher>,
		gap_limit: usize,
	) -> Result<Self, KeyError> {
		if derivers.is_empty() {
			return Err(KeyError::NoPaths);
		}
		let mut paths = Vec::with_capacity(derivers.len() * 2);
		let mut first_paths = HashSet::new();
		for deriver in derivers {
			for chain in [Chain::External, Chain::Internal] {
				let first = deriver.path(chain, 0);
				if !first_paths.insert(first.clone()) {
					return Err(KeyError::DuplicatePath(first));
				}
				paths.push(DerivationPath {
					deriver: deriver.clone(),
					chain,
					addresses: Vec::new(),
				});
			}
		}
		Ok(Self {
			watcher,
			gap_limit,
			paths: Mutex::new(paths),
		})
	}

	/// Rebuild the derivation paths from persisted address records.
	///
	/// Each path takes the records matching its paths from index 0 up to the
	/// first missing index. Anything past a gap is derived again by the next
	/// look-ahead.
	pub async fn restore(&self, records: &BTreeMap<ScriptHash, AddressRecord>) -> usize {
		let by_path: HashMap<&str, (&ScriptHash, &AddressRecord)> = records
			.iter()
			.map(|(script_hash, record)| (record.path.as_str(), (script_hash, record)))
			.collect();

		let mut paths = self.paths.lock().await;
		let mut restored = 0;
		for path in paths.iter_mut() {
			path.addresses.clear();
			loop {
				let index = path.addresses.len() as u32;
				let display_path = path.deriver.path(path.chain, index);
				let Some((script_hash, record)) = by_path.get(display_path.as_str()) else {
					break;
				};
				path.addresses.push(DerivedAddress {
					script_hash: (*script_hash).clone(),
					display_address: record.display_address.clone(),
					path: display_path,
					index,
				});
				restored += 1;
			}
		}
		info!("Restored {} derived addresses", restored);
		restored
	}

	/// Derive until every path ends with at least `gap_limit` unused
	/// addresses. Returns how many addresses were derived.
	pub async fn set_look_ahead(&self) -> Result<usize, WalletSyncError> {
		let mut paths = self.paths.lock().await;
		let mut derived = 0;
		for path in paths.iter_mut() {
			loop {
				let script_hashes: Vec<ScriptHash> = path
					.addresses
					.iter()
					.map(|address| address.script_hash.clone())
					.collect();
				let used = self.watcher.used_flags(script_hashes).await?;
				let trailing_unused = used.iter().rev().take_while(|used| !**used).count();
				if trailing_unused >= self.gap_limit {
					break;
				}
				path.derive_next(self.watcher.as_ref()).await?;
				derived += 1;
			}
		}
		if derived > 0 {
			info!("Derived {} new addresses", derived);
		}
		Ok(derived)
	}

	/// Most recently derived external address of `format`.
	pub async fn get_receive_address(&self, format: ScriptFormat) -> Option<DerivedAddress> {
		self.last_address(Chain::External, |deriver| deriver.format() == format)
			.await
	}

	/// Most recently derived internal address of the primary format.
	pub async fn get_change_address(&self) -> Option<DerivedAddress> {
		let paths = self.paths.lock().await;
		let primary = paths.first()?.deriver.format();
		paths
			.iter()
			.find(|path| path.chain == Chain::Internal && path.deriver.format() == primary)
			.and_then(|path| path.addresses.last().cloned())
	}

	/// Every address derived on `chain` for `format`, in index order.
	pub async fn addresses(&self, format: ScriptFormat, chain: Chain) -> Vec<DerivedAddress> {
		let paths = self.paths.lock().await;
		paths
			.iter()
			.filter(|path| path.chain == chain && path.deriver.format() == format)
			.flat_map(|path| path.addresses.iter().cloned())
			.collect()
	}

	async fn last_address(
		&self,
		chain: Chain,
		matches: impl Fn(&dyn ScriptDeriver) -> bool,
	) -> Option<DerivedAddress> {
		let paths = self.paths.lock().await;
		paths
			.iter()
			.find(|path| path.chain == chain && matches(path.deriver.as_ref()))
			.and_then(|path| path.addresses.last().cloned())
	}

	/// Re-run the look-ahead whenever an address becomes used. Returns when
	/// the event channel closes.
	pub async fn run_look_ahead(&self, mut events: broadcast::Receiver<EngineEvent>) {
		loop {
			match events.recv().await {
				Ok(EngineEvent::AddressUsedChanged { used: true, .. }) => {}
				Ok(_) => continue,
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					debug!("Look-ahead missed {} events", skipped);
				}
				Err(broadcast::error::RecvError::Closed) => return,
			}
			if let Err(e) = self.set_look_ahead().await {
				warn!("Look-ahead failed: {}", e);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Scripts `[0x51, format, chain, index]` under the given path prefix.
	struct TestDeriver(ScriptFormat, &'static str);

	#[async_trait]
	impl ScriptDeriver for TestDeriver {
		fn format(&self) -> ScriptFormat {
			self.0
		}

		fn path(&self, chain: Chain, index: u32) -> String {
			format!("{}/{}/{}", self.1, chain as u32, index)
		}

		async fn derive(&self, chain: Chain, index: u32) -> Result<DerivedScript, KeyError> {
			tokio::task::yield_now().await;
			Ok(DerivedScript {
				script: vec![0x51, self.0 as u8, chain as u8, index as u8],
				display_address: format!("addr-{}-{}", chain as u32, index),
				path: self.path(chain, index),
			})
		}
	}

	#[derive(Default)]
	struct TestWatcher {
		watched: parking_lot::Mutex<Vec<ScriptHash>>,
		used: parking_lot::Mutex<HashSet<ScriptHash>>,
	}

	#[async_trait]
	impl AddressWatcher for TestWatcher {
		async fn add_address(
			&self,
			script_hash: ScriptHash,
			_display_address: String,
			_path: String,
		) -> Result<bool, WalletSyncError> {
			let mut watched = self.watched.lock();
			if watched.contains(&script_hash) {
				return Ok(false);
			}
			watched.push(script_hash);
			Ok(true)
		}

		async fn used_flags(
			&self,
			script_hashes: Vec<ScriptHash>,
		) -> Result<Vec<bool>, WalletSyncError> {
			let used = self.used.lock();
			Ok(script_hashes.iter().map(|sh| used.contains(sh)).collect())
		}
	}

	fn manager(watcher: Arc<TestWatcher>, gap_limit: usize) -> KeyManager {
		KeyManager::new(
			vec![Arc::new(TestDeriver(ScriptFormat::P2wpkh, "m"))],
			watcher,
			gap_limit,
		)
		.unwrap()
	}

	#[tokio::test]
	async fn test_fresh_wallet_derives_gap_limit_addresses() {
		let watcher = Arc::new(TestWatcher::default());
		let keys = manager(watcher.clone(), 10);

		assert_eq!(keys.set_look_ahead().await.unwrap(), 20);
		let external = keys.addresses(ScriptFormat::P2wpkh, Chain::External).await;
		assert_eq!(external.len(), 10);
		assert_eq!(external[9].path, "m/0/9");
		assert_eq!(watcher.watched.lock().len(), 20);

		// Nothing used, nothing more to do
		assert_eq!(keys.set_look_ahead().await.unwrap(), 0);
		assert_eq!(
			keys.get_receive_address(ScriptFormat::P2wpkh).await.unwrap().index,
			9
		);
		assert_eq!(keys.get_change_address().await.unwrap().path, "m/1/9");
	}

	#[tokio::test]
	async fn test_used_address_extends_the_gap() {
		let watcher = Arc::new(TestWatcher::default());
		let keys = manager(watcher.clone(), 5);
		keys.set_look_ahead().await.unwrap();

		let external = keys.addresses(ScriptFormat::P2wpkh, Chain::External).await;
		watcher.used.lock().insert(external[3].script_hash.clone());
		assert_eq!(keys.set_look_ahead().await.unwrap(), 4);

		let external = keys.addresses(ScriptFormat::P2wpkh, Chain::External).await;
		assert_eq!(external.len(), 9);
		assert_eq!(keys.addresses(ScriptFormat::P2wpkh, Chain::Internal).await.len(), 5);
	}

	#[tokio::test]
	async fn test_concurrent_look_ahead_does_not_over_derive() {
		let watcher = Arc::new(TestWatcher::default());
		let keys = Arc::new(manager(watcher.clone(), 10));

		let (a, b) = tokio::join!(keys.set_look_ahead(), keys.set_look_ahead());
		assert_eq!(a.unwrap() + b.unwrap(), 20);
		assert_eq!(
			keys.addresses(ScriptFormat::P2wpkh, Chain::External).await.len(),
			10
		);
	}

	#[tokio::test]
	async fn test_restore_stops_at_first_gap() {
		let watcher = Arc::new(TestWatcher::default());
		let keys = manager(watcher.clone(), 3);

		let mut records = BTreeMap::new();
		for (n, path) in ["m/0/0", "m/0/1", "m/0/3", "m/1/0"].iter().enumerate() {
			records.insert(
				ScriptHash::new(format!("{:02x}", n)),
				AddressRecord::new(format!("addr{}", n), *path),
			);
		}
		assert_eq!(keys.restore(&records).await, 3);
		assert_eq!(
			keys.addresses(ScriptFormat::P2wpkh, Chain::External).await.len(),
			2
		);
	}

	#[test]
	fn test_derivers_sharing_a_path_prefix_are_refused() {
		let derivers: Vec<Arc<dyn ScriptDeriver>> = vec![
			Arc::new(TestDeriver(ScriptFormat::P2wpkh, "m")),
			Arc::new(TestDeriver(ScriptFormat::P2pkh, "m")),
		];
		let result = KeyManager::new(derivers, Arc::new(TestWatcher::default()), 5);
		assert!(matches!(result, Err(KeyError::DuplicatePath(path)) if path == "m/0/0"));
	}

	#[tokio::test]
	async fn test_restore_keeps_formats_apart() {
		let derivers: Vec<Arc<dyn ScriptDeriver>> = vec![
			Arc::new(TestDeriver(ScriptFormat::P2wpkh, "m/84'/0'/0'")),
			Arc::new(TestDeriver(ScriptFormat::P2pkh, "m/44'/0'/0'")),
		];
		let keys = KeyManager::new(derivers, Arc::new(TestWatcher::default()), 5).unwrap();

		let mut records = BTreeMap::new();
		records.insert(
			ScriptHash::new("84"),
			AddressRecord::new("segwit", "m/84'/0'/0'/0/0"),
		);
		records.insert(
			ScriptHash::new("44"),
			AddressRecord::new("legacy", "m/44'/0'/0'/0/0"),
		);
		assert_eq!(keys.restore(&records).await, 2);

		let segwit = keys.addresses(ScriptFormat::P2wpkh, Chain::External).await;
		assert_eq!(segwit.len(), 1);
		assert_eq!(segwit[0].script_hash, ScriptHash::new("84"));
		let legacy = keys.addresses(ScriptFormat::P2pkh, Chain::External).await;
		assert_eq!(legacy.len(), 1);
		assert_eq!(legacy[0].script_hash, ScriptHash::new("44"));
	}

	#[tokio::test]
	async fn test_bip84_vector() {
		let deriver = Bip32ScriptDeriver::from_xpub_str(
			"zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs",
			ScriptFormat::P2wpkh,
			NetworkParams::default(),
		)
		.unwrap()
		.with_path_prefix("m/84'/0'/0'");

		let first = deriver.derive(Chain::External, 0).await.unwrap();
		assert_eq!(first.display_address, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
		assert_eq!(first.path, "m/84'/0'/0'/0/0");

		let change = deriver.derive(Chain::Internal, 0).await.unwrap();
		assert_eq!(change.display_address, "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el");
	}
}
