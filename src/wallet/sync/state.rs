//! The synchronous core of the sync engine.
//!
//! `EngineState` owns every cache and the per-server sync state. It performs
//! no I/O: the engine actor feeds it connection events and asks it, through
//! the scheduler, what to request next. Handlers are idempotent; applying
//! the same reply twice leaves the caches as they were after the first.

use super::events::EngineEvent;
use super::progress_tracker::SyncProgressTracker;
use super::server_pool::ServerPool;
use super::state_persistence::{CacheSnapshot, PersistedAddress};
use crate::codec::TxCodec;
use crate::config::EngineConfig;
use crate::protocol::{
	ConnectionId, HeaderNotification, HistoryEntry, Notification, Task, TaskError, TaskResult,
	UnspentEntry,
};
use crate::wallet::{
	AddressInfo, AddressRecord, OutPoint, ScriptHash, TxHeightRecord, TxRecord, Txid,
	UNCONFIRMED_HEIGHT, UtxoRef, WalletSyncError, WalletUtxo,
};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Progress of a one-shot negotiation with a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Negotiation {
	#[default]
	Idle,
	Pending,
	Done,
	Failed,
}

/// What one server has told us about one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSubState {
	pub subscribing: bool,
	pub subscribed: bool,
	/// Latest status hash reported by the server
	pub fingerprint: Option<String>,
	/// Sequence number of the latest status change, higher is newer
	pub last_update: u64,
	pub fetching_history: bool,
	pub fetching_utxos: bool,
}

/// Sync state of one live connection.
#[derive(Debug, Clone)]
pub struct ServerState {
	pub id: ConnectionId,
	pub uri: String,
	pub version: Negotiation,
	pub headers: Negotiation,
	pub protocol_version: Option<String>,
	/// Chain height reported by this server
	pub height: Option<u64>,
	pub addresses: HashMap<ScriptHash, AddressSubState>,
	/// Transactions this server listed in a history or UTXO reply
	pub txids: HashSet<Txid>,
	/// Heights of confirmed transactions this server listed
	pub heights: HashSet<u64>,
	/// Requests submitted and not yet answered
	pub in_flight: usize,
}

impl ServerState {
	fn new(id: ConnectionId, uri: String) -> Self {
		Self {
			id,
			uri,
			version: Negotiation::Idle,
			headers: Negotiation::Idle,
			protocol_version: None,
			height: None,
			addresses: HashMap::new(),
			txids: HashSet::new(),
			heights: HashSet::new(),
			in_flight: 0,
		}
	}

	pub fn address(&self, script_hash: &ScriptHash) -> Option<&AddressSubState> {
		self.addresses.get(script_hash)
	}
}

/// Settings the state needs out of the engine configuration
#[derive(Debug, Clone)]
pub struct StateSettings {
	pub client_name: String,
	pub protocol_version: String,
	pub min_protocol_version: String,
	pub task_failure_penalty: i64,
	pub disconnect_penalty: i64,
	pub progress_throttle: f64,
}

impl From<&EngineConfig> for StateSettings {
	fn from(config: &EngineConfig) -> Self {
		Self {
			client_name: config.connection.client_name.clone(),
			protocol_version: config.connection.protocol_version.clone(),
			min_protocol_version: config.pool.min_protocol_version.clone(),
			task_failure_penalty: config.pool.task_failure_penalty,
			disconnect_penalty: config.pool.disconnect_penalty,
			progress_throttle: config.progress_throttle,
		}
	}
}

pub struct EngineState {
	settings: StateSettings,
	pool: Arc<ServerPool>,
	codec: Arc<dyn TxCodec>,
	addresses: BTreeMap<ScriptHash, AddressRecord>,
	used_overrides: HashSet<ScriptHash>,
	address_infos: HashMap<ScriptHash, AddressInfo>,
	transactions: HashMap<Txid, TxRecord>,
	tx_heights: HashMap<Txid, TxHeightRecord>,
	servers: BTreeMap<ConnectionId, ServerState>,
	fetching_txids: HashMap<Txid, ConnectionId>,
	fetching_headers: HashMap<u64, ConnectionId>,
	progress: SyncProgressTracker,
	events: Vec<EngineEvent>,
	balance: u64,
	update_seq: u64,
	dirty: bool,
}

impl EngineState {
	pub fn new(settings: StateSettings, pool: Arc<ServerPool>, codec: Arc<dyn TxCodec>) -> Self {
		let progress = SyncProgressTracker::new(settings.progress_throttle);
		Self {
			settings,
			pool,
			codec,
			addresses: BTreeMap::new(),
			used_overrides: HashSet::new(),
			address_infos: HashMap::new(),
			transactions: HashMap::new(),
			tx_heights: HashMap::new(),
			servers: BTreeMap::new(),
			fetching_txids: HashMap::new(),
			fetching_headers: HashMap::new(),
			progress,
			events: Vec::new(),
			balance: 0,
			update_seq: 0,
			dirty: false,
		}
	}

	pub fn settings(&self) -> &StateSettings {
		&self.settings
	}

	pub fn pool(&self) -> &Arc<ServerPool> {
		&self.pool
	}

	/// Events recorded since the last call.
	pub fn take_events(&mut self) -> Vec<EngineEvent> {
		std::mem::take(&mut self.events)
	}

	/// Whether anything persisted changed since the last call.
	pub fn take_dirty(&mut self) -> bool {
		std::mem::replace(&mut self.dirty, false)
	}

	pub fn progress(&self) -> f64 {
		self.progress.ratio()
	}

	pub fn progress_tracker(&self) -> &SyncProgressTracker {
		&self.progress
	}

	pub fn addresses(&self) -> &BTreeMap<ScriptHash, AddressRecord> {
		&self.addresses
	}

	pub fn address_info(&self, script_hash: &ScriptHash) -> Option<&AddressInfo> {
		self.address_infos.get(script_hash)
	}

	pub fn is_used(&self, script_hash: &ScriptHash) -> bool {
		self.address_infos
			.get(script_hash)
			.is_some_and(|info| info.used)
	}

	pub fn balance(&self) -> u64 {
		self.balance
	}

	pub fn transaction(&self, txid: &Txid) -> Option<&TxRecord> {
		self.transactions.get(txid)
	}

	pub fn tx_height(&self, txid: &Txid) -> Option<TxHeightRecord> {
		self.tx_heights.get(txid).copied()
	}

	/// Distinct transactions referenced by the wallet's addresses.
	pub fn num_transactions(&self) -> usize {
		self.address_infos
			.values()
			.flat_map(|info| info.txids.iter())
			.collect::<HashSet<_>>()
			.len()
	}

	pub fn utxos(&self) -> Vec<WalletUtxo> {
		let mut utxos = Vec::new();
		for (script_hash, info) in &self.address_infos {
			for utxo in &info.utxos {
				utxos.push(WalletUtxo {
					script_hash: script_hash.clone(),
					display_address: info.display_address.clone(),
					path: info.path.clone(),
					utxo: utxo.clone(),
					height: self
						.tx_heights
						.get(&utxo.txid)
						.map(|record| record.height)
						.unwrap_or(UNCONFIRMED_HEIGHT),
				});
			}
		}
		utxos.sort_by(|a, b| a.utxo.outpoint().cmp(&b.utxo.outpoint()));
		utxos
	}

	pub fn server(&self, id: ConnectionId) -> Option<&ServerState> {
		self.servers.get(&id)
	}

	pub fn servers(&self) -> impl Iterator<Item = &ServerState> {
		self.servers.values()
	}

	/// Transactions referenced by any address record but not cached, in a
	/// stable order.
	pub fn missing_transactions(&self) -> BTreeSet<Txid> {
		let mut missing = BTreeSet::new();
		for record in self.addresses.values() {
			let referenced = record
				.txids
				.iter()
				.chain(record.utxos.iter().map(|utxo| &utxo.txid));
			for txid in referenced {
				if !self.transactions.contains_key(txid) {
					missing.insert(txid.clone());
				}
			}
		}
		missing
	}

	/// Heights of confirmed wallet transactions whose header is not cached.
	pub fn missing_headers(&self) -> BTreeSet<u64> {
		let mut missing = BTreeSet::new();
		for record in self.addresses.values() {
			for txid in &record.txids {
				if let Some(height) = self.tx_heights.get(txid).filter(|h| h.is_confirmed()) {
					let height = height.height as u64;
					if !self.pool.has_header(height) {
						missing.insert(height);
					}
				}
			}
		}
		missing
	}

	pub fn is_tx_claimed(&self, txid: &Txid) -> bool {
		self.fetching_txids.contains_key(txid)
	}

	pub fn is_header_claimed(&self, height: u64) -> bool {
		self.fetching_headers.contains_key(&height)
	}

	/// A transaction may be fetched from `server` if it advertises it, or if
	/// no connected server does.
	pub fn can_fetch_tx(&self, server: &ServerState, txid: &Txid) -> bool {
		server.txids.contains(txid) || !self.servers.values().any(|s| s.txids.contains(txid))
	}

	/// Same ownership rule as [`Self::can_fetch_tx`] for block headers.
	pub fn can_fetch_header(&self, server: &ServerState, height: u64) -> bool {
		server.heights.contains(&height)
			|| !self.servers.values().any(|s| s.heights.contains(&height))
	}

	/// Whether any server is fetching the UTXO list of this address.
	pub fn is_fetching_utxos(&self, script_hash: &ScriptHash) -> bool {
		self.servers
			.values()
			.any(|s| s.address(script_hash).is_some_and(|sub| sub.fetching_utxos))
	}

	pub fn is_fetching_history(&self, script_hash: &ScriptHash) -> bool {
		self.servers
			.values()
			.any(|s| s.address(script_hash).is_some_and(|sub| sub.fetching_history))
	}

	/// Whether `server` is the one to fetch an address from.
	///
	/// Across every server subscribed to the address, the one whose status
	/// changed most recently wins; ties go to the lowest uri, then connection
	/// id. Servers still reporting an older status never compete with it.
	pub fn is_best_server(&self, server: &ServerState, script_hash: &ScriptHash) -> bool {
		if !server.address(script_hash).is_some_and(|sub| sub.subscribed) {
			return false;
		}

		let best = self
			.servers
			.values()
			.filter_map(|s| {
				s.address(script_hash)
					.filter(|other| other.subscribed)
					.map(|other| (s, other))
			})
			.min_by(|(a, a_sub), (b, b_sub)| {
				b_sub
					.last_update
					.cmp(&a_sub.last_update)
					.then_with(|| a.uri.cmp(&b.uri))
					.then_with(|| a.id.cmp(&b.id))
			});

		best.is_some_and(|(best, _)| best.id == server.id)
	}

	/// An address is synced once some server's status matches both
	/// fingerprints of its record.
	pub fn is_address_synced(&self, script_hash: &ScriptHash) -> bool {
		let Some(record) = self.addresses.get(script_hash) else {
			return false;
		};
		self.servers.values().any(|s| {
			s.address(script_hash).is_some_and(|sub| {
				sub.subscribed
					&& sub.fingerprint == record.history_fingerprint
					&& sub.fingerprint == record.utxo_fingerprint
			})
		})
	}

	/// Start watching an address. Returns `false` when it is already known.
	pub fn add_address(
		&mut self,
		script_hash: ScriptHash,
		display_address: String,
		path: String,
	) -> bool {
		if self.addresses.contains_key(&script_hash) {
			return false;
		}

		debug!("Watching {} ({})", display_address, path);
		self.addresses.insert(
			script_hash.clone(),
			AddressRecord::new(display_address, path),
		);
		for server in self.servers.values_mut() {
			server.addresses.entry(script_hash.clone()).or_default();
		}
		self.dirty = true;
		self.refresh_address_info(&script_hash);
		self.update_progress();
		true
	}

	/// Force addresses to count as used, whatever their history says.
	pub fn mark_addresses_used(&mut self, script_hashes: &[ScriptHash]) {
		for script_hash in script_hashes {
			if !self.addresses.contains_key(script_hash) {
				warn!("Cannot mark unknown address {} as used", script_hash);
				continue;
			}
			if self.used_overrides.insert(script_hash.clone()) {
				self.dirty = true;
				self.refresh_address_info(script_hash);
			}
		}
	}

	/// Fold a locally built transaction into the caches before any server
	/// has seen it.
	pub fn save_tx(&mut self, raw: &[u8]) -> Result<Txid, WalletSyncError> {
		let parsed = self.codec.parse(raw)?;
		let txid = self.codec.txid(raw)?;

		let mut affected: BTreeSet<ScriptHash> = parsed
			.outputs
			.iter()
			.filter(|output| self.addresses.contains_key(&output.script_hash))
			.map(|output| output.script_hash.clone())
			.collect();
		let spent: HashSet<&OutPoint> = parsed.inputs.iter().collect();
		for (script_hash, record) in &self.addresses {
			let spends_record = record
				.utxos
				.iter()
				.any(|utxo| spent.contains(&utxo.outpoint()));
			let spends_info = self.address_infos.get(script_hash).is_some_and(|info| {
				info.utxos.iter().any(|utxo| spent.contains(&utxo.outpoint()))
			});
			if spends_record || spends_info {
				affected.insert(script_hash.clone());
			}
		}

		self.insert_transaction(txid.clone(), raw.to_vec(), parsed);
		for script_hash in &affected {
			if let Some(record) = self.addresses.get_mut(script_hash) {
				if !record.txids.contains(&txid) {
					record.txids.push(txid.clone());
				}
			}
		}
		self.dirty = true;
		for script_hash in &affected {
			self.refresh_address_info(script_hash);
		}
		self.update_progress();
		Ok(txid)
	}

	pub fn on_connection_opened(&mut self, id: ConnectionId, uri: String) {
		let mut server = ServerState::new(id, uri.clone());
		for script_hash in self.addresses.keys() {
			server.addresses.insert(script_hash.clone(), AddressSubState::default());
		}
		self.servers.insert(id, server);
		self.events.push(EngineEvent::Connected { server: uri });
	}

	/// Forget everything learned from a connection and release its claims.
	pub fn on_connection_closed(&mut self, id: ConnectionId, penalize: bool) {
		let Some(server) = self.servers.remove(&id) else {
			return;
		};
		if penalize {
			self.pool
				.server_score_down(&server.uri, self.settings.disconnect_penalty);
		}
		self.fetching_txids.retain(|_, owner| *owner != id);
		self.fetching_headers.retain(|_, owner| *owner != id);
		self.events.push(EngineEvent::Disconnected { server: server.uri });
	}

	/// Record that `task` was sent on connection `id`, claiming whatever it
	/// fetches so no other connection asks for the same thing.
	pub fn on_task_submitted(&mut self, id: ConnectionId, task: &Task) {
		let Some(server) = self.servers.get_mut(&id) else {
			return;
		};
		server.in_flight += 1;
		match task {
			Task::Version { .. } => server.version = Negotiation::Pending,
			Task::SubscribeHeaders => server.headers = Negotiation::Pending,
			Task::GetHeader { height } => {
				self.fetching_headers.insert(*height, id);
			}
			Task::GetTransaction { txid } => {
				self.fetching_txids.insert(txid.clone(), id);
			}
			Task::SubscribeScriptHash { script_hash } => {
				server.addresses.entry(script_hash.clone()).or_default().subscribing = true;
			}
			Task::GetHistory { script_hash, .. } => {
				server
					.addresses
					.entry(script_hash.clone())
					.or_default()
					.fetching_history = true;
			}
			Task::ListUnspent { script_hash, .. } => {
				server
					.addresses
					.entry(script_hash.clone())
					.or_default()
					.fetching_utxos = true;
			}
			Task::Broadcast { .. } | Task::EstimateFee { .. } | Task::Ping => {}
		}
	}

	pub fn on_task_completed(
		&mut self,
		id: ConnectionId,
		task: Task,
		result: TaskResult,
		latency: Duration,
	) {
		let Some(server) = self.servers.get_mut(&id) else {
			return;
		};
		server.in_flight = server.in_flight.saturating_sub(1);
		let uri = server.uri.clone();
		self.pool.server_score_up(&uri, latency);

		match (task, result) {
			(Task::Version { .. }, TaskResult::Version { server: name, protocol }) => {
				debug!("{} runs {} (protocol {})", uri, name, protocol);
				if let Some(server) = self.servers.get_mut(&id) {
					server.version = Negotiation::Done;
					server.protocol_version = Some(protocol);
				}
			}
			(Task::SubscribeHeaders, TaskResult::Headers(header)) => {
				if let Some(server) = self.servers.get_mut(&id) {
					server.headers = Negotiation::Done;
				}
				self.handle_header(id, header);
			}
			(Task::GetHeader { height }, TaskResult::BlockHeader(header)) => {
				self.release_header(id, height);
				self.handle_block_header(id, height, &header);
			}
			(Task::GetTransaction { txid }, TaskResult::Transaction(raw)) => {
				self.release_tx(id, &txid);
				self.handle_transaction(id, txid, &raw);
			}
			(Task::SubscribeScriptHash { script_hash }, TaskResult::ScriptHashStatus(status)) => {
				self.handle_status(id, script_hash, status);
			}
			(
				Task::GetHistory {
					script_hash,
					fingerprint,
				},
				TaskResult::History(entries),
			) => self.handle_history(id, script_hash, fingerprint, entries),
			(
				Task::ListUnspent {
					script_hash,
					fingerprint,
				},
				TaskResult::Unspent(entries),
			) => self.handle_utxos(id, script_hash, fingerprint, entries),
			(Task::Broadcast { .. }, _) | (Task::EstimateFee { .. }, _) | (Task::Ping, _) => {}
			(task, result) => {
				warn!(
					"Result {:?} does not match task {} from {}",
					result,
					task.method(),
					uri
				);
			}
		}

		self.update_progress();
	}

	pub fn on_task_failed(&mut self, id: ConnectionId, task: Task, error: TaskError) {
		let Some(server) = self.servers.get_mut(&id) else {
			return;
		};
		server.in_flight = server.in_flight.saturating_sub(1);
		let uri = server.uri.clone();
		// A refused broadcast says nothing about the server
		let ticketed = matches!(task, Task::Broadcast { .. } | Task::EstimateFee { .. });
		if error != TaskError::ConnectionClosed && !ticketed {
			warn!("{} failed on {}: {}", task.method(), uri, error);
			self.pool
				.server_score_down(&uri, self.settings.task_failure_penalty);
		}

		match task {
			Task::Version { .. } => {
				if let Some(server) = self.servers.get_mut(&id) {
					server.version = Negotiation::Failed;
				}
			}
			Task::SubscribeHeaders => {
				if let Some(server) = self.servers.get_mut(&id) {
					server.headers = Negotiation::Idle;
				}
			}
			Task::GetHeader { height } => {
				self.release_header(id, height);
				if let Some(server) = self.servers.get_mut(&id) {
					server.heights.remove(&height);
				}
			}
			Task::GetTransaction { txid } => {
				self.release_tx(id, &txid);
				if let Some(server) = self.servers.get_mut(&id) {
					server.txids.remove(&txid);
				}
			}
			Task::SubscribeScriptHash { script_hash } => {
				if let Some(sub) = self.sub_state_mut(id, &script_hash) {
					sub.subscribing = false;
				}
			}
			Task::GetHistory { script_hash, .. } => {
				if let Some(sub) = self.sub_state_mut(id, &script_hash) {
					sub.fetching_history = false;
				}
			}
			Task::ListUnspent { script_hash, .. } => {
				if let Some(sub) = self.sub_state_mut(id, &script_hash) {
					sub.fetching_utxos = false;
				}
			}
			Task::Broadcast { .. } | Task::EstimateFee { .. } | Task::Ping => {}
		}
	}

	pub fn on_notification(&mut self, id: ConnectionId, notification: Notification) {
		match notification {
			Notification::Headers(header) => self.handle_header(id, header),
			Notification::ScriptHash {
				script_hash,
				status,
			} => self.handle_status(id, script_hash, status),
		}
		self.update_progress();
	}

	fn handle_header(&mut self, id: ConnectionId, header: HeaderNotification) {
		if let Some(server) = self.servers.get_mut(&id) {
			server.height = Some(header.height);
		}
		match self.pool.add_header(header.height, &header.hex) {
			Ok(true) => self.dirty = true,
			Ok(false) => {}
			Err(e) => warn!("Ignoring invalid tip header at {}: {}", header.height, e),
		}
		if self.pool.update_best_height(header.height) {
			self.events.push(EngineEvent::BlockHeightChanged {
				height: header.height,
			});
		}
	}

	fn handle_block_header(&mut self, id: ConnectionId, height: u64, header: &str) {
		match self.pool.add_header(height, header) {
			Ok(true) => {
				self.progress.record_header();
				self.dirty = true;
			}
			Ok(false) => {}
			Err(e) => {
				warn!("Invalid header at {}: {}", height, e);
				if let Some(server) = self.servers.get_mut(&id) {
					server.heights.remove(&height);
					let uri = server.uri.clone();
					self.pool
						.server_score_down(&uri, self.settings.task_failure_penalty);
				}
			}
		}
	}

	fn handle_transaction(&mut self, id: ConnectionId, txid: Txid, raw_hex: &str) {
		if self.transactions.contains_key(&txid) {
			return;
		}

		let decoded = hex::decode(raw_hex)
			.map_err(crate::codec::CodecError::from)
			.and_then(|raw| {
				let computed = self.codec.txid(&raw)?;
				let parsed = self.codec.parse(&raw)?;
				Ok((raw, computed, parsed))
			});
		let (raw, parsed) = match decoded {
			Ok((raw, computed, parsed)) if computed == txid => (raw, parsed),
			Ok((_, computed, _)) => {
				warn!("Server returned {} when asked for {}", computed, txid);
				self.reject_tx_from(id, &txid);
				return;
			}
			Err(e) => {
				warn!("Undecodable transaction {}: {}", txid, e);
				self.reject_tx_from(id, &txid);
				return;
			}
		};

		self.insert_transaction(txid.clone(), raw, parsed);
		self.dirty = true;

		let affected: Vec<ScriptHash> = self
			.addresses
			.iter()
			.filter(|(_, record)| record.references(&txid))
			.map(|(script_hash, _)| script_hash.clone())
			.collect();
		for script_hash in &affected {
			self.refresh_address_info(script_hash);
		}
	}

	fn handle_status(&mut self, id: ConnectionId, script_hash: ScriptHash, status: Option<String>) {
		if !self.addresses.contains_key(&script_hash) {
			debug!("Status for unwatched address {}", script_hash);
			return;
		}
		self.update_seq += 1;
		let seq = self.update_seq;
		let Some(sub) = self.sub_state_mut(id, &script_hash) else {
			return;
		};
		sub.subscribing = false;
		sub.subscribed = true;
		if sub.fingerprint != status || sub.last_update == 0 {
			sub.fingerprint = status;
			sub.last_update = seq;
		}
	}

	fn handle_history(
		&mut self,
		id: ConnectionId,
		script_hash: ScriptHash,
		fingerprint: Option<String>,
		entries: Vec<HistoryEntry>,
	) {
		if let Some(sub) = self.sub_state_mut(id, &script_hash) {
			sub.fetching_history = false;
		}
		if !self.addresses.contains_key(&script_hash) {
			return;
		}

		let mut txids = Vec::with_capacity(entries.len());
		for entry in entries {
			let height = normalize_height(entry.height);
			if let Some(server) = self.servers.get_mut(&id) {
				server.txids.insert(entry.tx_hash.clone());
				if height > 0 {
					server.heights.insert(height as u64);
				}
			}
			self.upsert_height(&entry.tx_hash, height, true);
			if !txids.contains(&entry.tx_hash) {
				txids.push(entry.tx_hash);
			}
		}

		if let Some(record) = self.addresses.get_mut(&script_hash) {
			if record.txids != txids || record.history_fingerprint != fingerprint {
				record.txids = txids;
				record.history_fingerprint = fingerprint;
				self.dirty = true;
			}
		}
		self.refresh_address_info(&script_hash);
	}

	fn handle_utxos(
		&mut self,
		id: ConnectionId,
		script_hash: ScriptHash,
		fingerprint: Option<String>,
		entries: Vec<UnspentEntry>,
	) {
		if let Some(sub) = self.sub_state_mut(id, &script_hash) {
			sub.fetching_utxos = false;
		}
		if !self.addresses.contains_key(&script_hash) {
			return;
		}

		let mut utxos: Vec<UtxoRef> = Vec::with_capacity(entries.len());
		for entry in entries {
			let height = normalize_height(entry.height);
			if let Some(server) = self.servers.get_mut(&id) {
				server.txids.insert(entry.tx_hash.clone());
				if height > 0 {
					server.heights.insert(height as u64);
				}
			}
			self.upsert_height(&entry.tx_hash, height, false);
			let utxo = UtxoRef {
				txid: entry.tx_hash,
				index: entry.tx_pos,
				value: entry.value,
			};
			if !utxos
				.iter()
				.any(|known| known.txid == utxo.txid && known.index == utxo.index)
			{
				utxos.push(utxo);
			}
		}

		if let Some(record) = self.addresses.get_mut(&script_hash) {
			if record.utxos != utxos || record.utxo_fingerprint != fingerprint {
				record.utxos = utxos;
				record.utxo_fingerprint = fingerprint;
				self.dirty = true;
			}
		}
		self.refresh_address_info(&script_hash);
	}

	/// Recompute the derived view of one address from scratch.
	///
	/// Only transactions in the cache are considered. Outputs of the
	/// address's unconfirmed transactions that the server's UTXO list does
	/// not show yet are added, and outputs those transactions spend are
	/// removed.
	pub fn refresh_address_info(&mut self, script_hash: &ScriptHash) {
		let Some(record) = self.addresses.get(script_hash) else {
			return;
		};

		let used = self.used_overrides.contains(script_hash)
			|| !record.txids.is_empty()
			|| !record.utxos.is_empty();

		let txids: Vec<Txid> = record
			.txids
			.iter()
			.filter(|txid| self.transactions.contains_key(*txid))
			.cloned()
			.collect();
		let mut utxos: Vec<UtxoRef> = record
			.utxos
			.iter()
			.filter(|utxo| self.transactions.contains_key(&utxo.txid))
			.cloned()
			.collect();

		let pending: Vec<&Txid> = txids
			.iter()
			.filter(|txid| {
				self.tx_heights
					.get(*txid)
					.map_or(true, |record| !record.is_confirmed())
			})
			.collect();

		for txid in &pending {
			if utxos.iter().any(|utxo| &utxo.txid == *txid) {
				continue;
			}
			if let Some(tx) = self.transactions.get(*txid) {
				for (index, output) in tx.parsed.outputs.iter().enumerate() {
					if &output.script_hash == script_hash {
						utxos.push(UtxoRef {
							txid: (*txid).clone(),
							index: index as u32,
							value: output.value,
						});
					}
				}
			}
		}

		let spent: HashSet<&OutPoint> = pending
			.iter()
			.filter_map(|txid| self.transactions.get(*txid))
			.flat_map(|tx| tx.parsed.inputs.iter())
			.collect();
		utxos.retain(|utxo| !spent.contains(&utxo.outpoint()));

		let balance = utxos.iter().map(|utxo| utxo.value).sum();
		let info = AddressInfo {
			display_address: record.display_address.clone(),
			path: record.path.clone(),
			txids,
			utxos,
			balance,
			used,
		};

		let previous = self.address_infos.insert(script_hash.clone(), info);
		let was_used = previous.as_ref().is_some_and(|info| info.used);
		if previous.is_none() || was_used != used {
			if previous.is_some() || used {
				self.events.push(EngineEvent::AddressUsedChanged {
					script_hash: script_hash.clone(),
					used,
				});
			}
		}

		let total: u64 = self.address_infos.values().map(|info| info.balance).sum();
		if total != self.balance {
			self.balance = total;
			self.events.push(EngineEvent::BalanceChanged { balance: total });
		}
	}

	/// Recompute sync progress and record a `ProgressChanged` when due.
	pub fn update_progress(&mut self) {
		let missing_addresses = self
			.addresses
			.keys()
			.filter(|script_hash| !self.is_address_synced(script_hash))
			.count();
		let missing = self.missing_transactions().len() + missing_addresses;
		if let Some(ratio) = self.progress.update(missing) {
			self.events.push(EngineEvent::ProgressChanged { ratio });
		}
	}

	pub fn snapshot(&self) -> CacheSnapshot {
		CacheSnapshot {
			addresses: self
				.addresses
				.iter()
				.map(|(script_hash, record)| PersistedAddress {
					script_hash: script_hash.clone(),
					record: record.clone(),
					used: self.used_overrides.contains(script_hash),
				})
				.collect(),
			transactions: self
				.transactions
				.iter()
				.map(|(txid, tx)| (txid.clone(), hex::encode(&tx.raw)))
				.collect(),
			tx_heights: self
				.tx_heights
				.iter()
				.map(|(txid, height)| (txid.clone(), *height))
				.collect(),
			headers: self.pool.snapshot_headers(),
			servers: self.pool.snapshot_servers(),
		}
	}

	/// Load persisted caches. Unreadable transactions are dropped and will be
	/// fetched again.
	pub fn restore(&mut self, snapshot: CacheSnapshot) {
		self.pool.restore_servers(snapshot.servers);
		self.pool.restore_headers(snapshot.headers);

		for (txid, raw_hex) in snapshot.transactions {
			let parsed = hex::decode(&raw_hex)
				.map_err(crate::codec::CodecError::from)
				.and_then(|raw| self.codec.parse(&raw).map(|parsed| (raw, parsed)));
			match parsed {
				Ok((raw, parsed)) => {
					self.transactions.insert(txid, TxRecord { raw, parsed });
				}
				Err(e) => warn!("Dropping cached transaction {}: {}", txid, e),
			}
		}
		self.tx_heights.extend(snapshot.tx_heights);

		for address in snapshot.addresses {
			if address.used {
				self.used_overrides.insert(address.script_hash.clone());
			}
			self.addresses
				.insert(address.script_hash, address.record);
		}

		let script_hashes: Vec<ScriptHash> = self.addresses.keys().cloned().collect();
		for script_hash in &script_hashes {
			self.refresh_address_info(script_hash);
		}
		self.update_progress();
	}

	fn insert_transaction(&mut self, txid: Txid, raw: Vec<u8>, parsed: crate::wallet::ParsedTx) {
		if self.transactions.contains_key(&txid) {
			return;
		}
		self.transactions
			.insert(txid.clone(), TxRecord { raw, parsed });
		self.tx_heights.entry(txid.clone()).or_insert(TxHeightRecord {
			height: UNCONFIRMED_HEIGHT,
			first_seen: chrono::Utc::now().timestamp(),
		});
		self.progress.record_transaction();
		self.events.push(EngineEvent::TransactionFetched { txid });
	}

	/// Store a height reported by a server. With `overwrite` unset an
	/// existing height is kept.
	fn upsert_height(&mut self, txid: &Txid, height: i64, overwrite: bool) {
		match self.tx_heights.get_mut(txid) {
			Some(record) if record.height != height && overwrite => {
				record.height = height;
				self.dirty = true;
				self.events.push(EngineEvent::TransactionHeightChanged {
					txid: txid.clone(),
					height,
				});
			}
			Some(_) => {}
			None => {
				self.tx_heights.insert(
					txid.clone(),
					TxHeightRecord {
						height,
						first_seen: chrono::Utc::now().timestamp(),
					},
				);
				self.dirty = true;
			}
		}
	}

	fn reject_tx_from(&mut self, id: ConnectionId, txid: &Txid) {
		if let Some(server) = self.servers.get_mut(&id) {
			server.txids.remove(txid);
			let uri = server.uri.clone();
			self.pool
				.server_score_down(&uri, self.settings.task_failure_penalty);
		}
	}

	fn release_tx(&mut self, id: ConnectionId, txid: &Txid) {
		if self.fetching_txids.get(txid) == Some(&id) {
			self.fetching_txids.remove(txid);
		}
	}

	fn release_header(&mut self, id: ConnectionId, height: u64) {
		if self.fetching_headers.get(&height) == Some(&id) {
			self.fetching_headers.remove(&height);
		}
	}

	fn sub_state_mut(
		&mut self,
		id: ConnectionId,
		script_hash: &ScriptHash,
	) -> Option<&mut AddressSubState> {
		self.servers
			.get_mut(&id)
			.map(|server| server.addresses.entry(script_hash.clone()).or_default())
	}
}

/// Servers report mempool transactions with height 0 or -1.
fn normalize_height(height: i64) -> i64 {
	if height <= 0 { UNCONFIRMED_HEIGHT } else { height }
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::codec::tx::build_raw_tx;
	use crate::codec::{BitcoinTxCodec, script_hash};
	use crate::config::PoolConfig;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	pub(crate) const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

	pub(crate) fn new_state() -> EngineState {
		let pool = Arc::new(ServerPool::with_rng(
			&PoolConfig::default(),
			StdRng::seed_from_u64(1),
		));
		EngineState::new(
			StateSettings::from(&EngineConfig::default()),
			pool,
			Arc::new(BitcoinTxCodec::new()),
		)
	}

	pub(crate) fn script(n: u8) -> Vec<u8> {
		vec![0x51, n]
	}

	pub(crate) fn sh(n: u8) -> ScriptHash {
		script_hash(&script(n))
	}

	/// A raw transaction paying `value` to each script, plus its txid.
	pub(crate) fn tx_paying(inputs: &[(Txid, u32)], outputs: &[(u8, u64)]) -> (Txid, Vec<u8>) {
		let outputs: Vec<(Vec<u8>, u64)> =
			outputs.iter().map(|(n, value)| (script(*n), *value)).collect();
		let raw = build_raw_tx(inputs, &outputs);
		let txid = BitcoinTxCodec::new().txid(&raw).unwrap();
		(txid, raw)
	}

	pub(crate) fn connect(state: &mut EngineState, id: u64) -> ConnectionId {
		let id = ConnectionId(id);
		state.on_connection_opened(id, format!("electrum://server{}:50001", id.0));
		id
	}

	fn complete(state: &mut EngineState, id: ConnectionId, task: Task, result: TaskResult) {
		state.on_task_submitted(id, &task);
		state.on_task_completed(id, task, result, Duration::from_millis(5));
	}

	fn history(txids: &[(&Txid, i64)]) -> TaskResult {
		TaskResult::History(
			txids
				.iter()
				.map(|(txid, height)| HistoryEntry {
					tx_hash: (*txid).clone(),
					height: *height,
					fee: None,
				})
				.collect(),
		)
	}

	fn unspent(utxos: &[(&Txid, u32, u64, i64)]) -> TaskResult {
		TaskResult::Unspent(
			utxos
				.iter()
				.map(|(txid, pos, value, height)| UnspentEntry {
					tx_hash: (*txid).clone(),
					tx_pos: *pos,
					height: *height,
					value: *value,
				})
				.collect(),
		)
	}

	#[test]
	fn test_history_and_utxos_drive_balance() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		let id = connect(&mut state, 1);

		let (funding, raw) = tx_paying(&[(Txid::new("00".repeat(32)), 0)], &[(1, 5000), (9, 100)]);
		complete(
			&mut state,
			id,
			Task::GetHistory {
				script_hash: sh(1),
				fingerprint: Some("s1".into()),
			},
			history(&[(&funding, 100)]),
		);
		complete(
			&mut state,
			id,
			Task::ListUnspent {
				script_hash: sh(1),
				fingerprint: Some("s1".into()),
			},
			unspent(&[(&funding, 0, 5000, 100)]),
		);
		// Transaction not cached yet: nothing counted
		assert_eq!(state.balance(), 0);
		assert!(state.missing_transactions().contains(&funding));

		complete(
			&mut state,
			id,
			Task::GetTransaction {
				txid: funding.clone(),
			},
			TaskResult::Transaction(hex::encode(&raw)),
		);
		assert_eq!(state.balance(), 5000);
		assert!(state.is_used(&sh(1)));
		assert_eq!(state.num_transactions(), 1);
		assert_eq!(state.tx_height(&funding).unwrap().height, 100);
		assert!(state.missing_headers().contains(&100));

		let events = state.take_events();
		assert!(events.contains(&EngineEvent::BalanceChanged { balance: 5000 }));
		assert!(events.contains(&EngineEvent::AddressUsedChanged {
			script_hash: sh(1),
			used: true
		}));
		assert!(events.contains(&EngineEvent::TransactionFetched { txid: funding }));
	}

	#[test]
	fn test_pending_spend_and_change_are_folded_in() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		state.add_address(sh(2), "addr2".into(), "m/1/0".into());
		let id = connect(&mut state, 1);

		let (funding, funding_raw) =
			tx_paying(&[(Txid::new("00".repeat(32)), 0)], &[(1, 10_000)]);
		let (spend, spend_raw) = tx_paying(&[(funding.clone(), 0)], &[(7, 6_000), (2, 3_000)]);

		for (txid, raw) in [(&funding, &funding_raw), (&spend, &spend_raw)] {
			complete(
				&mut state,
				id,
				Task::GetTransaction { txid: txid.clone() },
				TaskResult::Transaction(hex::encode(raw)),
			);
		}

		// Server still lists the spent output and does not know the change
		complete(
			&mut state,
			id,
			Task::GetHistory {
				script_hash: sh(1),
				fingerprint: None,
			},
			history(&[(&funding, 50), (&spend, 0)]),
		);
		complete(
			&mut state,
			id,
			Task::ListUnspent {
				script_hash: sh(1),
				fingerprint: None,
			},
			unspent(&[(&funding, 0, 10_000, 50)]),
		);
		complete(
			&mut state,
			id,
			Task::GetHistory {
				script_hash: sh(2),
				fingerprint: None,
			},
			history(&[(&spend, -1)]),
		);

		assert_eq!(state.address_info(&sh(1)).unwrap().balance, 0);
		assert_eq!(state.address_info(&sh(2)).unwrap().balance, 3_000);
		assert_eq!(state.balance(), 3_000);
		assert_eq!(state.tx_height(&spend).unwrap().height, UNCONFIRMED_HEIGHT);

		let utxos = state.utxos();
		assert_eq!(utxos.len(), 1);
		assert_eq!(utxos[0].utxo.index, 1);
		assert_eq!(utxos[0].height, UNCONFIRMED_HEIGHT);
	}

	#[test]
	fn test_handlers_are_idempotent() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		let id = connect(&mut state, 1);
		let (funding, raw) = tx_paying(&[(Txid::new("00".repeat(32)), 0)], &[(1, 700)]);

		let apply = |state: &mut EngineState| {
			complete(
				state,
				id,
				Task::GetHistory {
					script_hash: sh(1),
					fingerprint: Some("s".into()),
				},
				history(&[(&funding, 10), (&funding, 10)]),
			);
			complete(
				state,
				id,
				Task::GetTransaction {
					txid: funding.clone(),
				},
				TaskResult::Transaction(hex::encode(&raw)),
			);
		};

		apply(&mut state);
		let first = state.snapshot();
		state.take_events();
		state.take_dirty();

		apply(&mut state);
		let second = state.snapshot();
		assert_eq!(second.addresses, first.addresses);
		assert_eq!(second.transactions, first.transactions);
		assert_eq!(second.tx_heights, first.tx_heights);
		assert_eq!(first.addresses[0].record.txids, vec![funding.clone()]);
		assert!(state.take_events().is_empty());
		assert!(!state.take_dirty());
	}

	#[test]
	fn test_height_change_is_reported() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		let id = connect(&mut state, 1);
		let txid = Txid::new("ab".repeat(32));

		complete(
			&mut state,
			id,
			Task::GetHistory {
				script_hash: sh(1),
				fingerprint: Some("a".into()),
			},
			history(&[(&txid, 0)]),
		);
		state.take_events();
		complete(
			&mut state,
			id,
			Task::GetHistory {
				script_hash: sh(1),
				fingerprint: Some("b".into()),
			},
			history(&[(&txid, 812)]),
		);
		assert!(state.take_events().contains(&EngineEvent::TransactionHeightChanged {
			txid,
			height: 812
		}));
	}

	#[test]
	fn test_mismatched_transaction_is_rejected() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		let id = connect(&mut state, 1);
		let (wanted, _) = tx_paying(&[(Txid::new("00".repeat(32)), 0)], &[(1, 1)]);
		let (_, other_raw) = tx_paying(&[(Txid::new("00".repeat(32)), 1)], &[(1, 2)]);

		complete(
			&mut state,
			id,
			Task::GetHistory {
				script_hash: sh(1),
				fingerprint: None,
			},
			history(&[(&wanted, 5)]),
		);
		complete(
			&mut state,
			id,
			Task::GetTransaction {
				txid: wanted.clone(),
			},
			TaskResult::Transaction(hex::encode(other_raw)),
		);

		assert!(state.transaction(&wanted).is_none());
		assert!(!state.server(id).unwrap().txids.contains(&wanted));
		assert!(!state.is_tx_claimed(&wanted));
	}

	#[test]
	fn test_mark_used_and_save_tx() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		state.add_address(sh(2), "addr2".into(), "m/0/1".into());
		assert!(!state.is_used(&sh(2)));

		state.mark_addresses_used(&[sh(2)]);
		assert!(state.is_used(&sh(2)));
		assert!(state.take_events().contains(&EngineEvent::AddressUsedChanged {
			script_hash: sh(2),
			used: true
		}));

		let (txid, raw) = tx_paying(&[(Txid::new("00".repeat(32)), 0)], &[(1, 42)]);
		assert_eq!(state.save_tx(&raw).unwrap(), txid);
		assert_eq!(state.balance(), 42);
		assert!(state.is_used(&sh(1)));
		assert_eq!(state.tx_height(&txid).unwrap().height, UNCONFIRMED_HEIGHT);

		// Spending the saved output from elsewhere takes it back out
		let (_, spend) = tx_paying(&[(txid, 0)], &[(9, 40)]);
		state.save_tx(&spend).unwrap();
		assert_eq!(state.balance(), 0);
		assert_eq!(state.address_info(&sh(1)).unwrap().txids.len(), 2);
	}

	#[test]
	fn test_connection_close_releases_claims() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		let id = connect(&mut state, 1);
		let txid = Txid::new("cd".repeat(32));
		state.on_task_submitted(id, &Task::GetTransaction { txid: txid.clone() });
		state.on_task_submitted(id, &Task::GetHeader { height: 3 });
		assert!(state.is_tx_claimed(&txid));

		state.on_connection_closed(id, true);
		assert!(!state.is_tx_claimed(&txid));
		assert!(!state.is_header_claimed(3));
		assert!(state.server(id).is_none());
		assert_eq!(
			state.pool().score("electrum://server1:50001"),
			Some(-PoolConfig::default().disconnect_penalty)
		);
	}

	#[test]
	fn test_progress_reaches_one_when_synced() {
		let mut state = new_state();
		state.add_address(sh(1), "addr1".into(), "m/0/0".into());
		let id = connect(&mut state, 1);
		state.take_events();

		complete(
			&mut state,
			id,
			Task::SubscribeScriptHash { script_hash: sh(1) },
			TaskResult::ScriptHashStatus(None),
		);
		assert!(state.is_address_synced(&sh(1)));
		assert_eq!(state.progress(), 1.0);
		assert!(state
			.take_events()
			.contains(&EngineEvent::ProgressChanged { ratio: 1.0 }));
	}

	#[test]
	fn test_tip_header_updates_best_height() {
		let mut state = new_state();
		let id = connect(&mut state, 1);
		complete(
			&mut state,
			id,
			Task::SubscribeHeaders,
			TaskResult::Headers(HeaderNotification {
				height: 0,
				hex: GENESIS_HEADER.to_string(),
			}),
		);
		state.on_notification(
			id,
			Notification::Headers(HeaderNotification {
				height: 5,
				hex: GENESIS_HEADER.to_string(),
			}),
		);
		assert_eq!(state.pool().best_height(), 5);
		assert_eq!(state.server(id).unwrap().height, Some(5));
		assert!(state.pool().has_header(0));
		assert!(state
			.take_events()
			.contains(&EngineEvent::BlockHeightChanged { height: 5 }));
	}
}
