//! Wallet sync engine and integration point for all sync services.
//!
//! `SyncEngine` is a tokio task that owns one wallet's [`EngineState`], its
//! live connections and its persistence. Every connection event, timer and
//! API call is handled on that single task, so the caches have exactly one
//! writer. Callers talk to it through the cloneable [`SyncEngineHandle`].
//!
//! The engine is responsible for:
//! - Keeping up to `max_connections` servers connected, reconnecting with backoff
//! - Feeding each connection the scheduler's picks while it has queue space
//! - Resolving broadcast and fee estimate requests
//! - Dispatching engine events to registered handlers
//! - Flushing caches to disk when dirty

use super::events::{ChannelEventHandler, EngineEvent, EngineEventHandler, EventDispatcher};
use super::scheduler::{Pick, pick_next_task};
use super::server_pool::{Reconnector, ServerPool};
use super::state::{EngineState, StateSettings};
use super::state_persistence::{FlushPolicy, StatePersistenceService};
use crate::codec::TxCodec;
use crate::config::EngineConfig;
use crate::protocol::{
	Connection, ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionId, ServerUri, Task,
	TaskError, TaskResult, TicketId,
};
use crate::utils::coin_per_kb_to_sat_per_vbyte;
use crate::wallet::broadcast::{BroadcastError, Broadcaster, HttpBroadcaster, first_success};
use crate::wallet::keys::AddressWatcher;
use crate::wallet::{
	AddressInfo, AddressRecord, ScriptHash, Txid, WalletSyncError, WalletUtxo,
};

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the engine event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How often the flush policy is consulted
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<T>;
type BroadcastReply = oneshot::Receiver<Result<Txid, BroadcastError>>;

enum EngineCommand {
	AddAddress {
		script_hash: ScriptHash,
		display_address: String,
		path: String,
		reply: Reply<bool>,
	},
	MarkUsed {
		script_hashes: Vec<ScriptHash>,
		reply: Reply<()>,
	},
	Connect {
		reply: Reply<()>,
	},
	Disconnect {
		reply: Reply<()>,
	},
	Broadcast {
		raw_hex: String,
		reply: Reply<Vec<BroadcastReply>>,
	},
	SaveTx {
		raw: Vec<u8>,
		reply: Reply<Result<Txid, WalletSyncError>>,
	},
	EstimateFee {
		blocks: u32,
		reply: Reply<Result<Option<f64>, WalletSyncError>>,
	},
	Balance {
		reply: Reply<u64>,
	},
	Utxos {
		reply: Reply<Vec<WalletUtxo>>,
	},
	NumTransactions {
		reply: Reply<usize>,
	},
	AddressInfo {
		script_hash: ScriptHash,
		reply: Reply<Option<AddressInfo>>,
	},
	AddressRecords {
		reply: Reply<BTreeMap<ScriptHash, AddressRecord>>,
	},
	UsedFlags {
		script_hashes: Vec<ScriptHash>,
		reply: Reply<Vec<bool>>,
	},
	Progress {
		reply: Reply<f64>,
	},
}

/// A caller waiting on a forced submission
enum Ticket {
	Broadcast {
		uri: String,
		reply: Reply<Result<Txid, BroadcastError>>,
	},
	Fee {
		reply: Reply<Result<Option<f64>, WalletSyncError>>,
	},
}

impl Ticket {
	fn cancel(self) {
		match self {
			Ticket::Broadcast { reply, .. } => {
				let _ = reply.send(Err(BroadcastError::Cancelled));
			}
			Ticket::Fee { reply } => {
				let _ = reply.send(Err(WalletSyncError::NotConnected));
			}
		}
	}
}

pub struct SyncEngine {
	config: EngineConfig,
	state: EngineState,
	pool: Arc<ServerPool>,
	connections: HashMap<ConnectionId, ConnectionHandle>,
	next_connection_id: u64,
	connection_events: mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>,
	connection_events_rx: mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>,
	events: broadcast::Sender<EngineEvent>,
	dispatcher: EventDispatcher,
	persistence: Option<StatePersistenceService>,
	flush_policy: FlushPolicy,
	dirty: bool,
	reconnector: Reconnector,
	reconnect_at: Option<Instant>,
	/// Whether the caller wants to be connected
	wanted: bool,
	/// Servers dropped by the scheduler this session
	rejected: HashSet<String>,
	tickets: HashMap<TicketId, Ticket>,
	next_ticket: TicketId,
	disconnect_waiters: Vec<Reply<()>>,
	broadcasters: Vec<Arc<dyn Broadcaster>>,
}

impl SyncEngine {
	/// Create an engine for one wallet. The pool may be shared with other
	/// engines of the same currency.
	pub fn new(
		config: EngineConfig,
		pool: Arc<ServerPool>,
		codec: Arc<dyn TxCodec>,
	) -> Result<Self, WalletSyncError> {
		let state = EngineState::new(StateSettings::from(&config), pool.clone(), codec);
		let persistence = config
			.persistence
			.enabled
			.then(|| StatePersistenceService::new(config.persistence.data_dir.clone()));

		let mut broadcasters: Vec<Arc<dyn Broadcaster>> = Vec::new();
		for url in &config.http_broadcasters {
			broadcasters.push(Arc::new(HttpBroadcaster::new(url.clone())?));
		}

		let (connection_events, connection_events_rx) = mpsc::unbounded_channel();
		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let mut dispatcher = EventDispatcher::new();
		dispatcher.register_handler(Box::new(ChannelEventHandler::new(events.clone())));

		Ok(Self {
			flush_policy: FlushPolicy::new(&config.persistence),
			reconnector: Reconnector::new(&config.pool),
			config,
			state,
			pool,
			connections: HashMap::new(),
			next_connection_id: 1,
			connection_events,
			connection_events_rx,
			events,
			dispatcher,
			persistence,
			dirty: false,
			reconnect_at: None,
			wanted: false,
			rejected: HashSet::new(),
			tickets: HashMap::new(),
			next_ticket: 1,
			disconnect_waiters: Vec::new(),
			broadcasters,
		})
	}

	/// Register an additional event handler. Handlers run on the engine task
	/// after the event was forwarded to [`SyncEngineHandle::subscribe_events`].
	pub fn register_handler(&mut self, handler: Box<dyn EngineEventHandler>) {
		self.dispatcher.register_handler(handler);
	}

	/// Add an extra broadcast backend next to the configured HTTP endpoints.
	pub fn add_broadcaster(&mut self, broadcaster: Arc<dyn Broadcaster>) {
		self.broadcasters.push(broadcaster);
	}

	/// Load persisted caches, register the configured servers and start the
	/// engine task. The engine stays idle until [`SyncEngineHandle::connect`].
	pub async fn start(mut self) -> Result<SyncEngineHandle, WalletSyncError> {
		if let Some(persistence) = &self.persistence {
			let snapshot = persistence.load().await?;
			info!(
				"Loaded {} addresses and {} transactions from cache",
				snapshot.addresses.len(),
				snapshot.transactions.len()
			);
			self.state.restore(snapshot);
			self.state.take_dirty();
		}
		let added = self.pool.add_servers(&self.config.servers);
		debug!("Registered {} new servers", added);

		let (commands_tx, commands) = mpsc::unbounded_channel();
		let handle = SyncEngineHandle {
			commands: commands_tx,
			events: self.events.clone(),
			broadcasters: Arc::new(self.broadcasters.clone()),
		};
		tokio::spawn(self.run(commands));
		Ok(handle)
	}

	/// Runs until every handle is dropped.
	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
		let mut flush_check = tokio::time::interval(FLUSH_CHECK_INTERVAL);
		flush_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			let reconnect_at = self.reconnect_at;
			let reconnect = async move {
				match reconnect_at {
					Some(at) => tokio::time::sleep_until(at).await,
					None => std::future::pending().await,
				}
			};

			tokio::select! {
				Some((id, event)) = self.connection_events_rx.recv() => {
					self.handle_connection_event(id, event).await;
				}
				command = commands.recv() => match command {
					Some(command) => self.handle_command(command).await,
					None => break,
				},
				_ = reconnect => {
					self.reconnect_at = None;
					self.fill_connections();
				}
				_ = flush_check.tick() => self.maybe_flush().await,
			}

			let events = self.state.take_events();
			if !events.is_empty() {
				self.dispatcher.dispatch_all(events).await;
			}
		}

		info!("All engine handles dropped, shutting down");
		for handle in self.connections.values() {
			handle.close();
		}
		self.flush().await;
	}

	async fn handle_command(&mut self, command: EngineCommand) {
		match command {
			EngineCommand::AddAddress {
				script_hash,
				display_address,
				path,
				reply,
			} => {
				let added = self.state.add_address(script_hash, display_address, path);
				let _ = reply.send(added);
				self.fill_all_queues();
			}
			EngineCommand::MarkUsed {
				script_hashes,
				reply,
			} => {
				self.state.mark_addresses_used(&script_hashes);
				let _ = reply.send(());
				self.fill_all_queues();
			}
			EngineCommand::Connect { reply } => {
				info!("Connecting to up to {} servers", self.config.pool.max_connections);
				self.wanted = true;
				self.reconnect_at = None;
				self.reconnector.reset();
				self.fill_connections();
				let _ = reply.send(());
			}
			EngineCommand::Disconnect { reply } => {
				info!("Disconnecting from {} servers", self.connections.len());
				self.wanted = false;
				self.reconnect_at = None;
				for handle in self.connections.values() {
					handle.close();
				}
				self.disconnect_waiters.push(reply);
				self.finish_disconnect_if_idle().await;
			}
			EngineCommand::Broadcast { raw_hex, reply } => {
				let receivers = self.submit_broadcast(&raw_hex);
				let _ = reply.send(receivers);
			}
			EngineCommand::SaveTx { raw, reply } => {
				let _ = reply.send(self.state.save_tx(&raw));
				self.fill_all_queues();
			}
			EngineCommand::EstimateFee { blocks, reply } => self.submit_fee_estimate(blocks, reply),
			EngineCommand::Balance { reply } => {
				let _ = reply.send(self.state.balance());
			}
			EngineCommand::Utxos { reply } => {
				let _ = reply.send(self.state.utxos());
			}
			EngineCommand::NumTransactions { reply } => {
				let _ = reply.send(self.state.num_transactions());
			}
			EngineCommand::AddressInfo { script_hash, reply } => {
				let _ = reply.send(self.state.address_info(&script_hash).cloned());
			}
			EngineCommand::AddressRecords { reply } => {
				let _ = reply.send(self.state.addresses().clone());
			}
			EngineCommand::UsedFlags {
				script_hashes,
				reply,
			} => {
				let flags = script_hashes
					.iter()
					.map(|script_hash| self.state.is_used(script_hash))
					.collect();
				let _ = reply.send(flags);
			}
			EngineCommand::Progress { reply } => {
				let _ = reply.send(self.state.progress());
			}
		}
	}

	async fn handle_connection_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
		match event {
			ConnectionEvent::Opened => {
				let Some(handle) = self.connections.get(&id) else {
					return;
				};
				info!("Connected to {}", handle.uri());
				let uri = handle.uri().to_string();
				self.reconnector.reset();
				self.state.on_connection_opened(id, uri);
			}
			ConnectionEvent::QueueSpace => {}
			ConnectionEvent::Completed {
				task,
				result,
				latency,
			} => {
				self.resolve_ticket(id, &task, Ok(&result));
				self.state.on_task_completed(id, task, result, latency);
			}
			ConnectionEvent::Failed { task, error } => {
				self.resolve_ticket(id, &task, Err(&error));
				self.state.on_task_failed(id, task, error);
			}
			ConnectionEvent::Notification(notification) => {
				self.state.on_notification(id, notification);
			}
			ConnectionEvent::Closed { error } => {
				self.handle_closed(id, error).await;
				return;
			}
		}
		self.fill_all_queues();
	}

	async fn handle_closed(&mut self, id: ConnectionId, error: Option<ConnectionError>) {
		let Some(handle) = self.connections.remove(&id) else {
			return;
		};
		let uri = handle.uri().to_string();
		let penalize = error.is_some() && self.wanted;
		match &error {
			Some(e) => warn!("Connection {} to {} closed: {}", id, uri, e),
			None => debug!("Connection {} to {} closed", id, uri),
		}

		if self.state.server(id).is_some() {
			self.state.on_connection_closed(id, penalize);
		} else if penalize {
			// Never got as far as opening
			self.pool
				.server_score_down(&uri, self.config.pool.disconnect_penalty);
		}

		if self.wanted {
			self.schedule_reconnect();
			// Work the closed connection claimed is free for the others
			self.fill_all_queues();
		} else {
			self.finish_disconnect_if_idle().await;
		}
	}

	async fn finish_disconnect_if_idle(&mut self) {
		if !self.connections.is_empty() || self.disconnect_waiters.is_empty() {
			return;
		}
		for (_, ticket) in self.tickets.drain() {
			ticket.cancel();
		}
		self.flush().await;
		info!("Disconnected");
		for waiter in self.disconnect_waiters.drain(..) {
			let _ = waiter.send(());
		}
	}

	/// Open connections until `max_connections` are live or the pool runs
	/// out of candidates.
	fn fill_connections(&mut self) {
		if !self.wanted {
			return;
		}
		let max = self.config.pool.max_connections;
		let missing = max.saturating_sub(self.connections.len());
		if missing > 0 {
			let connected: HashSet<String> = self
				.connections
				.values()
				.map(|handle| handle.uri().to_string())
				.collect();
			let mut excluded = self.config.exclude_patterns.clone();
			excluded.extend(self.rejected.iter().cloned());

			let candidates: Vec<String> = self
				.pool
				.get_servers(max + connected.len(), &excluded)
				.into_iter()
				.filter(|uri| !connected.contains(uri))
				.take(missing)
				.collect();
			for uri in candidates {
				self.open_connection(uri);
			}
		}

		if self.connections.is_empty() {
			warn!("No servers available, retrying later");
			self.schedule_reconnect();
		}
	}

	fn open_connection(&mut self, uri: String) {
		let parsed = match uri.parse::<ServerUri>() {
			Ok(parsed) => parsed,
			Err(e) => {
				warn!("Skipping server {}: {}", uri, e);
				self.rejected.insert(uri);
				return;
			}
		};
		let id = ConnectionId(self.next_connection_id);
		self.next_connection_id += 1;
		debug!("Opening connection {} to {}", id, parsed);
		let handle = Connection::open(
			id,
			parsed,
			self.config.connection.clone(),
			self.connection_events.clone(),
		);
		self.connections.insert(id, handle);
	}

	fn schedule_reconnect(&mut self) {
		if !self.wanted || self.reconnect_at.is_some() {
			return;
		}
		let delay = self.reconnector.next_delay();
		debug!("Reconnecting in {:?}", delay);
		self.reconnect_at = Some(Instant::now() + delay);
	}

	fn fill_all_queues(&mut self) {
		let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
		for id in ids {
			self.fill_queue(id);
		}
	}

	/// Submit scheduler picks on one connection while it has queue space.
	fn fill_queue(&mut self, id: ConnectionId) {
		let Some(handle) = self.connections.get(&id).cloned() else {
			return;
		};
		let queue_size = self.config.connection.queue_size;
		loop {
			let Some(server) = self.state.server(id) else {
				return;
			};
			if server.in_flight >= queue_size {
				return;
			}
			match pick_next_task(server, &self.state) {
				None => return,
				Some(Pick::Send(task)) => {
					self.state.on_task_submitted(id, &task);
					if handle.submit_task(task).is_err() {
						return;
					}
				}
				Some(Pick::Reject(reason)) => {
					let uri = handle.uri().to_string();
					warn!("Dropping server {}: {}", uri, reason);
					self.pool
						.server_score_down(&uri, self.config.pool.disconnect_penalty);
					self.rejected.insert(uri);
					handle.close();
					return;
				}
			}
		}
	}

	fn take_ticket(&mut self) -> TicketId {
		let ticket = self.next_ticket;
		self.next_ticket += 1;
		ticket
	}

	/// Opened connections, in id order.
	fn live_connections(&self) -> Vec<ConnectionHandle> {
		let mut live: Vec<ConnectionHandle> = self
			.connections
			.values()
			.filter(|handle| self.state.server(handle.id()).is_some())
			.cloned()
			.collect();
		live.sort_by_key(|handle| handle.id());
		live
	}

	fn submit_broadcast(&mut self, raw_hex: &str) -> Vec<BroadcastReply> {
		let mut receivers = Vec::new();
		for handle in self.live_connections() {
			let ticket = self.take_ticket();
			let task = Task::Broadcast {
				raw_hex: raw_hex.to_string(),
				ticket,
			};
			if handle.submit_task(task.clone()).is_err() {
				continue;
			}
			self.state.on_task_submitted(handle.id(), &task);
			let (reply, receiver) = oneshot::channel();
			self.tickets.insert(
				ticket,
				Ticket::Broadcast {
					uri: handle.uri().to_string(),
					reply,
				},
			);
			receivers.push(receiver);
		}
		debug!("Broadcasting through {} servers", receivers.len());
		receivers
	}

	fn submit_fee_estimate(
		&mut self,
		blocks: u32,
		reply: Reply<Result<Option<f64>, WalletSyncError>>,
	) {
		let best = self
			.live_connections()
			.into_iter()
			.max_by_key(|handle| self.pool.score(handle.uri().as_str()).unwrap_or(0));
		let Some(handle) = best else {
			let _ = reply.send(Err(WalletSyncError::NotConnected));
			return;
		};
		let ticket = self.take_ticket();
		let task = Task::EstimateFee { blocks, ticket };
		if handle.submit_task(task.clone()).is_err() {
			let _ = reply.send(Err(WalletSyncError::NotConnected));
			return;
		}
		self.state.on_task_submitted(handle.id(), &task);
		self.tickets.insert(ticket, Ticket::Fee { reply });
	}

	fn resolve_ticket(
		&mut self,
		id: ConnectionId,
		task: &Task,
		outcome: Result<&TaskResult, &TaskError>,
	) {
		let ticket = match task {
			Task::Broadcast { ticket, .. } | Task::EstimateFee { ticket, .. } => *ticket,
			_ => return,
		};
		match self.tickets.remove(&ticket) {
			Some(Ticket::Broadcast { uri, reply }) => {
				let result = match outcome {
					Ok(TaskResult::Broadcast(txid)) => Ok(txid.clone()),
					Ok(other) => Err(BroadcastError::Rejected {
						backend: uri,
						reason: format!("unexpected reply {:?}", other),
					}),
					Err(e) => Err(BroadcastError::Rejected {
						backend: uri,
						reason: e.to_string(),
					}),
				};
				let _ = reply.send(result);
			}
			Some(Ticket::Fee { reply }) => {
				let result = match outcome {
					Ok(TaskResult::Fee(fee)) => Ok(fee.map(coin_per_kb_to_sat_per_vbyte)),
					Ok(other) => Err(WalletSyncError::SyncError(format!(
						"unexpected fee reply {:?}",
						other
					))),
					Err(e) => Err(WalletSyncError::SyncError(format!(
						"fee estimate failed on {}: {}",
						id, e
					))),
				};
				let _ = reply.send(result);
			}
			None => {}
		}
	}

	async fn maybe_flush(&mut self) {
		self.dirty |= self.state.take_dirty();
		if self.persistence.is_some()
			&& self
				.flush_policy
				.should_flush(self.dirty, self.state.progress())
		{
			self.flush().await;
		}
	}

	async fn flush(&mut self) {
		self.dirty |= self.state.take_dirty();
		let Some(persistence) = &self.persistence else {
			return;
		};
		match persistence.save(&self.state.snapshot()).await {
			Ok(()) => {
				self.dirty = false;
				self.flush_policy.mark_flushed(self.state.progress());
			}
			Err(e) => error!("Failed to persist wallet state: {}", e),
		}
	}
}

/// Cloneable public API of a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncEngineHandle {
	commands: mpsc::UnboundedSender<EngineCommand>,
	events: broadcast::Sender<EngineEvent>,
	broadcasters: Arc<Vec<Arc<dyn Broadcaster>>>,
}

impl SyncEngineHandle {
	async fn request<T>(
		&self,
		command: impl FnOnce(Reply<T>) -> EngineCommand,
	) -> Result<T, WalletSyncError> {
		let (reply, receiver) = oneshot::channel();
		self.commands
			.send(command(reply))
			.map_err(|_| WalletSyncError::EngineStopped)?;
		receiver.await.map_err(|_| WalletSyncError::EngineStopped)
	}

	/// Start watching an address. Returns `false` if it was already watched.
	pub async fn add_address(
		&self,
		script_hash: ScriptHash,
		display_address: String,
		path: String,
	) -> Result<bool, WalletSyncError> {
		self.request(|reply| EngineCommand::AddAddress {
			script_hash,
			display_address,
			path,
			reply,
		})
		.await
	}

	pub async fn mark_addresses_used(
		&self,
		script_hashes: Vec<ScriptHash>,
	) -> Result<(), WalletSyncError> {
		self.request(|reply| EngineCommand::MarkUsed {
			script_hashes,
			reply,
		})
		.await
	}

	pub async fn connect(&self) -> Result<(), WalletSyncError> {
		self.request(|reply| EngineCommand::Connect { reply }).await
	}

	/// Close every connection and wait until all of them reported closed.
	/// Pending broadcasts and fee estimates fail, and the caches are flushed.
	pub async fn disconnect(&self) -> Result<(), WalletSyncError> {
		self.request(|reply| EngineCommand::Disconnect { reply })
			.await
	}

	/// Push a signed transaction through every connected server and every
	/// HTTP backend at once. Resolves with the first accepted txid.
	pub async fn broadcast_tx(&self, raw: &[u8]) -> Result<Txid, WalletSyncError> {
		let raw_hex = hex::encode(raw);
		let receivers = self
			.request(|reply| EngineCommand::Broadcast {
				raw_hex: raw_hex.clone(),
				reply,
			})
			.await?;

		let mut attempts: Vec<BoxFuture<'static, Result<Txid, BroadcastError>>> = Vec::new();
		for receiver in receivers {
			attempts.push(
				async move { receiver.await.unwrap_or(Err(BroadcastError::Cancelled)) }.boxed(),
			);
		}
		for broadcaster in self.broadcasters.iter() {
			let broadcaster = broadcaster.clone();
			let raw_hex = raw_hex.clone();
			attempts.push(async move { broadcaster.broadcast(&raw_hex).await }.boxed());
		}

		let txid = first_success(attempts).await?;
		info!("Transaction {} accepted", txid);
		Ok(txid)
	}

	/// Add a transaction we just built or broadcast to the caches, before
	/// any server reports it.
	pub async fn save_tx(&self, txid: &Txid, raw: Vec<u8>) -> Result<(), WalletSyncError> {
		let saved = self
			.request(|reply| EngineCommand::SaveTx { raw, reply })
			.await??;
		if &saved != txid {
			return Err(WalletSyncError::SyncError(format!(
				"transaction hashes to {}, not {}",
				saved, txid
			)));
		}
		Ok(())
	}

	/// Fee rate in satoshi per vbyte for confirmation within `blocks`, or
	/// `None` when the server has no estimate.
	pub async fn estimate_fee(&self, blocks: u32) -> Result<Option<f64>, WalletSyncError> {
		self.request(|reply| EngineCommand::EstimateFee { blocks, reply })
			.await?
	}

	pub async fn get_balance(&self) -> Result<u64, WalletSyncError> {
		self.request(|reply| EngineCommand::Balance { reply }).await
	}

	pub async fn get_utxos(&self) -> Result<Vec<WalletUtxo>, WalletSyncError> {
		self.request(|reply| EngineCommand::Utxos { reply }).await
	}

	pub async fn get_num_transactions(&self) -> Result<usize, WalletSyncError> {
		self.request(|reply| EngineCommand::NumTransactions { reply })
			.await
	}

	pub async fn get_address_info(
		&self,
		script_hash: ScriptHash,
	) -> Result<Option<AddressInfo>, WalletSyncError> {
		self.request(|reply| EngineCommand::AddressInfo { script_hash, reply })
			.await
	}

	pub async fn address_records(
		&self,
	) -> Result<BTreeMap<ScriptHash, AddressRecord>, WalletSyncError> {
		self.request(|reply| EngineCommand::AddressRecords { reply })
			.await
	}

	pub async fn used_flags(
		&self,
		script_hashes: Vec<ScriptHash>,
	) -> Result<Vec<bool>, WalletSyncError> {
		self.request(|reply| EngineCommand::UsedFlags {
			script_hashes,
			reply,
		})
		.await
	}

	pub async fn progress(&self) -> Result<f64, WalletSyncError> {
		self.request(|reply| EngineCommand::Progress { reply }).await
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
		self.events.subscribe()
	}
}

#[async_trait::async_trait]
impl AddressWatcher for SyncEngineHandle {
	async fn add_address(
		&self,
		script_hash: ScriptHash,
		display_address: String,
		path: String,
	) -> Result<bool, WalletSyncError> {
		SyncEngineHandle::add_address(self, script_hash, display_address, path).await
	}

	async fn used_flags(&self, script_hashes: Vec<ScriptHash>) -> Result<Vec<bool>, WalletSyncError> {
		SyncEngineHandle::used_flags(self, script_hashes).await
	}
}
