//! One live session with one server.
//!
//! Each connection is a tokio task that owns the socket and the table of
//! outstanding requests. The owner talks to it through a [`ConnectionHandle`]
//! and hears back through a shared event channel, so every reply, timeout and
//! disconnect is serialized into the owner's single event loop.

use super::transport::{self, FrameStream, FrameWriter};
use super::types::*;
use crate::config::ConnectionConfig;

use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often timeouts and keepalive are checked
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Ids of timed-out requests remembered so their late replies can be dropped
const MAX_TIMED_OUT_IDS: usize = 1024;

/// Sender half of the channel every connection of one owner reports into.
pub type ConnectionEvents = mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

#[derive(Debug)]
enum ConnectionCommand {
	Submit(Task),
	Close,
}

/// Cloneable handle to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnectionId,
	uri: ServerUri,
	commands: mpsc::UnboundedSender<ConnectionCommand>,
	state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn uri(&self) -> &ServerUri {
		&self.uri
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	/// Send a task right away, regardless of how many are outstanding.
	///
	/// The outcome arrives as a `Completed` or `Failed` event. Fails only when
	/// the connection task has already exited.
	pub fn submit_task(&self, task: Task) -> Result<(), ConnectionError> {
		self.commands
			.send(ConnectionCommand::Submit(task))
			.map_err(|_| ConnectionError::Closed)
	}

	/// Ask the connection to shut down. `Closed` follows once every
	/// outstanding task has been failed.
	pub fn close(&self) {
		let _ = self.commands.send(ConnectionCommand::Close);
	}
}

pub struct Connection;

impl Connection {
	/// Dial `uri` and run the session in a background task.
	pub fn open(
		id: ConnectionId,
		uri: ServerUri,
		config: ConnectionConfig,
		events: ConnectionEvents,
	) -> ConnectionHandle {
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
		let handle = ConnectionHandle {
			id,
			uri: uri.clone(),
			commands: commands_tx,
			state: state_rx,
		};

		tokio::spawn(async move {
			let connect_timeout = config.connect_timeout();
			let connected =
				tokio::time::timeout(connect_timeout, transport::connect(&uri, &config)).await;
			let (writer, frames) = match connected {
				Ok(Ok(parts)) => parts,
				Ok(Err(e)) => {
					warn!("Failed to connect to {}: {}", uri, e);
					let _ = state_tx.send(ConnectionState::Disconnected);
					let _ = events.send((id, ConnectionEvent::Closed { error: Some(e) }));
					return;
				}
				Err(_) => {
					warn!("Connecting to {} timed out", uri);
					let _ = state_tx.send(ConnectionState::Disconnected);
					let _ = events.send((
						id,
						ConnectionEvent::Closed {
							error: Some(ConnectionError::ConnectTimeout(connect_timeout)),
						},
					));
					return;
				}
			};

			Actor::new(id, uri, config, writer, frames, events, commands_rx, state_tx)
				.run()
				.await;
		});

		handle
	}

	/// Run a session over an already established byte stream.
	pub fn from_stream<S>(
		id: ConnectionId,
		uri: ServerUri,
		stream: S,
		config: ConnectionConfig,
		events: ConnectionEvents,
	) -> ConnectionHandle
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
		let handle = ConnectionHandle {
			id,
			uri: uri.clone(),
			commands: commands_tx,
			state: state_rx,
		};

		let (writer, frames) = transport::split_stream(stream, config.max_frame_bytes);
		tokio::spawn(
			Actor::new(id, uri, config, writer, frames, events, commands_rx, state_tx).run(),
		);

		handle
	}
}

struct PendingRequest {
	task: Task,
	sent_at: Instant,
}

struct Actor {
	id: ConnectionId,
	uri: ServerUri,
	config: ConnectionConfig,
	writer: Box<dyn FrameWriter>,
	frames: FrameStream,
	events: ConnectionEvents,
	commands: mpsc::UnboundedReceiver<ConnectionCommand>,
	state: watch::Sender<ConnectionState>,
	pending: HashMap<u64, PendingRequest>,
	next_id: u64,
	timed_out: HashSet<u64>,
	timed_out_order: VecDeque<u64>,
	last_received: Instant,
	ping_outstanding: bool,
}

impl Actor {
	#[allow(clippy::too_many_arguments)]
	fn new(
		id: ConnectionId,
		uri: ServerUri,
		config: ConnectionConfig,
		writer: Box<dyn FrameWriter>,
		frames: FrameStream,
		events: ConnectionEvents,
		commands: mpsc::UnboundedReceiver<ConnectionCommand>,
		state: watch::Sender<ConnectionState>,
	) -> Self {
		Self {
			id,
			uri,
			config,
			writer,
			frames,
			events,
			commands,
			state,
			pending: HashMap::new(),
			next_id: 0,
			timed_out: HashSet::new(),
			timed_out_order: VecDeque::new(),
			last_received: Instant::now(),
			ping_outstanding: false,
		}
	}

	async fn run(mut self) {
		info!("Connected to {} ({})", self.uri, self.id);
		let _ = self.state.send(ConnectionState::Connected);
		self.emit(ConnectionEvent::Opened);
		self.emit_queue_space();

		let error = self.serve().await;
		match &error {
			Some(e) => warn!("Connection to {} closed: {}", self.uri, e),
			None => info!("Connection to {} closed", self.uri),
		}

		self.writer.shutdown().await;
		self.fail_all_pending();
		let _ = self.state.send(ConnectionState::Disconnected);
		self.emit(ConnectionEvent::Closed { error });
	}

	/// Returns the error that ended the session, `None` on a requested close.
	async fn serve(&mut self) -> Option<ConnectionError> {
		let mut ticker = tokio::time::interval(TICK_INTERVAL);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				frame = self.frames.next() => match frame {
					Some(Ok(line)) => {
						self.last_received = Instant::now();
						self.ping_outstanding = false;
						if let Err(e) = self.handle_frame(&line) {
							return Some(e);
						}
					}
					Some(Err(e)) => return Some(e),
					None => return Some(ConnectionError::Closed),
				},
				command = self.commands.recv() => match command {
					Some(ConnectionCommand::Submit(task)) => {
						if let Err(e) = self.send(task).await {
							return Some(e);
						}
					}
					Some(ConnectionCommand::Close) | None => return None,
				},
				_ = ticker.tick() => {
					if let Err(e) = self.on_tick().await {
						return Some(e);
					}
				}
			}
		}
	}

	async fn send(&mut self, task: Task) -> Result<(), ConnectionError> {
		let id = self.next_id;
		self.next_id += 1;

		let request = Request {
			id,
			method: task.method(),
			params: task.params(),
		};
		let frame = serde_json::to_string(&request).map_err(ProtocolError::from)?;
		debug!("{} -> {}", self.uri, frame);

		self.pending.insert(
			id,
			PendingRequest {
				task,
				sent_at: Instant::now(),
			},
		);
		self.writer.send_frame(&frame).await
	}

	fn handle_frame(&mut self, line: &str) -> Result<(), ConnectionError> {
		debug!("{} <- {}", self.uri, line);
		let frame: IncomingFrame = serde_json::from_str(line).map_err(ProtocolError::from)?;

		let id = match frame.id {
			Some(Value::Null) | None => {
				let method = frame.method.ok_or_else(|| {
					ProtocolError::InvalidFrame("frame has neither id nor method".to_string())
				})?;
				match Notification::decode(&method, frame.params)? {
					Some(notification) => self.emit(ConnectionEvent::Notification(notification)),
					None => debug!("Ignoring notification {} from {}", method, self.uri),
				}
				return Ok(());
			}
			Some(id) => id.as_u64().ok_or_else(|| {
				ProtocolError::InvalidFrame(format!("non numeric request id {}", id))
			})?,
		};

		let Some(pending) = self.pending.remove(&id) else {
			if self.timed_out.remove(&id) {
				debug!("Dropping late reply {} from {}", id, self.uri);
				return Ok(());
			}
			return Err(ProtocolError::UnknownId(id).into());
		};

		if let Some(error) = frame.error.filter(|e| !e.is_null()) {
			let error = TaskError::from_reply(&error);
			debug!("{} failed on {}: {}", pending.task.method(), self.uri, error);
			if pending.task != Task::Ping {
				self.emit(ConnectionEvent::Failed {
					task: pending.task,
					error,
				});
			}
			self.emit_queue_space();
			return Ok(());
		}

		let result = match TaskResult::decode(&pending.task, frame.result.unwrap_or(Value::Null)) {
			Ok(result) => result,
			Err(e) => {
				self.emit(ConnectionEvent::Failed {
					task: pending.task,
					error: TaskError::ConnectionClosed,
				});
				return Err(e.into());
			}
		};

		if pending.task != Task::Ping {
			self.emit(ConnectionEvent::Completed {
				task: pending.task,
				result,
				latency: pending.sent_at.elapsed(),
			});
		}
		self.emit_queue_space();
		Ok(())
	}

	async fn on_tick(&mut self) -> Result<(), ConnectionError> {
		let task_timeout = self.config.task_timeout();
		let mut expired: Vec<u64> = self
			.pending
			.iter()
			.filter(|(_, pending)| pending.sent_at.elapsed() >= task_timeout)
			.map(|(id, _)| *id)
			.collect();
		expired.sort_unstable();

		for id in &expired {
			if let Some(pending) = self.pending.remove(id) {
				warn!("{} timed out on {}", pending.task.method(), self.uri);
				self.remember_timed_out(*id);
				if pending.task != Task::Ping {
					self.emit(ConnectionEvent::Failed {
						task: pending.task,
						error: TaskError::Timeout,
					});
				}
			}
		}
		if !expired.is_empty() {
			self.emit_queue_space();
		}

		let silence = self.last_received.elapsed();
		let hang_timeout = self.config.hang_timeout();
		if silence >= hang_timeout {
			return Err(ConnectionError::Hang(hang_timeout));
		}
		if silence >= self.config.keepalive_interval() && !self.ping_outstanding {
			self.ping_outstanding = true;
			self.send(Task::Ping).await?;
		}
		Ok(())
	}

	fn remember_timed_out(&mut self, id: u64) {
		self.timed_out.insert(id);
		self.timed_out_order.push_back(id);
		while self.timed_out_order.len() > MAX_TIMED_OUT_IDS {
			if let Some(old) = self.timed_out_order.pop_front() {
				self.timed_out.remove(&old);
			}
		}
	}

	fn fail_all_pending(&mut self) {
		let mut pending: Vec<(u64, PendingRequest)> = self.pending.drain().collect();
		pending.sort_unstable_by_key(|(id, _)| *id);
		for (_, request) in pending {
			if request.task != Task::Ping {
				self.emit(ConnectionEvent::Failed {
					task: request.task,
					error: TaskError::ConnectionClosed,
				});
			}
		}
	}

	fn emit_queue_space(&self) {
		if self.pending.len() < self.config.queue_size {
			self.emit(ConnectionEvent::QueueSpace);
		}
	}

	fn emit(&self, event: ConnectionEvent) {
		let _ = self.events.send((self.id, event));
	}
}
