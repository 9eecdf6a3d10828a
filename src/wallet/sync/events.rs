//! Event system for wallet synchronization.
//!
//! The engine records what changed while it mutates its caches and hands the
//! resulting events to an `EventDispatcher`. Handlers registered there decide
//! what to do with them: log them, forward them to subscribers, or trigger
//! address look-ahead. This keeps the engine free of any knowledge about who
//! is listening.

use crate::wallet::{ScriptHash, Txid, WalletSyncError};

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Observable changes of the wallet state
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
	/// Total wallet balance changed
	BalanceChanged { balance: u64 },
	/// An address flipped between used and unused
	AddressUsedChanged { script_hash: ScriptHash, used: bool },
	/// A transaction was added to the cache
	TransactionFetched { txid: Txid },
	/// A transaction's confirmation height changed
	TransactionHeightChanged { txid: Txid, height: i64 },
	/// The best known chain height increased
	BlockHeightChanged { height: u64 },
	/// Sync progress in `[0, 1]`
	ProgressChanged { ratio: f64 },
	Connected { server: String },
	Disconnected { server: String },
}

/// Trait for handling engine events.
#[async_trait::async_trait]
pub trait EngineEventHandler: Send + Sync {
	/// Handle one event. Called for every event the engine emits.
	async fn handle(&mut self, event: &EngineEvent) -> Result<(), WalletSyncError>;

	/// Get the name of this handler for logging and diagnostics.
	fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order. A failing handler is logged
/// and does not stop the others.
#[derive(Default)]
pub struct EventDispatcher {
	handlers: Vec<Box<dyn EngineEventHandler>>,
}

impl EventDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_handler(&mut self, handler: Box<dyn EngineEventHandler>) {
		self.handlers.push(handler);
	}

	pub async fn dispatch(&mut self, event: &EngineEvent) {
		for handler in &mut self.handlers {
			if let Err(e) = handler.handle(event).await {
				tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
			}
		}
	}

	pub async fn dispatch_all(&mut self, events: Vec<EngineEvent>) {
		for event in &events {
			self.dispatch(event).await;
		}
	}
}

/// Forwards every event into a broadcast channel.
pub struct ChannelEventHandler {
	sender: broadcast::Sender<EngineEvent>,
}

impl ChannelEventHandler {
	pub fn new(sender: broadcast::Sender<EngineEvent>) -> Self {
		Self { sender }
	}
}

#[async_trait::async_trait]
impl EngineEventHandler for ChannelEventHandler {
	async fn handle(&mut self, event: &EngineEvent) -> Result<(), WalletSyncError> {
		// No subscribers is fine
		let _ = self.sender.send(event.clone());
		Ok(())
	}

	fn name(&self) -> &'static str {
		"channel"
	}
}

/// Logs the events worth seeing at `info` level.
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EngineEventHandler for LoggingEventHandler {
	async fn handle(&mut self, event: &EngineEvent) -> Result<(), WalletSyncError> {
		match event {
			EngineEvent::BalanceChanged { balance } => {
				info!("Balance changed: {}", crate::utils::format_amount(*balance))
			}
			EngineEvent::ProgressChanged { ratio } => {
				info!("Sync progress: {:.1}%", ratio * 100.0)
			}
			EngineEvent::BlockHeightChanged { height } => info!("Chain height: {}", height),
			EngineEvent::Connected { server } => info!("Server {} connected", server),
			EngineEvent::Disconnected { server } => info!("Server {} disconnected", server),
			other => debug!("{:?}", other),
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"logging"
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FailingHandler;

	#[async_trait::async_trait]
	impl EngineEventHandler for FailingHandler {
		async fn handle(&mut self, _event: &EngineEvent) -> Result<(), WalletSyncError> {
			Err(WalletSyncError::SyncError("boom".to_string()))
		}

		fn name(&self) -> &'static str {
			"failing"
		}
	}

	#[tokio::test]
	async fn test_failing_handler_does_not_block_others() {
		let (sender, mut receiver) = broadcast::channel(8);
		let mut dispatcher = EventDispatcher::new();
		dispatcher.register_handler(Box::new(FailingHandler));
		dispatcher.register_handler(Box::new(ChannelEventHandler::new(sender)));

		dispatcher
			.dispatch_all(vec![
				EngineEvent::BalanceChanged { balance: 5 },
				EngineEvent::BlockHeightChanged { height: 9 },
			])
			.await;

		assert_eq!(
			receiver.recv().await.unwrap(),
			EngineEvent::BalanceChanged { balance: 5 }
		);
		assert_eq!(
			receiver.recv().await.unwrap(),
			EngineEvent::BlockHeightChanged { height: 9 }
		);
	}
}
