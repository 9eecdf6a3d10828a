//! Decides what a connection should request next.
//!
//! `pick_next_task` is a pure function of the connection's state and the
//! engine's caches. The engine calls it whenever a connection has queue
//! space and claims whatever it returns before asking again.

use super::state::{EngineState, Negotiation, ServerState};
use crate::protocol::Task;
use crate::wallet::ScriptHash;

/// Outcome of a scheduling decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pick {
	/// Submit this task
	Send(Task),
	/// Drop the server for the given reason
	Reject(String),
}

/// Pick the next task for `server`, in priority order:
///
/// 1. version handshake, then the chain tip subscription
/// 2. nothing more until the handshake reply arrives; reject servers below
///    the minimum protocol version
/// 3. missing block headers, then missing transactions
/// 4. UTXO lists whose status changed
/// 5. subscriptions, used addresses first
/// 6. histories whose status changed
///
/// Returns `None` when there is nothing to do right now.
pub fn pick_next_task(server: &ServerState, state: &EngineState) -> Option<Pick> {
	let settings = state.settings();

	match server.version {
		Negotiation::Idle => {
			return Some(Pick::Send(Task::Version {
				client_name: settings.client_name.clone(),
				protocol_version: settings.protocol_version.clone(),
			}));
		}
		Negotiation::Failed => {
			return Some(Pick::Reject("version handshake failed".to_string()));
		}
		Negotiation::Pending | Negotiation::Done => {}
	}
	if server.headers == Negotiation::Idle {
		return Some(Pick::Send(Task::SubscribeHeaders));
	}
	if server.version != Negotiation::Done {
		return None;
	}
	if let Some(version) = &server.protocol_version {
		if version_less_than(version, &settings.min_protocol_version) {
			return Some(Pick::Reject(format!(
				"protocol version {} is below {}",
				version, settings.min_protocol_version
			)));
		}
	}

	for height in state.missing_headers() {
		if state.is_header_claimed(height) {
			continue;
		}
		if server.height.is_some_and(|tip| tip < height) {
			continue;
		}
		if state.can_fetch_header(server, height) {
			return Some(Pick::Send(Task::GetHeader { height }));
		}
	}

	for txid in state.missing_transactions() {
		if !state.is_tx_claimed(&txid) && state.can_fetch_tx(server, &txid) {
			return Some(Pick::Send(Task::GetTransaction { txid }));
		}
	}

	for (script_hash, record) in state.addresses() {
		if let Some(fingerprint) = stale_fingerprint(server, script_hash, &record.utxo_fingerprint) {
			if !state.is_fetching_utxos(script_hash) && state.is_best_server(server, script_hash) {
				return Some(Pick::Send(Task::ListUnspent {
					script_hash: script_hash.clone(),
					fingerprint,
				}));
			}
		}
	}

	let unsubscribed = state.addresses().keys().filter(|script_hash| {
		server
			.address(script_hash)
			.is_none_or(|sub| !sub.subscribed && !sub.subscribing)
	});
	let mut first_unused = None;
	for script_hash in unsubscribed {
		if state.is_used(script_hash) {
			return Some(subscribe(script_hash));
		}
		first_unused.get_or_insert(script_hash);
	}
	if let Some(script_hash) = first_unused {
		return Some(subscribe(script_hash));
	}

	for (script_hash, record) in state.addresses() {
		if let Some(fingerprint) =
			stale_fingerprint(server, script_hash, &record.history_fingerprint)
		{
			if !state.is_fetching_history(script_hash) && state.is_best_server(server, script_hash)
			{
				return Some(Pick::Send(Task::GetHistory {
					script_hash: script_hash.clone(),
					fingerprint,
				}));
			}
		}
	}

	None
}

fn subscribe(script_hash: &ScriptHash) -> Pick {
	Pick::Send(Task::SubscribeScriptHash {
		script_hash: script_hash.clone(),
	})
}

/// The server's status for the address when it differs from `fetched_with`.
fn stale_fingerprint(
	server: &ServerState,
	script_hash: &ScriptHash,
	fetched_with: &Option<String>,
) -> Option<Option<String>> {
	server
		.address(script_hash)
		.filter(|sub| sub.subscribed && &sub.fingerprint != fetched_with)
		.map(|sub| sub.fingerprint.clone())
}

/// Compare dotted numeric versions such as `1.4` and `1.4.2`. Missing
/// components count as zero.
pub fn version_less_than(version: &str, minimum: &str) -> bool {
	let parse = |v: &str| -> Vec<u64> {
		v.trim()
			.split('.')
			.map(|part| part.trim().parse::<u64>().unwrap_or(0))
			.collect()
	};
	let (a, b) = (parse(version), parse(minimum));
	let len = a.len().max(b.len());
	for i in 0..len {
		let (x, y) = (
			a.get(i).copied().unwrap_or(0),
			b.get(i).copied().unwrap_or(0),
		);
		if x != y {
			return x < y;
		}
	}
	false
}
