//! Progress tracking for wallet synchronization.
//!
//! Progress is the share of outstanding work already done, where work is
//! every transaction referenced but not yet cached plus every address whose
//! server status has not been caught up with. The denominator is the largest
//! amount of outstanding work seen this session, so the ratio only moves
//! forward.

use tracing::info;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
	/// Largest number of outstanding items seen
	total: usize,
	/// Current ratio, never decreasing
	ratio: f64,
	/// Last ratio reported to listeners
	last_emitted: f64,
	/// Minimum increase worth reporting
	throttle: f64,
	transactions_fetched: usize,
	headers_fetched: usize,
}

impl SyncProgressTracker {
	pub fn new(throttle: f64) -> Self {
		Self {
			total: 0,
			ratio: 0.0,
			last_emitted: 0.0,
			throttle,
			transactions_fetched: 0,
			headers_fetched: 0,
		}
	}

	pub fn ratio(&self) -> f64 {
		self.ratio
	}

	pub fn record_transaction(&mut self) {
		self.transactions_fetched += 1;
	}

	pub fn record_header(&mut self) {
		self.headers_fetched += 1;
	}

	/// Recompute the ratio from the number of outstanding items.
	///
	/// Returns the new ratio when it should be reported: it grew by more than
	/// the throttle since the last report, or it just reached 1.
	pub fn update(&mut self, missing: usize) -> Option<f64> {
		self.total = self.total.max(missing);
		let computed = if missing == 0 || self.total == 0 {
			1.0
		} else {
			(self.total - missing) as f64 / self.total as f64
		};
		self.ratio = self.ratio.max(computed);

		let reached_end = self.ratio >= 1.0 && self.last_emitted < 1.0;
		if reached_end || self.ratio - self.last_emitted > self.throttle {
			self.last_emitted = self.ratio;
			if reached_end {
				self.log_progress();
			}
			return Some(self.ratio);
		}
		None
	}

	pub fn log_progress(&self) {
		info!(
			"Sync progress {:.1}%: {} transactions and {} headers fetched",
			self.ratio * 100.0,
			self.transactions_fetched,
			self.headers_fetched
		);
	}

	pub fn get_stats(&self) -> SyncStats {
		SyncStats {
			ratio: self.ratio,
			total: self.total,
			transactions_fetched: self.transactions_fetched,
			headers_fetched: self.headers_fetched,
		}
	}
}

/// Statistics about the sync progress
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStats {
	pub ratio: f64,
	pub total: usize,
	pub transactions_fetched: usize,
	pub headers_fetched: usize,
}

impl SyncStats {
	pub fn summary(&self) -> String {
		format!(
			"{:.1}% of {} items: {} transactions, {} headers",
			self.ratio * 100.0,
			self.total,
			self.transactions_fetched,
			self.headers_fetched
		)
	}
}
