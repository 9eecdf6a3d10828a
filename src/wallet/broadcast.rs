//!
//! Transaction broadcast backends.
//!
//! A signed transaction is pushed through every available backend at once:
//! each connected server plus any configured HTTP endpoints. The first backend
//! to accept it wins; the broadcast only fails when all of them refuse.

use crate::wallet::Txid;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, future::retry};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors from a single broadcast backend or from the whole attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
	#[error("HTTP error: {0}")]
	HttpError(String),

	#[error("Rejected by {backend}: {reason}")]
	Rejected { backend: String, reason: String },

	#[error("No broadcast backends available")]
	NoBackends,

	#[error("Broadcast cancelled")]
	Cancelled,
}

impl From<reqwest::Error> for BroadcastError {
	fn from(e: reqwest::Error) -> Self {
		BroadcastError::HttpError(e.to_string())
	}
}

/// A backend that can push a raw transaction to the network.
#[async_trait]
pub trait Broadcaster: Send + Sync {
	/// Submit a hex encoded transaction and return the txid the backend
	/// reports for it.
	async fn broadcast(&self, raw_hex: &str) -> Result<Txid, BroadcastError>;

	fn name(&self) -> String;
}

/// Esplora style REST endpoint accepting `POST <base>/tx`.
#[derive(Clone)]
pub struct HttpBroadcaster {
	client: Client,
	base_url: String,
	max_elapsed: Duration,
}

impl HttpBroadcaster {
	pub fn new(base_url: impl Into<String>) -> Result<Self, BroadcastError> {
		let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
		Ok(Self {
			client,
			base_url: base_url.into().trim_end_matches('/').to_string(),
			max_elapsed: Duration::from_secs(60),
		})
	}

	/// Give up retrying transient failures after `max_elapsed`.
	pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
		self.max_elapsed = max_elapsed;
		self
	}

	fn endpoint(&self) -> String {
		format!("{}/tx", self.base_url)
	}
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
	async fn broadcast(&self, raw_hex: &str) -> Result<Txid, BroadcastError> {
		let url = self.endpoint();
		let policy = ExponentialBackoff {
			max_elapsed_time: Some(self.max_elapsed),
			..ExponentialBackoff::default()
		};

		let body = retry(policy, || async {
			let resp = self
				.client
				.post(&url)
				.body(raw_hex.to_string())
				.send()
				.await
				.map_err(|e| {
					debug!("Broadcast to {} failed to send: {}", url, e);
					backoff::Error::transient(BroadcastError::from(e))
				})?;

			let status = resp.status();
			let text = resp
				.text()
				.await
				.map_err(|e| backoff::Error::transient(BroadcastError::from(e)))?;

			if status.is_success() {
				return Ok(text);
			}
			let error = BroadcastError::Rejected {
				backend: url.clone(),
				reason: format!("{}: {}", status, text.trim()),
			};
			if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
				warn!("Broadcast to {} returned {}, retrying", url, status);
				Err(backoff::Error::transient(error))
			} else {
				Err(backoff::Error::permanent(error))
			}
		})
		.await?;

		let txid = Txid::new(body.trim());
		info!("Broadcast {} through {}", txid, self.base_url);
		Ok(txid)
	}

	fn name(&self) -> String {
		self.base_url.clone()
	}
}

/// Run every attempt concurrently and resolve with the first success.
///
/// When all attempts fail the last error is returned. An empty list fails
/// with [`BroadcastError::NoBackends`].
pub async fn first_success<F>(attempts: Vec<F>) -> Result<Txid, BroadcastError>
where
	F: Future<Output = Result<Txid, BroadcastError>>,
{
	let mut pending: FuturesUnordered<F> = attempts.into_iter().collect();
	let mut last_error = BroadcastError::NoBackends;
	while let Some(outcome) = pending.next().await {
		match outcome {
			Ok(txid) => return Ok(txid),
			Err(e) => {
				debug!("Broadcast attempt failed: {}", e);
				last_error = e;
			}
		}
	}
	Err(last_error)
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::future::BoxFuture;
	use futures::FutureExt;

	fn rejected(reason: &str) -> BroadcastError {
		BroadcastError::Rejected {
			backend: "test".into(),
			reason: reason.into(),
		}
	}

	#[tokio::test]
	async fn test_first_success_wins() {
		let attempts: Vec<BoxFuture<'static, Result<Txid, BroadcastError>>> = vec![
			async { Err(rejected("bad")) }.boxed(),
			async {
				tokio::time::sleep(Duration::from_millis(5)).await;
				Ok(Txid::new("aa"))
			}
			.boxed(),
		];
		assert_eq!(first_success(attempts).await, Ok(Txid::new("aa")));
	}

	#[tokio::test]
	async fn test_all_failures_return_last_error() {
		let attempts: Vec<BoxFuture<'static, Result<Txid, BroadcastError>>> = vec![
			async { Err(rejected("first")) }.boxed(),
			async {
				tokio::time::sleep(Duration::from_millis(5)).await;
				Err(rejected("second"))
			}
			.boxed(),
		];
		assert_eq!(first_success(attempts).await, Err(rejected("second")));
	}

	#[tokio::test]
	async fn test_no_backends() {
		let attempts: Vec<BoxFuture<'static, Result<Txid, BroadcastError>>> = Vec::new();
		assert_eq!(first_success(attempts).await, Err(BroadcastError::NoBackends));
	}

	#[tokio::test]
	async fn test_http_broadcaster_posts_hex() {
		use tokio::io::{AsyncReadExt, AsyncWriteExt};

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let server = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut request = Vec::new();
			let mut buf = [0u8; 1024];
			loop {
				let n = socket.read(&mut buf).await.unwrap();
				request.extend_from_slice(&buf[..n]);
				if n == 0 || request.ends_with(b"deadbeef") {
					break;
				}
			}
			let body = "ab".repeat(32);
			let reply = format!(
				"HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
				body.len(),
				body
			);
			socket.write_all(reply.as_bytes()).await.unwrap();
			String::from_utf8(request).unwrap()
		});

		let broadcaster = HttpBroadcaster::new(format!("http://{}/api/", addr)).unwrap();
		let txid = broadcaster.broadcast("deadbeef").await.unwrap();
		assert_eq!(txid, Txid::new("ab".repeat(32)));

		let request = server.await.unwrap();
		assert!(request.starts_with("POST /api/tx "));
	}
}
