//! Byte transports carrying newline-delimited JSON frames.
//!
//! Plain TCP and TLS sockets are read line by line. WebSocket transports may
//! pack several newline-separated frames into one text message, so incoming
//! messages are split the same way.

use super::types::{ConnectionError, ProtocolError, ServerUri, TransportKind};
use crate::config::ConnectionConfig;

use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use std::pin::Pin;
use tokio::io::{
	AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
	WriteHalf,
};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;
use tokio_tungstenite::{
	MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::debug;

/// Incoming frames, one JSON document per item.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// Outgoing half of a transport.
#[async_trait::async_trait]
pub trait FrameWriter: Send {
	/// Write one frame. The newline terminator is added by the writer.
	async fn send_frame(&mut self, frame: &str) -> Result<(), ConnectionError>;

	async fn shutdown(&mut self);
}

struct LineWriter<W> {
	inner: W,
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Send + Unpin> FrameWriter for LineWriter<W> {
	async fn send_frame(&mut self, frame: &str) -> Result<(), ConnectionError> {
		let mut line = Vec::with_capacity(frame.len() + 1);
		line.extend_from_slice(frame.as_bytes());
		line.push(b'\n');
		self.inner.write_all(&line).await?;
		self.inner.flush().await?;
		Ok(())
	}

	async fn shutdown(&mut self) {
		let _ = self.inner.shutdown().await;
	}
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WebSocketWriter {
	sink: SplitSink<WsStream, Message>,
}

#[async_trait::async_trait]
impl FrameWriter for WebSocketWriter {
	async fn send_frame(&mut self, frame: &str) -> Result<(), ConnectionError> {
		self.sink.send(Message::Text(frame.to_string())).await?;
		Ok(())
	}

	async fn shutdown(&mut self) {
		let _ = self.sink.close().await;
	}
}

/// Read one newline terminated frame of at most `max_len` bytes.
///
/// Returns `Ok(None)` at end of stream. A final unterminated line is still
/// handed out as a frame.
async fn read_frame<R>(
	reader: &mut R,
	buf: &mut Vec<u8>,
	max_len: usize,
) -> Result<Option<String>, ConnectionError>
where
	R: AsyncBufRead + Unpin,
{
	buf.clear();
	let n = (&mut *reader)
		.take(max_len as u64 + 1)
		.read_until(b'\n', buf)
		.await?;
	if n == 0 {
		return Ok(None);
	}
	if buf.last() == Some(&b'\n') {
		buf.pop();
		if buf.last() == Some(&b'\r') {
			buf.pop();
		}
	}
	if buf.len() > max_len {
		return Err(ProtocolError::FrameTooLong(max_len).into());
	}
	let line = std::str::from_utf8(buf)
		.map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?
		.to_string();
	Ok(Some(line))
}

/// Split any byte stream into a line writer and a line reader. Lines longer
/// than `max_frame_bytes` end the stream with [`ProtocolError::FrameTooLong`].
pub fn split_stream<S>(stream: S, max_frame_bytes: usize) -> (Box<dyn FrameWriter>, FrameStream)
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let (read, write): (_, WriteHalf<S>) = tokio::io::split(stream);
	let reader = BufReader::new(read);
	let frames = futures::stream::unfold(
		Some((reader, Vec::new())),
		move |state| async move {
			let (mut reader, mut buf) = state?;
			loop {
				match read_frame(&mut reader, &mut buf, max_frame_bytes).await {
					Ok(Some(line)) if line.trim().is_empty() => continue,
					Ok(Some(line)) => return Some((Ok(line), Some((reader, buf)))),
					Ok(None) => return None,
					// Nothing sensible can follow a broken frame
					Err(e) => return Some((Err(e), None)),
				}
			}
		},
	);

	(Box::new(LineWriter { inner: write }), Box::pin(frames))
}

/// Open the transport selected by the URI scheme.
pub async fn connect(
	uri: &ServerUri,
	config: &ConnectionConfig,
) -> Result<(Box<dyn FrameWriter>, FrameStream), ConnectionError> {
	debug!("Opening {:?} transport to {}", uri.transport, uri);

	match uri.transport {
		TransportKind::Tcp => {
			let stream = TcpStream::connect((uri.host.as_str(), uri.port)).await?;
			stream.set_nodelay(true)?;
			Ok(split_stream(stream, config.max_frame_bytes))
		}
		TransportKind::Tls => {
			let stream = TcpStream::connect((uri.host.as_str(), uri.port)).await?;
			stream.set_nodelay(true)?;
			// Electrum servers commonly run with self-signed certificates
			let connector = native_tls::TlsConnector::builder()
				.danger_accept_invalid_certs(config.accept_invalid_certs)
				.danger_accept_invalid_hostnames(config.accept_invalid_certs)
				.build()?;
			let connector = tokio_native_tls::TlsConnector::from(connector);
			let stream = connector.connect(&uri.host, stream).await?;
			Ok(split_stream(stream, config.max_frame_bytes))
		}
		TransportKind::WebSocket | TransportKind::SecureWebSocket => {
			let (ws_stream, response) = connect_async(uri.websocket_url()).await?;
			debug!(
				"WebSocket connection established, response status: {}",
				response.status()
			);
			let (sink, stream) = ws_stream.split();
			let max_frame_bytes = config.max_frame_bytes;
			let frames = stream.flat_map(move |msg| {
				let items: Vec<Result<String, ConnectionError>> = match msg {
					Ok(Message::Text(text)) if text.len() > max_frame_bytes => {
						vec![Err(ProtocolError::FrameTooLong(max_frame_bytes).into())]
					}
					Ok(Message::Text(text)) => text
						.lines()
						.filter(|line| !line.trim().is_empty())
						.map(|line| Ok(line.to_string()))
						.collect(),
					Ok(Message::Close(_)) => vec![Err(ConnectionError::Closed)],
					Ok(_) => Vec::new(),
					Err(e) => vec![Err(ConnectionError::from(e))],
				};
				futures::stream::iter(items)
			});
			Ok((Box::new(WebSocketWriter { sink }), Box::pin(frames)))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncReadExt;

	#[tokio::test]
	async fn test_split_stream_frames_lines() {
		let (client, mut server) = tokio::io::duplex(1024);
		let (mut writer, mut frames) = split_stream(client, 64);

		writer.send_frame(r#"{"id":1}"#).await.unwrap();
		let mut buf = vec![0u8; 9];
		server.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"{\"id\":1}\n");

		server.write_all(b"{\"a\":1}\n\n{\"b\":2}\n").await.unwrap();
		assert_eq!(frames.next().await.unwrap().unwrap(), r#"{"a":1}"#);
		assert_eq!(frames.next().await.unwrap().unwrap(), r#"{"b":2}"#);

		drop(server);
		assert!(frames.next().await.is_none());
	}

	#[tokio::test]
	async fn test_oversized_frame_ends_the_stream() {
		let (client, mut server) = tokio::io::duplex(1024);
		let (_writer, mut frames) = split_stream(client, 16);

		server.write_all(b"{\"a\":1}\r\n").await.unwrap();
		assert_eq!(frames.next().await.unwrap().unwrap(), r#"{"a":1}"#);

		// No newline in sight, the reader must give up at the limit
		server.write_all(&[b'x'; 100]).await.unwrap();
		assert!(matches!(
			frames.next().await,
			Some(Err(ConnectionError::ProtocolError(ProtocolError::FrameTooLong(16))))
		));
		assert!(frames.next().await.is_none());
	}
}
