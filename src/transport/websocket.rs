//! WebSocket transport (RFC 6455)
//!
//! HTTP GET upgrade with a random 16-byte key, version 13, configurable
//! Host/path/extra headers and a Chrome UA default. Early data (up to the
//! config's `ed` bytes) is base64url-encoded into a configurable header
//! of the upgrade request, so the first flight costs no extra round trip.
//!
//! Frames: client-to-server masked (tungstenite's client role), binary
//! opcode for data; pings are answered with a pong carrying the same
//! payload; an optional heartbeat sends a ping on idle and cancels itself
//! on send failure.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use bytes::{Buf, BytesMut};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use super::error::TransportError;
use super::SecureStream;
use crate::config::WsParameters;

/// Default User-Agent for upgrade requests
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Perform the upgrade over an established (possibly TLS) stream.
///
/// `early_data` is truncated to `params.max_early_data` and embedded in
/// the configured header; the returned `usize` is how many early bytes
/// were consumed this way.
///
/// # Errors
///
/// Returns `TransportError::WebSocketUpgrade` when the server does not
/// answer `101`.
pub async fn upgrade(
    stream: SecureStream,
    params: &WsParameters,
    authority: &str,
    early_data: &[u8],
) -> Result<(WebSocketWrapper, usize), TransportError> {
    let host = params.host.as_deref().unwrap_or(authority);
    let early_len = early_data.len().min(params.max_early_data);

    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("ws://{host}{}", params.path))
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("User-Agent", DEFAULT_USER_AGENT);
    for (name, value) in &params.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if early_len > 0 {
        let encoded =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&early_data[..early_len]);
        builder = builder.header(params.early_data_header.as_str(), encoded);
    }
    let request = builder
        .body(())
        .map_err(|e| TransportError::ws_upgrade(e.to_string()))?;

    let (ws, response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| TransportError::ws_upgrade(e.to_string()))?;
    debug!(
        "WebSocket upgraded: path {}, status {}, early {} bytes",
        params.path,
        response.status(),
        early_len
    );

    Ok((WebSocketWrapper::new(ws), early_len))
}

/// Byte-stream adapter over the message-based WebSocket
pub struct WebSocketWrapper {
    ws: WebSocketStream<SecureStream>,
    /// Data bytes received but not yet read out
    read_buf: BytesMut,
    /// Pong waiting for sink readiness
    pending_pong: Option<Vec<u8>>,
    /// Idle heartbeat; disabled until [`Self::enable_heartbeat`]
    heartbeat: Option<Heartbeat>,
    closed: bool,
}

struct Heartbeat {
    period: Duration,
    timer: Pin<Box<Sleep>>,
    failed: bool,
}

impl WebSocketWrapper {
    #[must_use]
    pub fn new(ws: WebSocketStream<SecureStream>) -> Self {
        Self {
            ws,
            read_buf: BytesMut::new(),
            pending_pong: None,
            heartbeat: None,
            closed: false,
        }
    }

    /// Send a ping whenever the connection sits idle for `period`.
    pub fn enable_heartbeat(&mut self, period: Duration) {
        self.heartbeat = Some(Heartbeat {
            period,
            timer: Box::pin(sleep(period)),
            failed: false,
        });
    }

    fn reset_heartbeat(&mut self) {
        if let Some(hb) = &mut self.heartbeat {
            let deadline = Instant::now() + hb.period;
            hb.timer.as_mut().reset(deadline);
        }
    }

    /// Try to flush a queued pong; pongs never block data transfer.
    fn try_send_pong(&mut self, cx: &mut Context<'_>) {
        if let Some(payload) = self.pending_pong.take() {
            match Pin::new(&mut self.ws).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if Pin::new(&mut self.ws)
                        .start_send(Message::Pong(payload.clone().into()))
                        .is_err()
                    {
                        trace!("WebSocket pong send failed");
                    }
                }
                Poll::Ready(Err(_)) => {}
                Poll::Pending => self.pending_pong = Some(payload),
            }
        }
    }

    /// Drive the heartbeat timer; on expiry queue a ping.
    fn poll_heartbeat(&mut self, cx: &mut Context<'_>) {
        let Some(hb) = &mut self.heartbeat else { return };
        if hb.failed {
            return;
        }
        if hb.timer.as_mut().poll(cx).is_ready() {
            match Pin::new(&mut self.ws).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if let Err(e) =
                        Pin::new(&mut self.ws).start_send(Message::Ping(Vec::new().into()))
                    {
                        warn!("WebSocket heartbeat failed, cancelling: {e}");
                        hb.failed = true;
                        return;
                    }
                    let deadline = Instant::now() + hb.period;
                    hb.timer.as_mut().reset(deadline);
                }
                Poll::Ready(Err(e)) => {
                    warn!("WebSocket heartbeat failed, cancelling: {e}");
                    hb.failed = true;
                }
                Poll::Pending => {
                    // Sink busy: retry on the next wakeup
                    let deadline = Instant::now() + Duration::from_millis(250);
                    hb.timer.as_mut().reset(deadline);
                }
            }
        }
    }
}

impl AsyncRead for WebSocketWrapper {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.try_send_pong(cx);
        this.poll_heartbeat(cx);

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => {
                    this.reset_heartbeat();
                    match message {
                        Message::Binary(data) => this.read_buf.extend_from_slice(&data),
                        Message::Text(text) => this.read_buf.extend_from_slice(text.as_bytes()),
                        Message::Ping(payload) => {
                            this.pending_pong = Some(payload.to_vec());
                            this.try_send_pong(cx);
                        }
                        Message::Pong(_) => {}
                        Message::Close(_) => {
                            this.closed = true;
                        }
                        Message::Frame(_) => {}
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)));
                }
                Poll::Ready(None) => {
                    this.closed = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WebSocketWrapper {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.try_send_pong(cx);

        match Pin::new(&mut this.ws).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)));
            }
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.ws)
            .start_send(Message::Binary(buf.to_vec().into()))
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        this.reset_heartbeat();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws)
            .poll_close(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }
}

impl std::fmt::Debug for WebSocketWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketWrapper")
            .field("buffered", &self.read_buf.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{Request as ServerRequest, Response};

    use super::*;

    #[tokio::test]
    async fn test_upgrade_embeds_early_data_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (header_tx, header_rx) = oneshot::channel();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tx = Some(header_tx);
            let ws = tokio_tungstenite::accept_hdr_async(
                stream,
                move |req: &ServerRequest, resp: Response| {
                    let early = req
                        .headers()
                        .get("Sec-WebSocket-Protocol")
                        .map(|v| v.to_str().unwrap().to_string());
                    let _ = tx.take().unwrap().send(early);
                    Ok(resp)
                },
            )
            .await
            .unwrap();

            // Echo one binary message
            use futures::{SinkExt, StreamExt};
            let (mut sink, mut source) = ws.split();
            if let Some(Ok(message)) = source.next().await {
                let _ = sink.send(message).await;
            }
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let params = WsParameters {
            max_early_data: 4,
            ..WsParameters::default()
        };
        let (mut wrapper, consumed) =
            upgrade(SecureStream::Plain(tcp), &params, "127.0.0.1", b"hello world")
                .await
                .unwrap();

        // Only the first 4 bytes fit the header, base64url encoded
        assert_eq!(consumed, 4);
        let header = header_rx.await.unwrap().expect("early data header missing");
        assert_eq!(
            header,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"hell")
        );

        // The wrapper is a byte stream over binary frames
        wrapper.write_all(b"o world").await.unwrap();
        wrapper.flush().await.unwrap();
        let mut buf = [0u8; 7];
        wrapper.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"o world");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_without_early_data_has_no_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (header_tx, header_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tx = Some(header_tx);
            let _ = tokio_tungstenite::accept_hdr_async(
                stream,
                move |req: &ServerRequest, resp: Response| {
                    let early = req
                        .headers()
                        .get("Sec-WebSocket-Protocol")
                        .map(|v| v.to_str().unwrap().to_string());
                    let _ = tx.take().unwrap().send(early);
                    Ok(resp)
                },
            )
            .await;
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let (_, consumed) = upgrade(
            SecureStream::Plain(tcp),
            &WsParameters::default(),
            "127.0.0.1",
            b"data",
        )
        .await
        .unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(header_rx.await.unwrap(), None);
    }
}
