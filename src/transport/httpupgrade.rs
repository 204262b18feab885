//! HTTP-Upgrade transport
//!
//! Same handshake shape as WebSocket, but after the `101` the connection
//! carries raw bytes with no framing at all. The response must carry both
//! `Upgrade: websocket` and `Connection: upgrade`, matched
//! case-insensitively; any payload the server sent behind the 101 is
//! preserved and surfaced before socket reads.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tracing::debug;

use super::error::TransportError;
use super::websocket::DEFAULT_USER_AGENT;
use super::SecureStream;
use crate::config::HttpUpgradeParameters;

/// Largest response head we will buffer before giving up
const MAX_RESPONSE_HEAD: usize = 16_384;

/// Perform the upgrade; returns the raw stream with any read-ahead bytes.
///
/// # Errors
///
/// Returns `TransportError::HttpUpgrade` for a non-101 status or missing
/// upgrade headers.
pub async fn upgrade(
    mut stream: SecureStream,
    params: &HttpUpgradeParameters,
    authority: &str,
) -> Result<BufferedStream, TransportError> {
    let host = params.host.as_deref().unwrap_or(authority);

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\nUser-Agent: {}\r\n",
        params.path,
        host,
        generate_key(),
        DEFAULT_USER_AGENT
    );
    for (name, value) in &params.headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read the full response head
    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(TransportError::http_upgrade("response head too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::http_upgrade("EOF before 101 response"));
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    validate_upgrade_response(&head)?;
    buf.advance(head_end + 4);
    debug!(
        "HTTP upgrade complete: path {}, {} read-ahead bytes",
        params.path,
        buf.len()
    );

    Ok(BufferedStream {
        prefix: buf,
        inner: stream,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Check the status line and the two upgrade headers
fn validate_upgrade_response(head: &str) -> Result<(), TransportError> {
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .ok_or_else(|| TransportError::http_upgrade("empty response"))?;
    let mut parts = status.split_whitespace();
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.1") || code != "101" {
        return Err(TransportError::http_upgrade(format!(
            "expected HTTP/1.1 101, got {status:?}"
        )));
    }

    let mut has_upgrade = false;
    let mut has_connection = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_ascii_lowercase();
        match name.as_str() {
            "upgrade" if value == "websocket" => has_upgrade = true,
            "connection" if value == "upgrade" => has_connection = true,
            _ => {}
        }
    }
    if !has_upgrade {
        return Err(TransportError::http_upgrade("missing Upgrade: websocket"));
    }
    if !has_connection {
        return Err(TransportError::http_upgrade("missing Connection: upgrade"));
    }
    Ok(())
}

/// Raw stream with read-ahead bytes from the upgrade response
#[derive(Debug)]
pub struct BufferedStream {
    prefix: BytesMut,
    inner: SecureStream,
}

impl AsyncRead for BufferedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_101() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: upgrade";
        assert!(validate_upgrade_response(head).is_ok());
    }

    #[test]
    fn test_validate_case_insensitive() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUPGRADE: WebSocket\r\nconnection: UPGRADE";
        assert!(validate_upgrade_response(head).is_ok());
    }

    #[test]
    fn test_validate_rejects_status() {
        let head = "HTTP/1.1 200 OK\r\nUpgrade: websocket\r\nConnection: upgrade";
        assert!(validate_upgrade_response(head).is_err());
        let head = "HTTP/1.0 101 Switching\r\nUpgrade: websocket\r\nConnection: upgrade";
        assert!(validate_upgrade_response(head).is_err());
    }

    #[test]
    fn test_validate_requires_both_headers() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket";
        assert!(validate_upgrade_response(head).is_err());
        let head = "HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade";
        assert!(validate_upgrade_response(head).is_err());
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: h2c\r\nConnection: upgrade";
        assert!(validate_upgrade_response(head).is_err());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 101\r\n\r\nrest"), Some(12));
        assert_eq!(find_head_end(b"HTTP/1.1 101\r\n"), None);
    }
}
