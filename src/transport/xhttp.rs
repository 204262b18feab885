//! XHTTP transport over HTTP/2
//!
//! Two sub-modes, chosen by the config (`auto` resolves to stream-one):
//!
//! - **stream-one**: a single long-lived POST whose request body carries
//!   the uplink and whose response body carries the downlink.
//! - **packet-up**: the uplink is a series of short POSTs, one per
//!   outbound buffer, addressed `{path}/{session}/{seq}`; the downlink is
//!   one long-lived GET at `{path}/{session}`.
//!
//! Headers carry the configured Host (as the `:authority`), any extras,
//! and `Content-Type: application/grpc` unless the no-gRPC-header flag is
//! set.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Request};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};
use uuid::Uuid;

use super::error::TransportError;
use super::SecureStream;
use crate::config::{XhttpMode, XhttpParameters};

fn build_request(
    method: Method,
    authority: &str,
    path: &str,
    params: &XhttpParameters,
) -> Result<Request<()>, TransportError> {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("https://{authority}{path}"));
    if !params.no_grpc_header {
        builder = builder.header("content-type", "application/grpc");
    }
    for (name, value) in &params.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(())
        .map_err(|e| TransportError::xhttp(e.to_string()))
}

/// Open the XHTTP layer over an established (possibly TLS) stream.
///
/// # Errors
///
/// Returns `TransportError::Xhttp` when the HTTP/2 handshake or the
/// initial request fails.
pub async fn connect(
    stream: SecureStream,
    params: &XhttpParameters,
    authority: &str,
) -> Result<XhttpStream, TransportError> {
    let authority = params.host.as_deref().unwrap_or(authority).to_string();
    let (mut client, connection) = h2::client::handshake(stream)
        .await
        .map_err(|e| TransportError::xhttp(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!("XHTTP connection driver ended: {e}");
        }
    });

    let mode = match params.mode {
        // stream-one needs nothing the carrier cannot do; auto picks it
        XhttpMode::Auto | XhttpMode::StreamOne => XhttpMode::StreamOne,
        XhttpMode::PacketUp => XhttpMode::PacketUp,
    };

    match mode {
        XhttpMode::StreamOne | XhttpMode::Auto => {
            let request = build_request(Method::POST, &authority, &params.path, params)?;
            let (response, send) = client
                .send_request(request, false)
                .map_err(|e| TransportError::xhttp(e.to_string()))?;
            let response = response
                .await
                .map_err(|e| TransportError::xhttp(e.to_string()))?;
            if !response.status().is_success() {
                return Err(TransportError::xhttp(format!(
                    "stream-one POST answered {}",
                    response.status()
                )));
            }
            let recv = response.into_body();
            debug!("XHTTP stream-one open at {}", params.path);
            Ok(XhttpStream {
                recv,
                recv_buf: BytesMut::new(),
                recv_done: false,
                uplink: Uplink::StreamOne { send },
            })
        }
        XhttpMode::PacketUp => {
            let session = Uuid::new_v4().simple().to_string();
            let down_path = format!("{}/{session}", params.path.trim_end_matches('/'));
            let request = build_request(Method::GET, &authority, &down_path, params)?;
            let (response, _) = client
                .send_request(request, true)
                .map_err(|e| TransportError::xhttp(e.to_string()))?;
            let response = response
                .await
                .map_err(|e| TransportError::xhttp(e.to_string()))?;
            if !response.status().is_success() {
                return Err(TransportError::xhttp(format!(
                    "packet-up GET answered {}",
                    response.status()
                )));
            }
            let recv = response.into_body();
            debug!("XHTTP packet-up open, session {session}");
            Ok(XhttpStream {
                recv,
                recv_buf: BytesMut::new(),
                recv_done: false,
                uplink: Uplink::PacketUp {
                    client,
                    params: params.clone(),
                    authority,
                    down_path,
                    seq: 0,
                },
            })
        }
    }
}

enum Uplink {
    StreamOne {
        send: h2::SendStream<Bytes>,
    },
    PacketUp {
        client: h2::client::SendRequest<Bytes>,
        params: XhttpParameters,
        authority: String,
        down_path: String,
        seq: u64,
    },
}

/// Byte stream over the HTTP/2 bodies
pub struct XhttpStream {
    recv: h2::RecvStream,
    recv_buf: BytesMut,
    recv_done: bool,
    uplink: Uplink,
}

impl std::fmt::Debug for XhttpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.uplink {
            Uplink::StreamOne { .. } => "stream-one",
            Uplink::PacketUp { .. } => "packet-up",
        };
        f.debug_struct("XhttpStream").field("mode", &mode).finish()
    }
}

impl AsyncRead for XhttpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.recv_buf.is_empty() {
                let n = this.recv_buf.len().min(buf.remaining());
                buf.put_slice(&this.recv_buf[..n]);
                this.recv_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.recv_done {
                return Poll::Ready(Ok(()));
            }
            match this.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = this
                        .recv
                        .flow_control()
                        .release_capacity(data.len());
                    this.recv_buf.extend_from_slice(&data);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)));
                }
                Poll::Ready(None) => {
                    this.recv_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for XhttpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.uplink {
            Uplink::StreamOne { send } => {
                send.send_data(Bytes::copy_from_slice(buf), false)
                    .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
                Poll::Ready(Ok(buf.len()))
            }
            Uplink::PacketUp {
                client,
                params,
                authority,
                down_path,
                seq,
            } => {
                match client.poll_ready(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)));
                    }
                    Poll::Pending => return Poll::Pending,
                }
                let path = format!("{down_path}/{seq}");
                *seq += 1;
                let request = build_request(Method::POST, authority, &path, params)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
                let (response, mut send) = client
                    .send_request(request, false)
                    .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
                send.send_data(Bytes::copy_from_slice(buf), true)
                    .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
                // Drain the per-chunk response off the task
                tokio::spawn(async move {
                    let _ = response.await;
                });
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Uplink::StreamOne { send } = &mut this.uplink {
            let _ = send.send_data(Bytes::new(), true);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_headers() {
        let params = XhttpParameters {
            headers: vec![("X-Env".to_string(), "prod".to_string())],
            ..XhttpParameters::default()
        };
        let req = build_request(Method::POST, "cdn.example.com", "/up", &params).unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/up");
        assert_eq!(req.uri().host(), Some("cdn.example.com"));
        assert_eq!(
            req.headers().get("content-type").unwrap(),
            "application/grpc"
        );
        assert_eq!(req.headers().get("X-Env").unwrap(), "prod");
    }

    #[test]
    fn test_no_grpc_header_flag() {
        let params = XhttpParameters {
            no_grpc_header: true,
            ..XhttpParameters::default()
        };
        let req = build_request(Method::GET, "h", "/", &params).unwrap();
        assert!(req.headers().get("content-type").is_none());
    }
}
