//! Transport layer
//!
//! Establishes the outbound connection a VLESS stream rides on. Three
//! layers compose:
//!
//! ```text
//! TransportConfig
//!       |
//!       v
//!   connect()
//!       |
//!       +-> TCP dial                       (tcp)
//!       +-> security: none | TLS | Reality (tls, reality)
//!       +-> carrier: raw | WebSocket | HTTP-Upgrade | XHTTP
//!       |
//!       v
//!   TransportStream (AsyncRead + AsyncWrite)
//! ```
//!
//! WebSocket supports embedding early data into the upgrade request; the
//! dispatcher reports how many of the caller's first bytes were consumed
//! that way so they are not sent twice.

mod error;
mod httpupgrade;
mod tcp;
mod tls;
mod websocket;
mod xhttp;

pub use error::TransportError;
pub use httpupgrade::BufferedStream;
pub use websocket::{WebSocketWrapper, DEFAULT_USER_AGENT};
pub use xhttp::XhttpStream;

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::config::{
    HttpUpgradeParameters, RealityParameters, TlsParameters, TransportKind, VlessConfig,
    WsParameters,
};
use crate::reality::RealityStream;

/// Security layer under the carrier
#[derive(Debug, Clone)]
pub enum SecurityLayer {
    None,
    Tls(TlsParameters),
    Reality(RealityParameters),
}

/// Carrier above the security layer
#[derive(Debug, Clone)]
pub enum CarrierLayer {
    Raw,
    WebSocket(WsParameters),
    HttpUpgrade(HttpUpgradeParameters),
    Xhttp(crate::config::XhttpParameters),
}

/// Everything needed to dial one outbound connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server host (domain or IP literal)
    pub address: String,
    pub port: u16,
    /// Pre-resolved server IP, skipping DNS
    pub resolved_ip: Option<IpAddr>,
    pub security: SecurityLayer,
    pub carrier: CarrierLayer,
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl TransportConfig {
    /// Plain TCP to `address:port`
    #[must_use]
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            resolved_ip: None,
            security: SecurityLayer::None,
            carrier: CarrierLayer::Raw,
            connect_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
        }
    }

    #[must_use]
    pub fn with_tls(mut self, params: TlsParameters) -> Self {
        self.security = SecurityLayer::Tls(params);
        self
    }

    #[must_use]
    pub fn with_reality(mut self, params: RealityParameters) -> Self {
        self.security = SecurityLayer::Reality(params);
        self
    }

    #[must_use]
    pub fn with_websocket(mut self, params: WsParameters) -> Self {
        self.carrier = CarrierLayer::WebSocket(params);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Derive the transport plan from an admitted config
    #[must_use]
    pub fn from_vless(config: &VlessConfig) -> Self {
        let security = match config.security {
            crate::config::Security::None => SecurityLayer::None,
            crate::config::Security::Tls => {
                SecurityLayer::Tls(config.tls.clone().unwrap_or_default())
            }
            crate::config::Security::Reality => match &config.reality {
                Some(r) => SecurityLayer::Reality(r.clone()),
                // Admission guarantees this; fall back to no security
                None => SecurityLayer::None,
            },
        };
        let carrier = match config.transport {
            TransportKind::Tcp => CarrierLayer::Raw,
            TransportKind::Ws => {
                CarrierLayer::WebSocket(config.ws.clone().unwrap_or_default())
            }
            TransportKind::HttpUpgrade => {
                CarrierLayer::HttpUpgrade(config.http_upgrade.clone().unwrap_or_default())
            }
            TransportKind::Xhttp => {
                CarrierLayer::Xhttp(config.xhttp.clone().unwrap_or_default())
            }
        };
        Self {
            address: config.server_address.clone(),
            port: config.server_port,
            resolved_ip: config.resolved_ip,
            security,
            carrier,
            connect_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
        }
    }

    #[must_use]
    pub fn address_string(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// TCP with an optional security layer; what carriers ride on
#[derive(Debug)]
pub enum SecureStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Reality(Box<RealityStream<TcpStream>>),
}

macro_rules! delegate_secure {
    ($self:ident, $inner:ident => $e:expr) => {
        match $self.get_mut() {
            SecureStream::Plain($inner) => $e,
            SecureStream::Tls($inner) => $e,
            SecureStream::Reality($inner) => $e,
        }
    };
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate_secure!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate_secure!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_secure!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_secure!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

/// Established transport connection
#[derive(Debug)]
pub enum TransportStream {
    /// Raw carrier: TCP, TLS or Reality directly
    Secure(SecureStream),
    WebSocket(Box<WebSocketWrapper>),
    HttpUpgrade(Box<BufferedStream>),
    Xhttp(Box<XhttpStream>),
}

macro_rules! delegate_transport {
    ($self:ident, $inner:ident => $e:expr) => {
        match $self.get_mut() {
            TransportStream::Secure($inner) => {
                let $inner = Pin::new($inner);
                $e
            }
            TransportStream::WebSocket($inner) => {
                let $inner = Pin::new($inner.as_mut());
                $e
            }
            TransportStream::HttpUpgrade($inner) => {
                let $inner = Pin::new($inner.as_mut());
                $e
            }
            TransportStream::Xhttp($inner) => {
                let $inner = Pin::new($inner.as_mut());
                $e
            }
        }
    };
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate_transport!(self, s => s.poll_read(cx, buf))
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate_transport!(self, s => s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_transport!(self, s => s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_transport!(self, s => s.poll_shutdown(cx))
    }
}

/// Dial TCP and run the configured security layer
async fn secure_connect(config: &TransportConfig) -> Result<SecureStream, TransportError> {
    let tcp = tcp::dial(
        &config.address,
        config.port,
        config.resolved_ip,
        config.connect_timeout,
        config.tcp_nodelay,
    )
    .await?;

    match &config.security {
        SecurityLayer::None => Ok(SecureStream::Plain(tcp)),
        SecurityLayer::Tls(params) => {
            let tls = tls::handshake(tcp, params, &config.address).await?;
            Ok(SecureStream::Tls(Box::new(tls)))
        }
        SecurityLayer::Reality(params) => {
            let reality = crate::reality::connect(params, tcp).await?;
            Ok(SecureStream::Reality(Box::new(reality)))
        }
    }
}

/// One carrier's way of establishing a connection
///
/// Implementations handle the carrier step above the security layer;
/// `early_data` is offered to carriers that can embed it and the second
/// tuple element reports how much of it they consumed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the full transport.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` on dial, handshake or upgrade failure.
    async fn connect(
        &self,
        config: &TransportConfig,
        early_data: &[u8],
    ) -> Result<(TransportStream, usize), TransportError>;
}

/// Raw carrier: the secure stream itself
pub struct RawTransport;

#[async_trait]
impl Transport for RawTransport {
    async fn connect(
        &self,
        config: &TransportConfig,
        _early_data: &[u8],
    ) -> Result<(TransportStream, usize), TransportError> {
        let secure = secure_connect(config).await?;
        Ok((TransportStream::Secure(secure), 0))
    }
}

/// WebSocket carrier
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        config: &TransportConfig,
        early_data: &[u8],
    ) -> Result<(TransportStream, usize), TransportError> {
        let CarrierLayer::WebSocket(params) = &config.carrier else {
            return Err(TransportError::ws_upgrade("not a websocket config"));
        };
        let secure = secure_connect(config).await?;
        let (ws, consumed) =
            websocket::upgrade(secure, params, &config.address, early_data).await?;
        Ok((TransportStream::WebSocket(Box::new(ws)), consumed))
    }
}

/// HTTP-Upgrade carrier
pub struct HttpUpgradeTransport;

#[async_trait]
impl Transport for HttpUpgradeTransport {
    async fn connect(
        &self,
        config: &TransportConfig,
        _early_data: &[u8],
    ) -> Result<(TransportStream, usize), TransportError> {
        let CarrierLayer::HttpUpgrade(params) = &config.carrier else {
            return Err(TransportError::http_upgrade("not an http-upgrade config"));
        };
        let secure = secure_connect(config).await?;
        let upgraded = httpupgrade::upgrade(secure, params, &config.address).await?;
        Ok((TransportStream::HttpUpgrade(Box::new(upgraded)), 0))
    }
}

/// XHTTP carrier
pub struct XhttpTransport;

#[async_trait]
impl Transport for XhttpTransport {
    async fn connect(
        &self,
        config: &TransportConfig,
        _early_data: &[u8],
    ) -> Result<(TransportStream, usize), TransportError> {
        let CarrierLayer::Xhttp(params) = &config.carrier else {
            return Err(TransportError::xhttp("not an xhttp config"));
        };
        let secure = secure_connect(config).await?;
        let stream = xhttp::connect(secure, params, &config.address).await?;
        Ok((TransportStream::Xhttp(Box::new(stream)), 0))
    }
}

/// Dial the full transport.
///
/// # Errors
///
/// Returns `TransportError` on dial, handshake or upgrade failure.
pub async fn connect(config: &TransportConfig) -> Result<TransportStream, TransportError> {
    let (stream, _) = connect_with_early_data(config, &[]).await?;
    Ok(stream)
}

/// Dial the full transport, offering `early_data` to carriers that can
/// embed it (WebSocket). Returns the stream and how many early bytes
/// were consumed; the caller must send the remainder itself.
///
/// # Errors
///
/// Returns `TransportError` on dial, handshake or upgrade failure.
pub async fn connect_with_early_data(
    config: &TransportConfig,
    early_data: &[u8],
) -> Result<(TransportStream, usize), TransportError> {
    let transport: &dyn Transport = match &config.carrier {
        CarrierLayer::Raw => &RawTransport,
        CarrierLayer::WebSocket(_) => &WebSocketTransport,
        CarrierLayer::HttpUpgrade(_) => &HttpUpgradeTransport,
        CarrierLayer::Xhttp(_) => &XhttpTransport,
    };
    transport.connect(config, early_data).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_vless() {
        let config: VlessConfig = serde_json::from_value(serde_json::json!({
            "serverAddress": "proxy.example.com",
            "serverPort": 8443,
            "uuid": "550e8400-e29b-41d4-a716-446655440000",
            "transport": "ws",
            "security": "tls",
            "tlsServerName": "cdn.example.com",
            "wsPath": "/tunnel",
        }))
        .unwrap();
        let tc = TransportConfig::from_vless(&config);
        assert_eq!(tc.address, "proxy.example.com");
        assert_eq!(tc.port, 8443);
        assert!(matches!(tc.security, SecurityLayer::Tls(_)));
        match &tc.carrier {
            CarrierLayer::WebSocket(ws) => assert_eq!(ws.path, "/tunnel"),
            other => panic!("unexpected carrier {other:?}"),
        }
    }

    #[test]
    fn test_builders() {
        let tc = TransportConfig::tcp("h.example", 443)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(tc.address_string(), "h.example:443");
        assert_eq!(tc.connect_timeout, Duration::from_secs(5));
        assert!(matches!(tc.security, SecurityLayer::None));
        assert!(matches!(tc.carrier, CarrierLayer::Raw));
    }

    #[tokio::test]
    async fn test_connect_plain_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let config = TransportConfig::tcp("127.0.0.1", addr.port());
        let mut stream = connect(&config).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }
}
