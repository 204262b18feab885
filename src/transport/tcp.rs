//! TCP dial
//!
//! Resolves the server address (preferring a pre-resolved IP from the
//! config), connects with a deadline, and applies socket options.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::error::TransportError;

/// Connect a TCP socket to `(host, port)` within `deadline`.
///
/// When `resolved_ip` is given, name resolution is skipped entirely; an
/// IP-literal host short-circuits as well. DNS failures surface as
/// transport dial errors.
///
/// # Errors
///
/// Returns `TransportError` on resolution failure, connect failure or
/// deadline expiry.
pub async fn dial(
    host: &str,
    port: u16,
    resolved_ip: Option<IpAddr>,
    deadline: Duration,
    nodelay: bool,
) -> Result<TcpStream, TransportError> {
    let target = match resolved_ip.or_else(|| host.parse::<IpAddr>().ok()) {
        Some(ip) => SocketAddr::new(ip, port),
        None => {
            let mut addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| TransportError::resolve(host, e.to_string()))?;
            addrs
                .next()
                .ok_or_else(|| TransportError::resolve(host, "no addresses"))?
        }
    };

    let stream = timeout(deadline, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_secs: deadline.as_secs(),
        })?
        .map_err(|e| TransportError::connect(target.to_string(), e.to_string()))?;

    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    trace!("TCP connected to {target}");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = dial(
            "127.0.0.1",
            addr.port(),
            None,
            Duration::from_secs(5),
            true,
        )
        .await
        .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_prefers_resolved_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            let _ = s.read(&mut buf).await;
        });

        // The host would not resolve; the pre-resolved IP wins
        let stream = dial(
            "does-not-exist.invalid",
            addr.port(),
            Some("127.0.0.1".parse().unwrap()),
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();
        drop(stream);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Port 1 on localhost is almost certainly closed
        let result = dial("127.0.0.1", 1, None, Duration::from_secs(5), true).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_resolve_failure() {
        let result = dial(
            "does-not-exist.invalid",
            80,
            None,
            Duration::from_secs(5),
            true,
        )
        .await;
        assert!(matches!(result, Err(TransportError::Resolve { .. })));
    }
}
