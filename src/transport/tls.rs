//! Standard TLS via rustls
//!
//! Used for `security=tls`. Verification uses the webpki root store; the
//! allow-insecure flag swaps in a verifier that accepts anything, for
//! servers on self-signed certificates.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

use super::error::TransportError;
use crate::config::TlsParameters;

/// Accepts any certificate; selected by the allow-insecure flag only
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build a rustls client config from the TLS parameters
fn client_config(params: &TlsParameters) -> ClientConfig {
    let mut config = if params.allow_insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = params
        .alpn
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    config
}

/// Run the TLS handshake over a connected TCP socket.
///
/// The SNI falls back to `fallback_sni` (the server address) when the
/// parameters carry an empty server name.
///
/// # Errors
///
/// Returns `TransportError::TlsHandshake` on name or handshake failure.
pub async fn handshake(
    stream: TcpStream,
    params: &TlsParameters,
    fallback_sni: &str,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let sni = if params.server_name.is_empty() {
        fallback_sni
    } else {
        &params.server_name
    };
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| TransportError::TlsHandshake(format!("bad SNI {sni:?}: {e}")))?;

    let connector = TlsConnector::from(Arc::new(client_config(params)));
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
    trace!("TLS established with sni {sni}");
    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Fingerprint;

    #[test]
    fn test_client_config_alpn() {
        let params = TlsParameters {
            server_name: "example.com".to_string(),
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            allow_insecure: false,
            fingerprint: Fingerprint::Chrome120,
        };
        let config = client_config(&params);
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_insecure_config_builds() {
        let params = TlsParameters {
            server_name: String::new(),
            alpn: Vec::new(),
            allow_insecure: true,
            fingerprint: Fingerprint::Chrome120,
        };
        let _ = client_config(&params);
    }
}
