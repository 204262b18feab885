//! Reality client handshake and record stream
//!
//! To a passive observer this is a vanilla TLS 1.3 connection to the
//! covered SNI: fingerprinted ClientHello, ServerHello, encrypted
//! handshake flight, ChangeCipherSpec, Finished, application data. The
//! client authenticates through the 8 bytes embedded in its random (see
//! [`super::auth`]) and never verifies the covered certificate chain; the
//! tunnel is opaque past the handshake.
//!
//! After [`connect`] returns, [`RealityStream`] carries application bytes
//! through the AES-GCM record layer with application-epoch keys.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};
use x25519_dalek::{PublicKey, StaticSecret};

use super::auth::compute_authenticator;
use super::error::RealityError;
use super::fingerprint::FingerprintProfile;
use super::hello::{build_client_hello, parse_server_hello, HelloParams};
use super::keys::{
    compute_finished, derive_application_keys, derive_handshake_keys, CipherSuite,
};
use super::record::RecordCrypter;
use crate::config::RealityParameters;

/// Upper bound on buffered handshake bytes before giving up
const MAX_HANDSHAKE_BUFFER: usize = 65_536;

/// Pending sealed bytes above which writes report Pending
const WRITE_BACKPRESSURE: usize = 131_072;

const CONTENT_CCS: u8 = 0x14;
const CONTENT_ALERT: u8 = 0x15;
const CONTENT_HANDSHAKE: u8 = 0x16;
const CONTENT_APPLICATION: u8 = 0x17;

/// Handshake message type: Finished
const MSG_FINISHED: u8 = 0x14;

/// Established Reality connection
pub struct RealityStream<S> {
    inner: S,
    read_crypter: RecordCrypter,
    write_crypter: RecordCrypter,
    /// Ciphertext buffered from the socket
    rbuf: BytesMut,
    /// Decrypted application bytes ready for the caller
    plain: BytesMut,
    /// Sealed records not yet written out
    wbuf: BytesMut,
    read_eof: bool,
}

impl<S> std::fmt::Debug for RealityStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealityStream")
            .field("buffered_plain", &self.plain.len())
            .field("read_eof", &self.read_eof)
            .finish()
    }
}

/// Run the emulated handshake over `stream`.
///
/// # Errors
///
/// Returns `RealityError` for I/O failures, a malformed or unsupported
/// ServerHello, or a flight that cannot be decrypted.
pub async fn connect<S>(
    params: &RealityParameters,
    mut stream: S,
) -> Result<RealityStream<S>, RealityError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rng = rand::rngs::OsRng;
    let client_secret = StaticSecret::random_from_rng(&mut rng);
    let client_public = PublicKey::from(&client_secret);

    // The authenticator key comes from the server's static key; the TLS
    // key schedule uses the ephemeral share from the ServerHello.
    let auth_shared = client_secret.diffie_hellman(&PublicKey::from(params.public_key));

    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut client_random = [0u8; 32];
    rng.fill_bytes(&mut client_random[..24]);
    let authenticator = compute_authenticator(
        &params.public_key,
        client_public.as_bytes(),
        auth_shared.as_bytes(),
        &params.short_id,
        unix_secs,
    )?;
    client_random[24..].copy_from_slice(&authenticator);

    let mut session_id = [0u8; 32];
    rng.fill_bytes(&mut session_id);

    let profile = FingerprintProfile::resolve(params.fingerprint, client_random[0]);
    let alpn = vec!["h2".to_string(), "http/1.1".to_string()];
    let (hello_record, ch_handshake) = build_client_hello(
        &profile,
        &HelloParams {
            server_name: &params.server_name,
            alpn: &alpn,
            client_random,
            session_id,
            key_share_public: *client_public.as_bytes(),
        },
    );

    stream.write_all(&hello_record).await?;
    stream.flush().await?;
    trace!(
        "Reality ClientHello sent: {} bytes, fingerprint {:?}",
        hello_record.len(),
        profile.tag
    );

    // Read until the ServerHello is complete
    let mut rbuf = BytesMut::with_capacity(8192);
    let server_hello = loop {
        if let Some(sh) = parse_server_hello(&rbuf) {
            break sh;
        }
        if rbuf.len() > MAX_HANDSHAKE_BUFFER {
            return Err(RealityError::BadServerHello);
        }
        let n = stream.read_buf(&mut rbuf).await?;
        if n == 0 {
            return Err(RealityError::handshake("EOF before ServerHello"));
        }
    };
    rbuf.advance(server_hello.consumed);

    let suite = CipherSuite::from_u16(server_hello.cipher_suite)?;
    let key_shared = client_secret.diffie_hellman(&PublicKey::from(server_hello.key_share));

    let mut transcript = ch_handshake;
    transcript.extend_from_slice(&server_hello.handshake);

    let hs_keys = derive_handshake_keys(suite, key_shared.as_bytes(), &transcript);
    let mut server_hs = RecordCrypter::new(suite, &hs_keys.server);
    let mut client_hs = RecordCrypter::new(suite, &hs_keys.client);

    // Walk the encrypted flight until the server Finished
    let mut messages = BytesMut::new();
    'flight: loop {
        while rbuf.len() >= 5 {
            let content_type = rbuf[0];
            let record_len = u16::from_be_bytes([rbuf[3], rbuf[4]]) as usize;
            if rbuf.len() < 5 + record_len {
                break;
            }
            let header: [u8; 5] = rbuf[..5].try_into().expect("length checked");
            let record = rbuf[5..5 + record_len].to_vec();
            rbuf.advance(5 + record_len);

            match content_type {
                CONTENT_CCS => {
                    // compatibility ChangeCipherSpec, ignored
                }
                CONTENT_ALERT => {
                    let code = record.last().copied().unwrap_or(0);
                    return Err(RealityError::AlertReceived(code));
                }
                CONTENT_APPLICATION => {
                    let (inner_type, content) = server_hs.open_record(&header, &record)?;
                    if inner_type != CONTENT_HANDSHAKE {
                        return Err(RealityError::handshake(format!(
                            "unexpected inner type {inner_type:#04x} during flight"
                        )));
                    }
                    transcript.extend_from_slice(&content);
                    messages.extend_from_slice(&content);
                    if flight_contains_finished(&mut messages) {
                        break 'flight;
                    }
                }
                other => {
                    return Err(RealityError::handshake(format!(
                        "unexpected record type {other:#04x} during flight"
                    )));
                }
            }
        }
        if rbuf.len() > MAX_HANDSHAKE_BUFFER {
            return Err(RealityError::handshake("handshake flight too large"));
        }
        let n = stream.read_buf(&mut rbuf).await?;
        if n == 0 {
            return Err(RealityError::handshake("EOF during handshake flight"));
        }
    }

    // Application keys come from the transcript through the server
    // Finished; our own Finished goes out under the handshake keys.
    let verify_data = compute_finished(suite, &hs_keys.client_traffic_secret, &transcript);
    let app_keys = derive_application_keys(suite, &hs_keys.handshake_secret, &transcript);

    let mut flight = Vec::with_capacity(6 + 5 + verify_data.len() + 32);
    // compatibility CCS
    flight.extend_from_slice(&[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
    let mut finished = Vec::with_capacity(4 + verify_data.len());
    finished.push(MSG_FINISHED);
    finished.extend_from_slice(&(verify_data.len() as u32).to_be_bytes()[1..]);
    finished.extend_from_slice(&verify_data);
    flight.extend_from_slice(&client_hs.seal_record(CONTENT_HANDSHAKE, &finished)?);
    stream.write_all(&flight).await?;
    stream.flush().await?;

    debug!(
        "Reality handshake complete: suite {:#06x}, sni {}",
        suite.as_u16(),
        params.server_name
    );

    Ok(RealityStream {
        inner: stream,
        read_crypter: RecordCrypter::new(suite, &app_keys.server),
        write_crypter: RecordCrypter::new(suite, &app_keys.client),
        rbuf,
        plain: BytesMut::new(),
        wbuf: BytesMut::new(),
        read_eof: false,
    })
}

/// Scan accumulated handshake messages for a complete Finished
fn flight_contains_finished(messages: &mut BytesMut) -> bool {
    while messages.len() >= 4 {
        let msg_type = messages[0];
        let msg_len =
            u32::from_be_bytes([0, messages[1], messages[2], messages[3]]) as usize;
        if messages.len() < 4 + msg_len {
            return false;
        }
        messages.advance(4 + msg_len);
        if msg_type == MSG_FINISHED {
            return true;
        }
    }
    false
}

impl<S> RealityStream<S> {
    /// Process buffered ciphertext into plain bytes.
    ///
    /// Returns `Ok(true)` when progress was made.
    fn drain_records(&mut self) -> io::Result<bool> {
        let mut progressed = false;
        while self.rbuf.len() >= 5 {
            let content_type = self.rbuf[0];
            let record_len = u16::from_be_bytes([self.rbuf[3], self.rbuf[4]]) as usize;
            if self.rbuf.len() < 5 + record_len {
                break;
            }
            let header: [u8; 5] = self.rbuf[..5].try_into().expect("length checked");
            let record = self.rbuf[5..5 + record_len].to_vec();
            self.rbuf.advance(5 + record_len);

            match content_type {
                CONTENT_APPLICATION => {
                    let (inner_type, content) = self
                        .read_crypter
                        .open_record(&header, &record)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    match inner_type {
                        CONTENT_APPLICATION => {
                            self.plain.extend_from_slice(&content);
                            progressed = true;
                        }
                        // Session tickets and key-update requests are
                        // not needed by the tunnel
                        CONTENT_HANDSHAKE => trace!("Reality ignoring post-handshake message"),
                        CONTENT_ALERT => {
                            self.read_eof = true;
                            progressed = true;
                        }
                        other => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("unexpected inner content type {other:#04x}"),
                            ));
                        }
                    }
                }
                CONTENT_CCS => {}
                CONTENT_ALERT => {
                    self.read_eof = true;
                    progressed = true;
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected record type {other:#04x}"),
                    ));
                }
            }
        }
        Ok(progressed)
    }

    fn poll_flush_wbuf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while !self.wbuf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.wbuf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.wbuf.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for RealityStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            this.drain_records()?;
            if !this.plain.is_empty() || this.read_eof {
                continue;
            }

            let mut chunk = [0u8; 16_709];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        this.read_eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    this.rbuf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for RealityStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Apply backpressure before sealing more
        if this.wbuf.len() >= WRITE_BACKPRESSURE {
            match this.poll_flush_wbuf(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending if this.wbuf.len() >= WRITE_BACKPRESSURE => return Poll::Pending,
                Poll::Pending => {}
            }
        }

        for chunk in buf.chunks(super::record::MAX_PLAINTEXT) {
            let record = this
                .write_crypter
                .seal_record(CONTENT_APPLICATION, chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            this.wbuf.extend_from_slice(&record);
        }
        // Opportunistic drain; buffered bytes flush on poll_flush
        let _ = this.poll_flush_wbuf(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_wbuf(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_wbuf(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flight_contains_finished() {
        let mut buf = BytesMut::new();
        // EncryptedExtensions (type 0x08), empty
        buf.extend_from_slice(&[0x08, 0, 0, 2, 0, 0]);
        assert!(!flight_contains_finished(&mut buf));

        // Finished with a 32-byte verify
        buf.extend_from_slice(&[0x14, 0, 0, 32]);
        buf.extend_from_slice(&[0xAA; 32]);
        assert!(flight_contains_finished(&mut buf));
    }

    #[test]
    fn test_flight_partial_finished() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x14, 0, 0, 32]);
        buf.extend_from_slice(&[0xAA; 16]);
        assert!(!flight_contains_finished(&mut buf));
        buf.extend_from_slice(&[0xAA; 16]);
        assert!(flight_contains_finished(&mut buf));
    }
}
