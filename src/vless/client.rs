//! VLESS outbound connections
//!
//! Connection flow: dial the transport (TCP, then TLS/Reality, then any
//! carrier), write the request header together with the first payload,
//! consume the response header exactly once, then relay. With an active
//! Vision flow the payload passes through the padding codec; the header
//! itself rides ahead of it.
//!
//! When the carrier supports early data (WebSocket `ed`), the header and
//! first payload travel inside the upgrade request.

use std::net::IpAddr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::addons::{parse_addons, VlessAddons};
use super::error::VlessError;
use super::protocol::{VlessAddress, VlessCommand, VlessRequestHeader, VLESS_VERSION};
use super::udp::{encode_datagram, DatagramDecoder};
use crate::config::VlessConfig;
use crate::error::TunnelError;
use crate::transport::{connect_with_early_data, TransportConfig, TransportStream};
use crate::vision::VisionState;

/// Where a flow ultimately wants to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: DestinationHost,
    pub port: u16,
}

/// Destination host form: domain when resolved from a fake IP, IP
/// literal otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationHost {
    Domain(String),
    Ip(IpAddr),
}

impl Destination {
    #[must_use]
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self {
            host: DestinationHost::Domain(name.into()),
            port,
        }
    }

    #[must_use]
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self {
            host: DestinationHost::Ip(addr),
            port,
        }
    }

    /// Host string for direct dialing and logging
    #[must_use]
    pub fn host_string(&self) -> String {
        match &self.host {
            DestinationHost::Domain(d) => d.clone(),
            DestinationHost::Ip(ip) => ip.to_string(),
        }
    }

    /// The VLESS wire form of this destination
    #[must_use]
    pub fn vless_address(&self) -> VlessAddress {
        match &self.host {
            DestinationHost::Domain(d) => VlessAddress::domain(d.clone()),
            DestinationHost::Ip(ip) => VlessAddress::ip(*ip),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host_string(), self.port)
    }
}

/// One live outbound VLESS stream
#[derive(Debug)]
pub struct VlessConnection {
    stream: TransportStream,
    vision: Option<VisionState>,
    /// Post-handshake receive buffer; lets [`Self::recv`] keep a single
    /// await point so it stays safe inside `select!`
    pending: BytesMut,
    response_read: bool,
}

/// Try to strip a response header (`version | addons_len | addons`) off
/// the front of the buffer. `None` means more bytes are needed.
fn parse_response_prefix(buf: &[u8]) -> Result<Option<usize>, VlessError> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };
    if version != VLESS_VERSION {
        return Err(VlessError::InvalidVersion(version));
    }
    let Some(&addons_len) = buf.get(1) else {
        return Ok(None);
    };
    let total = 2 + addons_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    // Addons are validated even though the client ignores their content
    let (_, _) = parse_addons(&buf[1..total])?;
    Ok(Some(total))
}

impl VlessConnection {
    /// Open a TCP-command connection and send the header plus any queued
    /// first payload.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` wrapping the transport dial or protocol
    /// failure; both are fatal to the flow.
    pub async fn connect_tcp(
        config: &VlessConfig,
        dest: &Destination,
        first_payload: &[u8],
    ) -> Result<Self, TunnelError> {
        let addons = if config.flow.is_active() {
            VlessAddons::with_flow(config.flow.as_str())
        } else {
            VlessAddons::new()
        };
        let header = VlessRequestHeader::new(
            *config.uuid.as_bytes(),
            addons,
            VlessCommand::Tcp,
            dest.vless_address(),
            dest.port,
        );

        let mut vision = config
            .flow
            .is_active()
            .then(|| VisionState::new(config.seed));

        let mut first_bytes = header.encode().map_err(TunnelError::from)?;
        if !first_payload.is_empty() {
            match &mut vision {
                Some(v) => first_bytes.extend_from_slice(&v.writer.seal(first_payload)),
                None => first_bytes.extend_from_slice(first_payload),
            }
        }

        let transport = TransportConfig::from_vless(config);
        let (mut stream, consumed) =
            connect_with_early_data(&transport, &first_bytes).await?;
        if consumed < first_bytes.len() {
            stream
                .write_all(&first_bytes[consumed..])
                .await
                .map_err(VlessError::from)?;
            stream.flush().await.map_err(VlessError::from)?;
        }
        debug!(
            "VLESS TCP outbound to {dest} via {} ({} header+payload bytes)",
            transport.address_string(),
            first_bytes.len()
        );

        Ok(Self {
            stream,
            vision,
            pending: BytesMut::new(),
            response_read: false,
        })
    }

    /// Open a UDP-command connection for one flow.
    ///
    /// The flow string still rides in the addons when active, and XUDP
    /// adds the 8-byte global ID.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` on dial or protocol failure.
    pub async fn connect_udp(
        config: &VlessConfig,
        dest: &Destination,
        global_id: Option<[u8; 8]>,
    ) -> Result<VlessUdpConnection, TunnelError> {
        let addons = match (config.flow.is_active(), global_id) {
            (true, Some(id)) => VlessAddons::with_flow_and_global_id(config.flow.as_str(), id),
            (true, None) => VlessAddons::with_flow(config.flow.as_str()),
            (false, Some(id)) => VlessAddons::with_global_id(id),
            (false, None) => VlessAddons::new(),
        };
        let header = VlessRequestHeader::new(
            *config.uuid.as_bytes(),
            addons,
            VlessCommand::Udp,
            dest.vless_address(),
            dest.port,
        );
        let header_bytes = header.encode().map_err(TunnelError::from)?;

        let transport = TransportConfig::from_vless(config);
        let (mut stream, consumed) =
            connect_with_early_data(&transport, &header_bytes).await?;
        if consumed < header_bytes.len() {
            stream
                .write_all(&header_bytes[consumed..])
                .await
                .map_err(VlessError::from)?;
            stream.flush().await.map_err(VlessError::from)?;
        }
        debug!("VLESS UDP outbound to {dest} via {}", transport.address_string());

        Ok(VlessUdpConnection {
            conn: Self {
                stream,
                vision: None,
                pending: BytesMut::new(),
                response_read: false,
            },
            decoder: DatagramDecoder::new(),
        })
    }

    /// Send application bytes, through the Vision writer when active.
    ///
    /// # Errors
    ///
    /// I/O failures are fatal to the flow.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.vision {
            Some(v) => {
                let sealed = v.writer.seal(data);
                self.stream.write_all(&sealed).await.map_err(VlessError::from)?;
            }
            None => {
                self.stream.write_all(data).await.map_err(VlessError::from)?;
            }
        }
        self.stream.flush().await.map_err(VlessError::from)?;
        Ok(())
    }

    /// Pull the next chunk of application bytes.
    ///
    /// Returns an empty buffer on clean EOF. The response header is
    /// consumed exactly once, before any data surfaces. The body has a
    /// single await point, so dropping the future from a `select!` never
    /// loses consumed bytes.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` on a malformed response header, a Vision
    /// desync, or I/O failure.
    pub async fn recv(&mut self) -> Result<Bytes, TunnelError> {
        loop {
            if !self.response_read {
                if let Some(consumed) = parse_response_prefix(&self.pending)? {
                    self.pending.advance(consumed);
                    self.response_read = true;
                    trace!("VLESS response header consumed ({consumed} bytes)");
                    continue;
                }
            } else if !self.pending.is_empty() {
                let chunk = self.pending.split();
                match &mut self.vision {
                    Some(v) => {
                        let mut out = Vec::with_capacity(chunk.len());
                        v.reader.open(&chunk, &mut out)?;
                        if !out.is_empty() {
                            return Ok(Bytes::from(out));
                        }
                        // Padding-only input; keep reading
                    }
                    None => return Ok(chunk.freeze()),
                }
            }

            let mut buf = [0u8; 16_384];
            let n = self.stream.read(&mut buf).await.map_err(VlessError::from)?;
            if n == 0 {
                if !self.response_read {
                    return Err(VlessError::ClosedDuringHandshake.into());
                }
                return Ok(Bytes::new());
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Half-close the write side
    pub async fn shutdown_write(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// UDP flow over one VLESS connection, with the length framing applied
#[derive(Debug)]
pub struct VlessUdpConnection {
    conn: VlessConnection,
    decoder: DatagramDecoder,
}

impl VlessUdpConnection {
    /// Send one datagram, length-framed.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` for oversized payloads or I/O failure.
    pub async fn send_datagram(&mut self, payload: &[u8]) -> Result<(), TunnelError> {
        let frame = encode_datagram(payload)?;
        self.conn
            .stream
            .write_all(&frame)
            .await
            .map_err(VlessError::from)?;
        self.conn.stream.flush().await.map_err(VlessError::from)?;
        Ok(())
    }

    /// Send several queued datagrams in one write.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` for oversized payloads or I/O failure.
    pub async fn send_datagrams<'a, I>(&mut self, payloads: I) -> Result<(), TunnelError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut wire = Vec::new();
        for p in payloads {
            super::udp::encode_datagram_into(p, &mut wire)?;
        }
        if wire.is_empty() {
            return Ok(());
        }
        self.conn
            .stream
            .write_all(&wire)
            .await
            .map_err(VlessError::from)?;
        self.conn.stream.flush().await.map_err(VlessError::from)?;
        Ok(())
    }

    /// Receive the next datagram; `None` on clean EOF.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` for truncated frames or I/O failure.
    pub async fn recv_datagram(&mut self) -> Result<Option<Vec<u8>>, TunnelError> {
        loop {
            if let Some(datagram) = self.decoder.next() {
                return Ok(Some(datagram));
            }
            let chunk = self.conn.recv().await?;
            if chunk.is_empty() {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.push(&chunk);
        }
    }

    /// Close the connection
    pub async fn close(&mut self) {
        self.conn.shutdown_write().await;
    }
}
