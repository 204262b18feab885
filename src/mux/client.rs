//! Mux client and sessions
//!
//! A [`MuxClient`] owns one VLESS connection to the default endpoint and
//! multiplexes up to 32 sessions over it. Stream ids are allocated
//! monotonically from 1 and never reused within a client; at the cap the
//! client refuses (`MuxError::ClientFull`) and the manager spins up a
//! sibling. A malformed frame is fatal to the client: every session
//! receives a synthetic close.
//!
//! An I/O task owns the carrier connection; sessions and the client talk
//! to it over channels, so the carrier is never touched from two tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::error::MuxError;
use super::frame::{FrameDecoder, MuxFrame, MuxNetwork};
use crate::config::VlessConfig;
use crate::error::TunnelError;
use crate::vless::{encode_datagram, DatagramDecoder, Destination, VlessConnection};

/// Maximum live sessions per client
pub const MAX_SESSIONS: usize = 32;

/// Default idle keepalive period
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Special destination the mux carrier connects to
const MUX_TARGET_HOST: &str = "v1.mux.cool";
const MUX_TARGET_PORT: u16 = 9527;

/// Events delivered to a session
#[derive(Debug)]
enum SessionEvent {
    Data(Vec<u8>),
    Closed,
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<SessionEvent>,
    /// Present for UDP sessions: splits Keep payloads into datagrams
    udp_decoder: Option<DatagramDecoder>,
}

struct ClientShared {
    sessions: HashMap<u16, SessionEntry>,
    next_id: u16,
    closed: bool,
}

impl ClientShared {
    fn close_all(&mut self) {
        self.closed = true;
        for (_, entry) in self.sessions.drain() {
            let _ = entry.tx.send(SessionEvent::Closed);
        }
    }
}

/// One multiplexed carrier connection
pub struct MuxClient {
    shared: Arc<Mutex<ClientShared>>,
    frame_tx: mpsc::UnboundedSender<MuxFrame>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl MuxClient {
    /// Dial the carrier and start the I/O task.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` when the underlying VLESS dial fails.
    pub async fn connect(config: &VlessConfig) -> Result<Self, TunnelError> {
        Self::connect_with_keepalive(config, KEEPALIVE_PERIOD).await
    }

    /// Dial with an explicit keepalive period.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` when the underlying VLESS dial fails.
    pub async fn connect_with_keepalive(
        config: &VlessConfig,
        keepalive: Duration,
    ) -> Result<Self, TunnelError> {
        let dest = Destination::domain(MUX_TARGET_HOST, MUX_TARGET_PORT);
        let conn = VlessConnection::connect_tcp(config, &dest, &[]).await?;
        debug!("Mux client connected to {}", config.dial_address());

        let shared = Arc::new(Mutex::new(ClientShared {
            sessions: HashMap::new(),
            next_id: 1,
            closed: false,
        }));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(io_task(
            conn,
            frame_rx,
            shutdown_rx,
            Arc::clone(&shared),
            keepalive,
        ));

        Ok(Self {
            shared,
            frame_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Number of live sessions
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    /// At the session cap
    #[must_use]
    pub fn is_full(&self) -> bool {
        let s = self.shared.lock();
        s.sessions.len() >= MAX_SESSIONS
    }

    /// The carrier is gone; the client dispatches nothing anymore
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn register(&self, is_udp: bool) -> Result<(u16, mpsc::UnboundedReceiver<SessionEvent>), MuxError> {
        let mut s = self.shared.lock();
        if s.closed {
            return Err(MuxError::ClientClosed);
        }
        if s.sessions.len() >= MAX_SESSIONS {
            return Err(MuxError::ClientFull);
        }
        if s.next_id == u16::MAX {
            return Err(MuxError::StreamIdsExhausted);
        }
        let id = s.next_id;
        s.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        s.sessions.insert(
            id,
            SessionEntry {
                tx,
                udp_decoder: is_udp.then(DatagramDecoder::new),
            },
        );
        Ok((id, rx))
    }

    /// Open a TCP stream to `dest`.
    ///
    /// # Errors
    ///
    /// Returns `MuxError` when the client is full, closed or out of ids.
    pub fn open_tcp(&self, dest: &Destination) -> Result<MuxSession, MuxError> {
        let (id, events) = self.register(false)?;
        let frame = MuxFrame::New {
            stream_id: id,
            network: MuxNetwork::Tcp,
            port: dest.port,
            address: dest.vless_address(),
            global_id: None,
        };
        self.frame_tx
            .send(frame)
            .map_err(|_| MuxError::ClientClosed)?;
        trace!("Mux session {id} opened (tcp {dest})");
        Ok(self.session(id, events, false))
    }

    /// Open a UDP stream to `dest`, optionally pinned by an XUDP id.
    ///
    /// # Errors
    ///
    /// Returns `MuxError` when the client is full, closed or out of ids.
    pub fn open_udp(
        &self,
        dest: &Destination,
        global_id: Option<[u8; 8]>,
    ) -> Result<MuxSession, MuxError> {
        let (id, events) = self.register(true)?;
        let frame = MuxFrame::New {
            stream_id: id,
            network: MuxNetwork::Udp,
            port: dest.port,
            address: dest.vless_address(),
            global_id,
        };
        self.frame_tx
            .send(frame)
            .map_err(|_| MuxError::ClientClosed)?;
        trace!("Mux session {id} opened (udp {dest})");
        Ok(self.session(id, events, true))
    }

    fn session(
        &self,
        id: u16,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        is_udp: bool,
    ) -> MuxSession {
        MuxSession {
            id,
            frame_tx: self.frame_tx.clone(),
            events,
            shared: Arc::clone(&self.shared),
            is_udp,
            ended: false,
        }
    }

    /// Tear the client down: every session sees a synthetic close and
    /// the I/O task stops.
    pub fn close(&self) {
        self.shared.lock().close_all();
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn io_task(
    mut conn: VlessConnection,
    mut frame_rx: mpsc::UnboundedReceiver<MuxFrame>,
    mut shutdown_rx: oneshot::Receiver<()>,
    shared: Arc<Mutex<ClientShared>>,
    keepalive: Duration,
) {
    let mut decoder = FrameDecoder::new();
    let mut interval = tokio::time::interval(keepalive);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.reset();
    let mut sent_since_tick = false;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,

            maybe_frame = frame_rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                let wire = match frame.encode() {
                    Ok(w) => w,
                    Err(e) => {
                        warn!("Dropping unencodable mux frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = conn.send(&wire).await {
                    warn!("Mux carrier send failed: {e}");
                    break;
                }
                sent_since_tick = true;
            }

            result = conn.recv() => {
                match result {
                    Ok(chunk) if chunk.is_empty() => {
                        debug!("Mux carrier EOF");
                        break;
                    }
                    Ok(chunk) => {
                        decoder.push(&chunk);
                        if !dispatch_frames(&mut decoder, &shared) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Mux carrier recv failed: {e}");
                        break;
                    }
                }
            }

            _ = interval.tick() => {
                if !sent_since_tick {
                    let wire = MuxFrame::KeepAlive.encode().expect("static frame");
                    if conn.send(&wire).await.is_err() {
                        break;
                    }
                }
                sent_since_tick = false;
            }
        }
    }

    shared.lock().close_all();
}

/// Dispatch all complete frames; false means a protocol violation that
/// kills the client.
fn dispatch_frames(decoder: &mut FrameDecoder, shared: &Arc<Mutex<ClientShared>>) -> bool {
    loop {
        match decoder.next() {
            Ok(Some(frame)) => {
                let mut s = shared.lock();
                match frame {
                    MuxFrame::Keep { stream_id, payload } => {
                        if let Some(entry) = s.sessions.get_mut(&stream_id) {
                            match &mut entry.udp_decoder {
                                Some(udp) => {
                                    udp.push(&payload);
                                    while let Some(datagram) = udp.next() {
                                        let _ = entry.tx.send(SessionEvent::Data(datagram));
                                    }
                                }
                                None => {
                                    let _ = entry.tx.send(SessionEvent::Data(payload));
                                }
                            }
                        } else {
                            trace!("Mux Keep for unknown stream {stream_id}");
                        }
                    }
                    MuxFrame::End { stream_id, error } => {
                        if let Some(entry) = s.sessions.remove(&stream_id) {
                            trace!("Mux session {stream_id} ended (err {error})");
                            let _ = entry.tx.send(SessionEvent::Closed);
                        }
                    }
                    MuxFrame::KeepAlive => {}
                    MuxFrame::New { stream_id, .. } => {
                        trace!("Ignoring server-initiated mux stream {stream_id}");
                    }
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!("Mux frame violation, closing client: {e}");
                return false;
            }
        }
    }
}

/// One stream within a mux client
pub struct MuxSession {
    id: u16,
    frame_tx: mpsc::UnboundedSender<MuxFrame>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    shared: Arc<Mutex<ClientShared>>,
    is_udp: bool,
    ended: bool,
}

impl MuxSession {
    /// Stream id within the client
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Send one buffer; UDP payloads are length-framed into the Keep.
    ///
    /// # Errors
    ///
    /// Returns `MuxError` when the session or client is gone.
    pub fn send(&self, data: &[u8]) -> Result<(), MuxError> {
        if self.ended {
            return Err(MuxError::SessionClosed);
        }
        let payload = if self.is_udp {
            encode_datagram(data).map_err(|e| MuxError::invalid_frame(e.to_string()))?
        } else {
            data.to_vec()
        };
        self.frame_tx
            .send(MuxFrame::Keep {
                stream_id: self.id,
                payload,
            })
            .map_err(|_| MuxError::ClientClosed)
    }

    /// Receive the next buffer (one datagram for UDP); `None` once the
    /// stream is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if self.ended {
            return None;
        }
        match self.events.recv().await {
            Some(SessionEvent::Data(data)) => Some(data),
            Some(SessionEvent::Closed) | None => {
                self.ended = true;
                None
            }
        }
    }

    /// Close the stream and tell the peer
    pub fn close(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.shared.lock().sessions.remove(&self.id);
        let _ = self.frame_tx.send(MuxFrame::End {
            stream_id: self.id,
            error: 0,
        });
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("id", &self.id)
            .field("is_udp", &self.is_udp)
            .field("ended", &self.ended)
            .finish()
    }
}
