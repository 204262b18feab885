//! Per-5-tuple UDP flows
//!
//! A flow is created on the first datagram of a `(src, dst)` pair and
//! relays through one of three paths:
//!
//! | condition | path |
//! |---|---|
//! | forced bypass or GeoIP bypass | direct UDP socket |
//! | Vision flow + mux on the default config | mux UDP session (XUDP) |
//! | otherwise | dedicated VLESS UDP connection |
//!
//! Datagrams arriving while the outbound dials queue up to 16 KiB; past
//! that they drop silently, which is just UDP loss. A 1 Hz sweep closes
//! flows idle beyond 60 s; at 200 live flows new ones are refused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::StackHandle;
use crate::config::VlessConfig;
use crate::error::TunnelError;
use crate::mux::{MuxManager, MuxSession};
use crate::vless::{Destination, VlessConnection, VlessUdpConnection};

/// Queued bytes allowed while the outbound dials
pub const CONNECT_QUEUE_LIMIT: usize = 16 * 1024;
/// Live flow cap
pub const MAX_FLOWS: usize = 200;
/// Idle cutoff
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Flow key: the full 4-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpFlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Stack-side handle to one running flow task
struct UdpFlowHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    last_activity: Arc<AtomicU64>,
}

/// All live UDP flows, owned by the stack runtime
#[derive(Default)]
pub(crate) struct UdpFlowTable {
    flows: HashMap<UdpFlowKey, UdpFlowHandle>,
}

impl UdpFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// True when a new flow may still be admitted
    pub fn has_capacity(&self) -> bool {
        self.flows.len() < MAX_FLOWS
    }

    /// Forward a datagram into an existing flow.
    ///
    /// On a miss (or a dead flow task) the payload comes back so the
    /// caller can start a fresh flow with it.
    pub fn forward(&mut self, key: &UdpFlowKey, payload: Vec<u8>) -> Option<Vec<u8>> {
        let Some(handle) = self.flows.get(key) else {
            return Some(payload);
        };
        handle.last_activity.store(now_secs(), Ordering::Relaxed);
        match handle.tx.send(payload) {
            Ok(()) => None,
            Err(mpsc::error::SendError(payload)) => {
                // The task is gone (outbound died); drop the entry so the
                // next datagram starts a fresh flow
                self.flows.remove(key);
                Some(payload)
            }
        }
    }

    /// Register and spawn a new flow task.
    pub fn spawn(&mut self, key: UdpFlowKey, ctx: UdpFlowContext) {
        let (tx, rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(AtomicU64::new(now_secs()));
        self.flows.insert(
            key,
            UdpFlowHandle {
                tx,
                last_activity: Arc::clone(&last_activity),
            },
        );
        tokio::spawn(run(ctx, rx, last_activity));
    }

    /// Drop flows idle beyond the cutoff; their tasks end when the
    /// channel closes.
    pub fn sweep(&mut self) {
        let cutoff = now_secs().saturating_sub(IDLE_TIMEOUT.as_secs());
        let before = self.flows.len();
        self.flows
            .retain(|_, handle| handle.last_activity.load(Ordering::Relaxed) >= cutoff);
        let removed = before - self.flows.len();
        if removed > 0 {
            debug!("UDP sweep removed {removed} idle flows ({} live)", self.flows.len());
        }
    }

    /// Drop everything (reload teardown)
    pub fn clear(&mut self) {
        self.flows.clear();
    }
}

/// Outbound path of one flow
pub(crate) enum UdpTarget {
    Direct,
    Vless(Box<VlessConfig>),
    Mux {
        manager: Arc<tokio::sync::Mutex<MuxManager>>,
        global_id: Option<[u8; 8]>,
    },
}

pub(crate) struct UdpFlowContext {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub dest: Destination,
    pub target: UdpTarget,
    pub stack: StackHandle,
}

enum UdpOutbound {
    Direct(UdpSocket),
    Vless(VlessUdpConnection),
    Mux(MuxSession),
}

impl UdpOutbound {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TunnelError> {
        match self {
            Self::Direct(socket) => {
                socket.send(payload).await?;
                Ok(())
            }
            Self::Vless(conn) => conn.send_datagram(payload).await,
            Self::Mux(session) => session.send(payload).map_err(TunnelError::from),
        }
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        match self {
            Self::Direct(socket) => {
                let mut buf = vec![0u8; 65_535];
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        buf.truncate(n);
                        Some(buf)
                    }
                    Err(_) => None,
                }
            }
            Self::Vless(conn) => conn.recv_datagram().await.ok().flatten(),
            Self::Mux(session) => session.recv().await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Direct(_) => {}
            Self::Vless(conn) => conn.close().await,
            Self::Mux(session) => session.close(),
        }
    }
}

async fn establish(ctx: &UdpFlowContext) -> Result<UdpOutbound, TunnelError> {
    match &ctx.target {
        UdpTarget::Direct => {
            let bind_addr = if ctx.dst.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket
                .connect((ctx.dest.host_string(), ctx.dest.port))
                .await?;
            Ok(UdpOutbound::Direct(socket))
        }
        UdpTarget::Vless(config) => {
            let conn = VlessConnection::connect_udp(config, &ctx.dest, None).await?;
            Ok(UdpOutbound::Vless(conn))
        }
        UdpTarget::Mux { manager, global_id } => {
            let mut manager = manager.lock().await;
            let session = manager.open_udp(&ctx.dest, *global_id).await?;
            Ok(UdpOutbound::Mux(session))
        }
    }
}

async fn run(
    ctx: UdpFlowContext,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    last_activity: Arc<AtomicU64>,
) {
    trace!("UDP flow {} -> {}", ctx.src, ctx.dest);

    // Dial while queueing inbound datagrams, dropping beyond the cap
    let connect = establish(&ctx);
    tokio::pin!(connect);
    let mut queued: Vec<Vec<u8>> = Vec::new();
    let mut queued_bytes = 0usize;

    let mut outbound = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(outbound) => break outbound,
                Err(e) => {
                    debug!("UDP flow {} dial failed: {e}", ctx.dest);
                    return;
                }
            },
            maybe = rx.recv() => match maybe {
                Some(payload) => {
                    if queued_bytes + payload.len() <= CONNECT_QUEUE_LIMIT {
                        queued_bytes += payload.len();
                        queued.push(payload);
                    } else {
                        trace!("UDP flow {} connect queue full, dropping", ctx.dest);
                    }
                }
                None => return,
            }
        }
    };

    // Flush the queue; the VLESS path frames everything into one write
    match &mut outbound {
        UdpOutbound::Vless(conn) => {
            let payloads: Vec<&[u8]> = queued.iter().map(Vec::as_slice).collect();
            if conn.send_datagrams(payloads).await.is_err() {
                return;
            }
        }
        other => {
            for payload in &queued {
                if other.send(payload).await.is_err() {
                    return;
                }
            }
        }
    }
    drop(queued);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(payload) => {
                    last_activity.store(now_secs(), Ordering::Relaxed);
                    if let Err(e) = outbound.send(&payload).await {
                        debug!("UDP flow {} send failed: {e}", ctx.dest);
                        break;
                    }
                }
                // Swept as idle, or the stack tore down
                None => break,
            },
            response = outbound.recv() => match response {
                Some(payload) => {
                    last_activity.store(now_secs(), Ordering::Relaxed);
                    // Source and destination swap so the local side sees
                    // a reply from where it sent
                    ctx.stack.udp_sendto(ctx.dst, ctx.src, payload);
                }
                None => {
                    trace!("UDP flow {} outbound closed", ctx.dest);
                    break;
                }
            },
        }
    }

    outbound.close().await;
}
