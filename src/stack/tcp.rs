//! Per-flow TCP relay
//!
//! One handler per accepted connection. Lifecycle:
//!
//! ```text
//! Connecting -> Established -> UplinkHalfClosed | DownlinkHalfClosed -> Closed
//!      \________________________________________________________/
//!                               v
//!                            Aborted
//! ```
//!
//! A single 60 s handshake timer bounds the whole outbound setup (TCP +
//! TLS + carrier upgrade + VLESS header); inbound bytes queue while it
//! runs and drain on success, advancing the local receive window per
//! completed send. The downlink is a pull: one chunk from the outbound,
//! written into the stack's send buffer; what does not fit lands in an
//! overflow buffer (capped at 512 KiB, beyond which the flow aborts) and
//! the pull pauses until local ACKs drain it.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use super::{FlowId, StackHandle, TcpFlowEvent};
use crate::config::VlessConfig;
use crate::error::TunnelError;
use crate::vless::{Destination, VlessConnection};

/// Bounds the whole outbound setup
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Both directions open
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// One direction already finished
pub const HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Inbound-to-local overflow cap
pub const MAX_OVERFLOW: usize = 512 * 1024;
/// Largest single write into the stack's send buffer
pub const MAX_WRITE_CHUNK: usize = 65_535;

/// Where the flow relays to
#[derive(Debug)]
pub(crate) enum RelayTarget {
    /// Bypass: dial the destination ourselves
    Direct,
    /// Relay through this config
    Vless(Box<VlessConfig>),
}

/// Everything a spawned handler needs
pub(crate) struct TcpFlowContext {
    pub flow_id: FlowId,
    pub dest: Destination,
    pub target: RelayTarget,
    pub stack: StackHandle,
    pub events: mpsc::UnboundedReceiver<TcpFlowEvent>,
}

enum Outbound {
    Direct(TcpStream),
    Vless(VlessConnection),
}

impl Outbound {
    async fn send(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        match self {
            Self::Direct(s) => {
                s.write_all(data).await?;
                Ok(())
            }
            Self::Vless(c) => c.send(data).await,
        }
    }

    async fn recv(&mut self) -> Result<Bytes, TunnelError> {
        match self {
            Self::Direct(s) => {
                let mut buf = [0u8; 16_384];
                let n = s.read(&mut buf).await?;
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Self::Vless(c) => c.recv().await,
        }
    }

    async fn shutdown_write(&mut self) {
        match self {
            Self::Direct(s) => {
                let _ = s.shutdown().await;
            }
            Self::Vless(c) => c.shutdown_write().await,
        }
    }
}

async fn establish(
    target: &RelayTarget,
    dest: &Destination,
    first_payload: &[u8],
) -> Result<Outbound, TunnelError> {
    match target {
        RelayTarget::Direct => {
            let mut stream =
                TcpStream::connect((dest.host_string(), dest.port)).await?;
            let _ = stream.set_nodelay(true);
            if !first_payload.is_empty() {
                stream.write_all(first_payload).await?;
            }
            Ok(Outbound::Direct(stream))
        }
        RelayTarget::Vless(config) => {
            let conn = VlessConnection::connect_tcp(config, dest, first_payload).await?;
            Ok(Outbound::Vless(conn))
        }
    }
}

/// Overflow buffer state for the downlink
struct Backpressure {
    overflow: BytesMut,
    paused: bool,
}

impl Backpressure {
    fn new() -> Self {
        Self {
            overflow: BytesMut::new(),
            paused: false,
        }
    }

    /// Write towards the local side; what the send buffer rejects is kept.
    ///
    /// `Err` means the overflow cap blew or the stack lost the flow.
    async fn push(
        &mut self,
        stack: &StackHandle,
        flow: FlowId,
        data: &[u8],
    ) -> Result<(), ()> {
        if self.overflow.is_empty() {
            let mut off = 0;
            while off < data.len() {
                let chunk = (data.len() - off).min(MAX_WRITE_CHUNK);
                let accepted = stack
                    .tcp_write(flow, Bytes::copy_from_slice(&data[off..off + chunk]))
                    .await
                    .map_err(|_| ())?;
                stack.tcp_output(flow);
                off += accepted;
                if accepted < chunk {
                    break;
                }
            }
            if off < data.len() {
                self.overflow.extend_from_slice(&data[off..]);
            }
        } else {
            self.overflow.extend_from_slice(data);
        }

        if self.overflow.len() > MAX_OVERFLOW {
            return Err(());
        }
        self.paused = !self.overflow.is_empty();
        Ok(())
    }

    /// Retry the overflow after local ACKs freed headroom
    async fn drain(&mut self, stack: &StackHandle, flow: FlowId) -> Result<(), ()> {
        while !self.overflow.is_empty() {
            let chunk = self.overflow.len().min(MAX_WRITE_CHUNK);
            let accepted = stack
                .tcp_write(flow, Bytes::copy_from_slice(&self.overflow[..chunk]))
                .await
                .map_err(|_| ())?;
            stack.tcp_output(flow);
            self.overflow.advance(accepted);
            if accepted < chunk {
                break;
            }
        }
        self.paused = !self.overflow.is_empty();
        Ok(())
    }
}

fn activity_timeout(local_eof: bool, remote_eof: bool) -> Duration {
    if local_eof || remote_eof {
        HALF_CLOSE_TIMEOUT
    } else {
        IDLE_TIMEOUT
    }
}

/// Drive one flow to completion
pub(crate) async fn run(mut ctx: TcpFlowContext) {
    let flow = ctx.flow_id;
    trace!("Flow {flow}: connecting to {} ({:?})", ctx.dest, kind(&ctx.target));

    let mut local_eof = false;
    let mut first_payload = BytesMut::new();

    // Payload the stack delivered before we even started
    while let Ok(ev) = ctx.events.try_recv() {
        match ev {
            TcpFlowEvent::Recv(d) if d.is_empty() => local_eof = true,
            TcpFlowEvent::Recv(d) => first_payload.extend_from_slice(&d),
            TcpFlowEvent::Sent(_) => {}
            TcpFlowEvent::Error(_) => return,
        }
    }

    let connect = establish(&ctx.target, &ctx.dest, &first_payload);
    tokio::pin!(connect);
    let handshake_timer = sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(handshake_timer);

    // Inbound keeps landing while the outbound dials; queue it
    let mut queued = BytesMut::new();
    let mut outbound = loop {
        tokio::select! {
            result = &mut connect => {
                match result {
                    Ok(outbound) => break outbound,
                    Err(e) => {
                        debug!("Flow {flow}: outbound setup failed: {e}");
                        ctx.stack.tcp_abort(flow);
                        return;
                    }
                }
            }
            () = &mut handshake_timer => {
                debug!("Flow {flow}: handshake timeout");
                ctx.stack.tcp_abort(flow);
                return;
            }
            ev = ctx.events.recv() => match ev {
                Some(TcpFlowEvent::Recv(d)) if d.is_empty() => local_eof = true,
                Some(TcpFlowEvent::Recv(d)) => queued.extend_from_slice(&d),
                Some(TcpFlowEvent::Sent(_)) => {}
                Some(TcpFlowEvent::Error(_)) | None => return,
            }
        }
    };

    // Window advances only as sends complete
    if !first_payload.is_empty() {
        ctx.stack.tcp_recved(flow, first_payload.len());
    }
    if !queued.is_empty() {
        if outbound.send(&queued).await.is_err() {
            ctx.stack.tcp_abort(flow);
            return;
        }
        ctx.stack.tcp_recved(flow, queued.len());
    }
    if local_eof {
        outbound.shutdown_write().await;
    }
    trace!("Flow {flow}: established to {}", ctx.dest);

    let mut bp = Backpressure::new();
    let mut remote_eof = false;
    let deadline = sleep(activity_timeout(local_eof, remote_eof));
    tokio::pin!(deadline);

    loop {
        // Both directions finished and everything flushed: clean close
        if local_eof && remote_eof && bp.overflow.is_empty() {
            ctx.stack.tcp_close(flow);
            trace!("Flow {flow}: closed");
            return;
        }

        tokio::select! {
            ev = ctx.events.recv() => match ev {
                Some(TcpFlowEvent::Recv(d)) if d.is_empty() => {
                    local_eof = true;
                    outbound.shutdown_write().await;
                    deadline.as_mut().reset(Instant::now() + activity_timeout(local_eof, remote_eof));
                }
                Some(TcpFlowEvent::Recv(d)) => {
                    let len = d.len();
                    if outbound.send(&d).await.is_err() {
                        ctx.stack.tcp_abort(flow);
                        return;
                    }
                    ctx.stack.tcp_recved(flow, len);
                    deadline.as_mut().reset(Instant::now() + activity_timeout(local_eof, remote_eof));
                }
                Some(TcpFlowEvent::Sent(_)) => {
                    if !bp.overflow.is_empty() {
                        if bp.drain(&ctx.stack, flow).await.is_err() {
                            ctx.stack.tcp_abort(flow);
                            return;
                        }
                        deadline.as_mut().reset(Instant::now() + activity_timeout(local_eof, remote_eof));
                    }
                }
                Some(TcpFlowEvent::Error(code)) => {
                    // The stack already destroyed the control block
                    debug!("Flow {flow}: stack error {code}");
                    return;
                }
                None => return,
            },

            chunk = outbound.recv(), if !bp.paused && !remote_eof => match chunk {
                Ok(data) if data.is_empty() => {
                    remote_eof = true;
                    deadline.as_mut().reset(Instant::now() + activity_timeout(local_eof, remote_eof));
                }
                Ok(data) => {
                    if bp.push(&ctx.stack, flow, &data).await.is_err() {
                        warn!("Flow {flow}: overflow cap exceeded, aborting");
                        ctx.stack.tcp_abort(flow);
                        return;
                    }
                    deadline.as_mut().reset(Instant::now() + activity_timeout(local_eof, remote_eof));
                }
                Err(e) => {
                    debug!("Flow {flow}: outbound error: {e}");
                    ctx.stack.tcp_abort(flow);
                    return;
                }
            },

            () = &mut deadline => {
                debug!(
                    "Flow {flow}: timeout ({})",
                    if local_eof || remote_eof { "half-close" } else { "idle" }
                );
                ctx.stack.tcp_abort(flow);
                return;
            }
        }
    }
}

fn kind(target: &RelayTarget) -> &'static str {
    match target {
        RelayTarget::Direct => "direct",
        RelayTarget::Vless(_) => "vless",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackCommand;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Stack stub: every tcp_write accepts up to the shared capacity
    fn stub_stack(capacity: Arc<Mutex<usize>>) -> StackHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    StackCommand::TcpWrite { data, reply, .. } => {
                        let mut cap = capacity.lock();
                        let accepted = data.len().min(*cap);
                        *cap -= accepted;
                        let _ = reply.send(Ok(accepted));
                    }
                    StackCommand::TcpOutput { .. } => {}
                    _ => {}
                }
            }
        });
        StackHandle { tx }
    }

    #[tokio::test]
    async fn test_backpressure_overflow_and_drain() {
        let capacity = Arc::new(Mutex::new(10usize));
        let stack = stub_stack(Arc::clone(&capacity));
        let mut bp = Backpressure::new();

        // 30 bytes against 10 of headroom: 20 overflow, loop paused
        bp.push(&stack, 1, &[0xAA; 30]).await.unwrap();
        assert_eq!(bp.overflow.len(), 20);
        assert!(bp.paused);

        // Nothing fits: pushes go straight to overflow
        bp.push(&stack, 1, &[0xBB; 5]).await.unwrap();
        assert_eq!(bp.overflow.len(), 25);

        // ACKs freed plenty; drain empties and resumes
        *capacity.lock() = 1000;
        bp.drain(&stack, 1).await.unwrap();
        assert!(bp.overflow.is_empty());
        assert!(!bp.paused);
    }

    #[tokio::test]
    async fn test_backpressure_cap_aborts() {
        let capacity = Arc::new(Mutex::new(0usize));
        let stack = stub_stack(Arc::clone(&capacity));
        let mut bp = Backpressure::new();

        // Just under the cap is fine
        bp.push(&stack, 1, &vec![0u8; MAX_OVERFLOW]).await.unwrap();
        assert_eq!(bp.overflow.len(), MAX_OVERFLOW);

        // One more byte blows the cap
        assert!(bp.push(&stack, 1, &[0u8]).await.is_err());
    }

    #[tokio::test]
    async fn test_backpressure_partial_drain_stays_paused() {
        let capacity = Arc::new(Mutex::new(0usize));
        let stack = stub_stack(Arc::clone(&capacity));
        let mut bp = Backpressure::new();

        bp.push(&stack, 1, &[1, 2, 3, 4]).await.unwrap();
        assert!(bp.paused);

        *capacity.lock() = 2;
        bp.drain(&stack, 1).await.unwrap();
        assert_eq!(bp.overflow.len(), 2);
        assert!(bp.paused);
    }

    #[test]
    fn test_activity_timeout_regimes() {
        assert_eq!(activity_timeout(false, false), IDLE_TIMEOUT);
        assert_eq!(activity_timeout(true, false), HALF_CLOSE_TIMEOUT);
        assert_eq!(activity_timeout(false, true), HALF_CLOSE_TIMEOUT);
        assert_eq!(activity_timeout(true, true), HALF_CLOSE_TIMEOUT);
    }
}
