//! Userspace network stack binding
//!
//! Wraps the single-threaded TCP/IP implementation (smoltcp) behind a
//! command channel: every stack call and every callback it produces is
//! serviced on one task, the **stack context**. Flow handlers and
//! transports run as their own tasks and funnel all stack access through
//! a [`StackHandle`]; flows are tracked in an integer-keyed map, so no
//! raw pointers cross any boundary.
//!
//! The virtual interface owns `10.8.0.2/24` (plus `fd00::2/64` when IPv6
//! is on) at MTU 1400 and accepts TCP to *any* destination: inbound
//! frames are peeked for SYNs and a listening socket is provisioned per
//! new destination before the frame enters the state machine. UDP never
//! enters it at all; datagrams are lifted off the frames at wire level
//! (see [`wire`]), offered to the DNS interceptor, and dispatched to
//! per-5-tuple flow tasks.
//!
//! Frames the stack produces are handed to the writer task through the
//! output channel; `bytes_in`/`bytes_out` accumulate here and nowhere
//! else.

pub mod device;
mod tcp;
mod udp;
pub mod wire;

pub use tcp::{
    HALF_CLOSE_TIMEOUT, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, MAX_OVERFLOW, MAX_WRITE_CHUNK,
};
pub use udp::{CONNECT_QUEUE_LIMIT, IDLE_TIMEOUT as UDP_IDLE_TIMEOUT, MAX_FLOWS};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::{Settings, VlessConfig};
use crate::engine::stats::TunnelStats;
use crate::error::StackError;
use crate::fakedns::{intercept, FakeIpPool, InterceptOutcome};
use crate::mux::MuxManager;
use crate::rules::{DomainRouter, GeoIpDatabase};
use crate::vless::Destination;
use device::{PacketQueue, VirtualDevice};
use tcp::{RelayTarget, TcpFlowContext};
use udp::{UdpFlowContext, UdpFlowKey, UdpFlowTable, UdpTarget};
use wire::{frame_is_ipv6, UdpDatagram};

/// Virtual interface IPv4 address
pub const TUNNEL_IPV4: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
/// Virtual interface IPv6 address
pub const TUNNEL_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
/// Interface MTU
pub const TUNNEL_MTU: usize = 1400;
/// Timer-driven poll cadence
pub const STACK_TICK: Duration = Duration::from_millis(250);
/// UDP idle sweep cadence
pub const UDP_SWEEP: Duration = Duration::from_secs(1);

/// Per-socket buffer sizes
const TCP_BUFFER_SIZE: usize = 65_536;
/// Bytes delivered to a handler but not yet acknowledged via `tcp_recved`
const INFLIGHT_LIMIT: usize = 65_536;
/// Sockets in the set (listeners + flows)
const MAX_TCP_SOCKETS: usize = 1024;

/// Integer flow identity; the only thing handlers and the stack share
pub type FlowId = u32;

/// Events delivered to a TCP flow handler
#[derive(Debug)]
pub enum TcpFlowEvent {
    /// Data from the local side; empty means local half-close
    Recv(Bytes),
    /// Bytes the local side acknowledged (send-buffer headroom freed)
    Sent(u32),
    /// The control block is gone; the handler must release and stop
    Error(i32),
}

/// One frame for the host, with its address family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub data: Vec<u8>,
    pub is_ipv6: bool,
}

pub(crate) enum StackCommand {
    Input(Vec<u8>),
    TcpWrite {
        flow: FlowId,
        data: Bytes,
        reply: oneshot::Sender<Result<usize, StackError>>,
    },
    TcpSndbuf {
        flow: FlowId,
        reply: oneshot::Sender<u32>,
    },
    TcpOutput {
        flow: FlowId,
    },
    TcpRecved {
        flow: FlowId,
        len: usize,
    },
    TcpClose {
        flow: FlowId,
    },
    TcpAbort {
        flow: FlowId,
    },
    UdpSendTo {
        src: SocketAddr,
        dst: SocketAddr,
        payload: Vec<u8>,
    },
    Reload {
        settings: Settings,
        router: Arc<DomainRouter>,
        config: Box<VlessConfig>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle onto the stack context
#[derive(Clone)]
pub struct StackHandle {
    tx: mpsc::UnboundedSender<StackCommand>,
}

impl StackHandle {
    /// Submit one inbound IP frame
    pub fn input(&self, frame: Vec<u8>) {
        let _ = self.tx.send(StackCommand::Input(frame));
    }

    /// Enqueue bytes toward the local side; returns how many the send
    /// buffer accepted right now.
    ///
    /// # Errors
    ///
    /// Returns `StackError` when the stack or the flow is gone.
    pub async fn tcp_write(&self, flow: FlowId, data: Bytes) -> Result<usize, StackError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StackCommand::TcpWrite { flow, data, reply })
            .map_err(|_| StackError::NotRunning)?;
        rx.await.map_err(|_| StackError::NotRunning)?
    }

    /// Current send-buffer headroom
    pub async fn tcp_sndbuf(&self, flow: FlowId) -> u32 {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(StackCommand::TcpSndbuf { flow, reply })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Push queued segments onto the wire
    pub fn tcp_output(&self, flow: FlowId) {
        let _ = self.tx.send(StackCommand::TcpOutput { flow });
    }

    /// Advance the local receive window after a completed relay send
    pub fn tcp_recved(&self, flow: FlowId, len: usize) {
        let _ = self.tx.send(StackCommand::TcpRecved { flow, len });
    }

    /// Orderly close of the local side
    pub fn tcp_close(&self, flow: FlowId) {
        let _ = self.tx.send(StackCommand::TcpClose { flow });
    }

    /// Reset the flow
    pub fn tcp_abort(&self, flow: FlowId) {
        let _ = self.tx.send(StackCommand::TcpAbort { flow });
    }

    /// Synthesize an inbound UDP datagram to the local side
    pub fn udp_sendto(&self, src: SocketAddr, dst: SocketAddr, payload: Vec<u8>) {
        let _ = self.tx.send(StackCommand::UdpSendTo { src, dst, payload });
    }

    /// Tear down and restart with new settings, router and default
    /// config. The fake-IP pool is rebuilt, not reset.
    pub async fn reload(
        &self,
        settings: Settings,
        router: Arc<DomainRouter>,
        config: VlessConfig,
    ) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(StackCommand::Reload {
                settings,
                router,
                config: Box::new(config),
                reply,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Stop the stack task entirely
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StackCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Everything the runtime starts from
pub(crate) struct StackParams {
    pub settings: Settings,
    pub router: Arc<DomainRouter>,
    pub geoip: Arc<GeoIpDatabase>,
    pub default_config: VlessConfig,
    pub stats: Arc<TunnelStats>,
    pub output_tx: mpsc::UnboundedSender<OutputFrame>,
}

/// Spawn the stack context task
pub(crate) fn spawn(params: StackParams) -> StackHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let runtime = StackRuntime::new(params, tx.clone());
    tokio::spawn(runtime.run(rx));
    StackHandle { tx }
}

struct TcpFlowRecord {
    handle: SocketHandle,
    event_tx: mpsc::UnboundedSender<TcpFlowEvent>,
    inflight: usize,
    half_close_sent: bool,
    last_send_queue: usize,
    closing: bool,
}

struct StackRuntime {
    iface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
    queue: Arc<PacketQueue>,

    flows: HashMap<FlowId, TcpFlowRecord>,
    by_handle: HashMap<SocketHandle, FlowId>,
    listeners: Vec<((IpAddress, u16), SocketHandle)>,
    doomed: Vec<SocketHandle>,
    next_flow_id: FlowId,

    udp_flows: UdpFlowTable,
    pool: FakeIpPool,

    settings: Settings,
    router: Arc<DomainRouter>,
    geoip: Arc<GeoIpDatabase>,
    default_config: VlessConfig,
    mux: Option<Arc<tokio::sync::Mutex<MuxManager>>>,

    stats: Arc<TunnelStats>,
    output_tx: mpsc::UnboundedSender<OutputFrame>,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
}

fn to_ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

fn from_ip_address(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(a) => IpAddr::V4(a),
        IpAddress::Ipv6(a) => IpAddr::V6(a),
    }
}

fn build_interface(device: &mut VirtualDevice, ipv6: bool) -> Interface {
    let config = IfaceConfig::new(HardwareAddress::Ip);
    let mut iface = Interface::new(config, device, SmoltcpInstant::now());
    iface.update_ip_addrs(|addrs| {
        let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(TUNNEL_IPV4), 24));
        if ipv6 {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(TUNNEL_IPV6), 64));
        }
    });
    // Accept frames for any destination; flows bind to specific endpoints
    iface.set_any_ip(true);
    iface
}

impl StackRuntime {
    fn new(params: StackParams, cmd_tx: mpsc::UnboundedSender<StackCommand>) -> Self {
        let queue = PacketQueue::new();
        let mut device = VirtualDevice::new(Arc::clone(&queue), TUNNEL_MTU);
        let iface = build_interface(&mut device, params.settings.ipv6_enabled);
        let mux = params.default_config.uses_mux_udp().then(|| {
            Arc::new(tokio::sync::Mutex::new(MuxManager::new(
                params.default_config.clone(),
            )))
        });

        debug!(
            "Stack up: {TUNNEL_IPV4}/24 mtu {TUNNEL_MTU}, ipv6 {}",
            params.settings.ipv6_enabled
        );

        Self {
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            queue,
            flows: HashMap::new(),
            by_handle: HashMap::new(),
            listeners: Vec::new(),
            doomed: Vec::new(),
            next_flow_id: 1,
            udp_flows: UdpFlowTable::new(),
            pool: FakeIpPool::new(),
            settings: params.settings,
            router: params.router,
            geoip: params.geoip,
            default_config: params.default_config,
            mux,
            stats: params.stats,
            output_tx: params.output_tx,
            cmd_tx,
        }
    }

    fn handle(&self) -> StackHandle {
        StackHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<StackCommand>) {
        let mut tick = tokio::time::interval(STACK_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(UDP_SWEEP);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(StackCommand::Shutdown { reply }) => {
                        self.teardown();
                        self.stats.reset();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = tick.tick() => {
                    // check_timeouts: retransmissions, delayed ACKs
                    self.poll();
                }
                _ = sweep.tick() => {
                    self.udp_flows.sweep();
                }
            }
        }
        debug!("Stack task finished");
    }

    fn handle_command(&mut self, cmd: StackCommand) {
        match cmd {
            StackCommand::Input(frame) => self.input(frame),
            StackCommand::TcpWrite { flow, data, reply } => {
                let result = self.tcp_write(flow, &data);
                let _ = reply.send(result);
                self.poll();
            }
            StackCommand::TcpSndbuf { flow, reply } => {
                let _ = reply.send(self.tcp_sndbuf(flow));
            }
            StackCommand::TcpOutput { .. } => self.poll(),
            StackCommand::TcpRecved { flow, len } => {
                if let Some(record) = self.flows.get_mut(&flow) {
                    record.inflight = record.inflight.saturating_sub(len);
                }
                // Window reopened; deliver what was held back
                self.process_flow(flow);
                self.poll();
            }
            StackCommand::TcpClose { flow } => {
                if let Some(record) = self.flows.get_mut(&flow) {
                    record.closing = true;
                    let socket = self.sockets.get_mut::<TcpSocket>(record.handle);
                    socket.close();
                }
                self.poll();
            }
            StackCommand::TcpAbort { flow } => {
                if let Some(record) = self.flows.remove(&flow) {
                    self.by_handle.remove(&record.handle);
                    let socket = self.sockets.get_mut::<TcpSocket>(record.handle);
                    socket.abort();
                    self.doomed.push(record.handle);
                }
                self.poll();
            }
            StackCommand::UdpSendTo { src, dst, payload } => {
                self.udp_sendto(src, dst, &payload);
            }
            StackCommand::Reload {
                settings,
                router,
                config,
                reply,
            } => {
                self.reload(settings, router, *config);
                let _ = reply.send(());
            }
            StackCommand::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    // ------------------------------------------------------------------
    // Frame input and poll cycle
    // ------------------------------------------------------------------

    fn input(&mut self, frame: Vec<u8>) {
        self.stats.add_out(frame.len() as u64);

        // UDP stays at wire level
        if let Some(dgram) = wire::parse_udp_frame(&frame) {
            self.handle_udp(dgram);
            return;
        }

        // Provision a listener before the SYN reaches the state machine
        if let Some(dst) = wire::parse_tcp_syn(&frame) {
            self.ensure_listener(dst);
        }

        self.queue.push_rx(frame);
        self.poll();
    }

    fn poll(&mut self) {
        let timestamp = SmoltcpInstant::now();
        let _ = self
            .iface
            .poll(timestamp, &mut self.device, &mut self.sockets);

        for handle in self.doomed.drain(..) {
            self.sockets.remove(handle);
        }

        self.promote_listeners();

        let ids: Vec<FlowId> = self.flows.keys().copied().collect();
        for id in ids {
            self.process_flow(id);
        }

        self.drain_output();
    }

    fn drain_output(&mut self) {
        while let Some(frame) = self.queue.pop_tx() {
            self.stats.add_in(frame.len() as u64);
            let is_ipv6 = frame_is_ipv6(&frame);
            let _ = self.output_tx.send(OutputFrame {
                data: frame,
                is_ipv6,
            });
        }
    }

    // ------------------------------------------------------------------
    // TCP accept path
    // ------------------------------------------------------------------

    fn ensure_listener(&mut self, dst: SocketAddr) {
        let key = (to_ip_address(dst.ip()), dst.port());
        for (endpoint, handle) in &self.listeners {
            if *endpoint == key
                && self.sockets.get::<TcpSocket>(*handle).state() == TcpState::Listen
            {
                return;
            }
        }
        if self.flows.len() + self.listeners.len() >= MAX_TCP_SOCKETS {
            warn!("Socket set full, dropping SYN to {dst}");
            return;
        }

        let rx = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let mut socket = TcpSocket::new(rx, tx);
        socket.set_nagle_enabled(false);
        let endpoint = IpListenEndpoint {
            addr: Some(key.0),
            port: key.1,
        };
        match socket.listen(endpoint) {
            Ok(()) => {
                let handle = self.sockets.add(socket);
                self.listeners.push((key, handle));
                trace!("Listener provisioned for {dst}");
            }
            Err(e) => warn!("Listen on {dst} failed: {e}"),
        }
    }

    fn promote_listeners(&mut self) {
        let mut promoted = Vec::new();
        let mut i = 0;
        while i < self.listeners.len() {
            let (_, handle) = self.listeners[i];
            match self.sockets.get::<TcpSocket>(handle).state() {
                TcpState::Listen | TcpState::SynReceived => i += 1,
                TcpState::Closed => {
                    self.sockets.remove(handle);
                    self.listeners.swap_remove(i);
                }
                _ => {
                    self.listeners.swap_remove(i);
                    promoted.push(handle);
                }
            }
        }
        for handle in promoted {
            self.accept(handle);
        }
    }

    /// A listener reached Established: decide, then hand it to a handler
    fn accept(&mut self, handle: SocketHandle) {
        let socket = self.sockets.get::<TcpSocket>(handle);
        let (Some(local), Some(remote)) = (socket.local_endpoint(), socket.remote_endpoint())
        else {
            self.reject(handle);
            return;
        };
        let dst_ip = from_ip_address(local.addr);
        let dst_port = local.port;

        let (dest, config, force_bypass) = if self.pool.is_fake_ip(dst_ip) {
            match self.pool.resolve_ip(dst_ip) {
                Some(entry) => (
                    Destination::domain(entry.domain.clone(), dst_port),
                    entry.config.clone(),
                    entry.is_direct,
                ),
                None => {
                    // Pool eviction raced a stale app socket
                    debug!("Rejecting accept to unmapped fake IP {dst_ip}");
                    self.reject(handle);
                    return;
                }
            }
        } else {
            (
                Destination::ip(dst_ip, dst_port),
                Some(self.default_config.clone()),
                false,
            )
        };

        let geo_bypass = !self.pool.is_fake_ip(dst_ip)
            && self.settings.bypass_country != 0
            && self.geoip.lookup(dst_ip) == self.settings.bypass_country;

        let target = match (force_bypass || geo_bypass, config) {
            (false, Some(config)) => RelayTarget::Vless(Box::new(config)),
            _ => RelayTarget::Direct,
        };

        let flow_id = self.next_flow_id;
        self.next_flow_id += 1;
        let (event_tx, events) = mpsc::unbounded_channel();
        self.flows.insert(
            flow_id,
            TcpFlowRecord {
                handle,
                event_tx,
                inflight: 0,
                half_close_sent: false,
                last_send_queue: 0,
                closing: false,
            },
        );
        self.by_handle.insert(handle, flow_id);

        debug!(
            "Flow {flow_id}: accepted {}:{} -> {dest}",
            from_ip_address(remote.addr),
            remote.port
        );
        tokio::spawn(tcp::run(TcpFlowContext {
            flow_id,
            dest,
            target,
            stack: self.handle(),
            events,
        }));
    }

    fn reject(&mut self, handle: SocketHandle) {
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        socket.abort();
        self.doomed.push(handle);
    }

    // ------------------------------------------------------------------
    // Per-flow servicing
    // ------------------------------------------------------------------

    fn process_flow(&mut self, id: FlowId) {
        let Some(record) = self.flows.get_mut(&id) else {
            return;
        };
        let socket = self.sockets.get_mut::<TcpSocket>(record.handle);

        // Deliver local data, bounded by the un-acked window
        while socket.can_recv() && record.inflight < INFLIGHT_LIMIT {
            let mut buf = [0u8; 8192];
            let want = buf.len().min(INFLIGHT_LIMIT - record.inflight);
            match socket.recv_slice(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    record.inflight += n;
                    let _ = record
                        .event_tx
                        .send(TcpFlowEvent::Recv(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(_) => break,
            }
        }

        // Local half-close: FIN received and buffer drained
        if !record.half_close_sent
            && socket.state() == TcpState::CloseWait
            && !socket.can_recv()
        {
            record.half_close_sent = true;
            let _ = record.event_tx.send(TcpFlowEvent::Recv(Bytes::new()));
        }

        // Headroom freed since last look
        let queued = socket.send_queue();
        if queued < record.last_send_queue {
            let freed = (record.last_send_queue - queued) as u32;
            let _ = record.event_tx.send(TcpFlowEvent::Sent(freed));
        }
        record.last_send_queue = queued;

        // Fully closed or reset
        if socket.state() == TcpState::Closed {
            let closing = record.closing;
            let handle = record.handle;
            if !closing {
                let _ = record.event_tx.send(TcpFlowEvent::Error(-1));
            }
            self.flows.remove(&id);
            self.by_handle.remove(&handle);
            self.sockets.remove(handle);
            trace!("Flow {id}: control block released");
        }
    }

    fn tcp_write(&mut self, flow: FlowId, data: &[u8]) -> Result<usize, StackError> {
        let record = self
            .flows
            .get(&flow)
            .ok_or(StackError::UnknownFlow(flow))?;
        let socket = self.sockets.get_mut::<TcpSocket>(record.handle);
        if !socket.may_send() {
            return Err(StackError::UnknownFlow(flow));
        }
        Ok(socket.send_slice(data).unwrap_or(0))
    }

    fn tcp_sndbuf(&mut self, flow: FlowId) -> u32 {
        let Some(record) = self.flows.get(&flow) else {
            return 0;
        };
        let socket = self.sockets.get::<TcpSocket>(record.handle);
        (socket.send_capacity() - socket.send_queue()) as u32
    }

    // ------------------------------------------------------------------
    // UDP path
    // ------------------------------------------------------------------

    fn handle_udp(&mut self, dgram: UdpDatagram) {
        // DNS interception comes before any flow
        if dgram.dst.port() == 53 {
            match intercept(
                &dgram.payload,
                &self.router,
                &mut self.pool,
                self.settings.doh_enabled,
                self.settings.ipv6_enabled,
            ) {
                InterceptOutcome::Respond(response) => {
                    // Reply with source and destination swapped; no flow
                    self.udp_sendto(dgram.dst, dgram.src, &response);
                    return;
                }
                InterceptOutcome::Passthrough => {}
            }
        }

        let key = UdpFlowKey {
            src: dgram.src,
            dst: dgram.dst,
        };
        let Some(payload) = self.udp_flows.forward(&key, dgram.payload) else {
            return;
        };

        if !self.udp_flows.has_capacity() {
            trace!("UDP flow cap reached, dropping datagram to {}", dgram.dst);
            return;
        }

        let dst_ip = dgram.dst.ip();
        let dst_port = dgram.dst.port();
        let (dest, config, force_bypass) = if self.pool.is_fake_ip(dst_ip) {
            match self.pool.resolve_ip(dst_ip) {
                Some(entry) => (
                    Destination::domain(entry.domain.clone(), dst_port),
                    entry.config.clone(),
                    entry.is_direct,
                ),
                None => {
                    trace!("Dropping datagram to unmapped fake IP {dst_ip}");
                    return;
                }
            }
        } else {
            (
                Destination::ip(dst_ip, dst_port),
                Some(self.default_config.clone()),
                false,
            )
        };

        let geo_bypass = !self.pool.is_fake_ip(dst_ip)
            && self.settings.bypass_country != 0
            && self.geoip.lookup(dst_ip) == self.settings.bypass_country;

        let target = match (force_bypass || geo_bypass, config) {
            (true, _) | (false, None) => UdpTarget::Direct,
            (false, Some(config)) => match (&self.mux, config.uses_mux_udp()) {
                (Some(manager), true) => UdpTarget::Mux {
                    manager: Arc::clone(manager),
                    global_id: config.xudp_enabled.then(|| {
                        crate::mux::global_id(&dgram.src.ip().to_string(), dgram.src.port())
                    }),
                },
                _ => UdpTarget::Vless(Box::new(config)),
            },
        };

        self.udp_flows.spawn(
            key,
            UdpFlowContext {
                src: dgram.src,
                dst: dgram.dst,
                dest,
                target,
                stack: self.handle(),
            },
        );
        // First datagram enters the fresh queue
        let _ = self.udp_flows.forward(&key, payload);
    }

    fn udp_sendto(&mut self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        match wire::build_udp_frame(src, dst, payload) {
            Some(frame) => {
                self.stats.add_in(frame.len() as u64);
                let is_ipv6 = frame_is_ipv6(&frame);
                let _ = self.output_tx.send(OutputFrame {
                    data: frame,
                    is_ipv6,
                });
            }
            None => warn!("udp_sendto dropped mixed-family datagram {src} -> {dst}"),
        }
    }

    // ------------------------------------------------------------------
    // Reload
    // ------------------------------------------------------------------

    fn teardown(&mut self) {
        debug!(
            "Stack teardown: {} tcp flows, {} udp flows",
            self.flows.len(),
            self.udp_flows.len()
        );
        // Dropping the event senders cancels every handler; late
        // completions see closed channels and release quietly.
        self.flows.clear();
        self.by_handle.clear();
        self.listeners.clear();
        self.doomed.clear();
        self.sockets = SocketSet::new(Vec::new());
        self.udp_flows.clear();
        if let Some(mux) = self.mux.take() {
            if let Ok(mut manager) = mux.try_lock() {
                manager.close_all();
            }
        }
        self.queue.clear();
    }

    fn reload(&mut self, settings: Settings, router: Arc<DomainRouter>, config: VlessConfig) {
        self.teardown();

        self.settings = settings;
        self.router = router;
        self.default_config = config;
        self.pool.rebuild(&self.router);
        self.mux = self.default_config.uses_mux_udp().then(|| {
            Arc::new(tokio::sync::Mutex::new(MuxManager::new(
                self.default_config.clone(),
            )))
        });

        self.iface = build_interface(&mut self.device, self.settings.ipv6_enabled);
        debug!(
            "Stack reloaded: ipv6 {}, {} pool entries, config {}",
            self.settings.ipv6_enabled,
            self.pool.len(),
            self.default_config.name
        );
    }
}
