//! smoltcp device over in-memory frame queues
//!
//! The virtual interface exchanges raw IP frames with the host packet
//! tunnel through two queues: RX holds frames the host delivered (for
//! the stack to consume), TX holds frames the stack produced (for the
//! writer task to hand to the host).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use tracing::trace;

/// Queue depth bound; beyond it frames are dropped like a full NIC ring
const MAX_QUEUE_DEPTH: usize = 512;

/// Frame queues shared between the device and the stack runtime
#[derive(Debug, Default)]
pub struct PacketQueue {
    rx: Mutex<VecDeque<Vec<u8>>>,
    tx: Mutex<VecDeque<Vec<u8>>>,
}

impl PacketQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an inbound frame; false when the ring is full
    pub fn push_rx(&self, frame: Vec<u8>) -> bool {
        let mut q = self.rx.lock();
        if q.len() >= MAX_QUEUE_DEPTH {
            trace!("RX ring full, dropping {} byte frame", frame.len());
            return false;
        }
        q.push_back(frame);
        true
    }

    pub fn pop_rx(&self) -> Option<Vec<u8>> {
        self.rx.lock().pop_front()
    }

    /// Queue an outbound frame produced by the stack
    pub fn push_tx(&self, frame: Vec<u8>) -> bool {
        let mut q = self.tx.lock();
        if q.len() >= MAX_QUEUE_DEPTH {
            trace!("TX ring full, dropping {} byte frame", frame.len());
            return false;
        }
        q.push_back(frame);
        true
    }

    pub fn pop_tx(&self) -> Option<Vec<u8>> {
        self.tx.lock().pop_front()
    }

    #[must_use]
    pub fn has_rx(&self) -> bool {
        !self.rx.lock().is_empty()
    }

    pub fn clear(&self) {
        self.rx.lock().clear();
        self.tx.lock().clear();
    }
}

/// The device smoltcp polls; IP medium, no link headers
pub struct VirtualDevice {
    queue: Arc<PacketQueue>,
    mtu: usize,
}

impl VirtualDevice {
    #[must_use]
    pub fn new(queue: Arc<PacketQueue>, mtu: usize) -> Self {
        Self { queue, mtu }
    }
}

pub struct VirtualRxToken {
    frame: Vec<u8>,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

pub struct VirtualTxToken {
    queue: Arc<PacketQueue>,
}

impl TxToken for VirtualTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.queue.push_tx(frame);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken;

    fn receive(
        &mut self,
        _timestamp: SmoltcpInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.queue.pop_rx()?;
        Some((
            VirtualRxToken { frame },
            VirtualTxToken {
                queue: Arc::clone(&self.queue),
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken {
            queue: Arc::clone(&self.queue),
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Both;
        caps.checksum.tcp = Checksum::Both;
        caps.checksum.udp = Checksum::Both;
        caps
    }
}
