//! Tunnel byte counters
//!
//! `bytes_in` counts frames handed toward the host (traffic arriving
//! from the network), `bytes_out` counts frames the host delivered into
//! the stack. Both accumulate on the stack task; readers may lag by up
//! to one tick but always observe monotonic values between teardowns.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters
#[derive(Debug, Default)]
pub struct TunnelStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// `(bytes_in, bytes_out)`
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    /// Zero both counters; only the full teardown calls this.
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }
}
