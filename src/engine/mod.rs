//! Tunnel engine: lifecycle, reload controller and stats
//!
//! The engine is what the host packet-tunnel façade talks to. It owns
//! the stack task and the writer task:
//!
//! ```text
//! host frames -> submit_frames() -> stack context -> flow handlers
//! host sink   <- writer context  <- output channel <- stack context
//! ```
//!
//! Reload handling follows one procedure for settings changes, routing
//! changes and config switches: diff, ask the host to reapply network
//! settings when IPv6 flipped, tear down every flow, reload the router
//! from the shared document, **rebuild** (not reset) the fake-IP pool,
//! recreate the mux manager iff Vision+mux is active on the new default
//! config, and resume. Errors during teardown are logged and the new
//! stack starts regardless.

pub mod stats;

pub use stats::TunnelStats;

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{RoutingDocument, Settings, SettingsSource, VlessConfig};
use crate::error::TunnelError;
use crate::rules::{DomainRouter, GeoIpDatabase};
use crate::stack::{self, OutputFrame, StackHandle, StackParams};

/// Host packet-tunnel façade, injected at start
///
/// `send_frames` must not block the caller for long; it runs on the
/// writer context, never on the stack context.
pub trait HostTunnel: Send + Sync {
    /// Hand a batch of IP frames to the host, with address families
    fn send_frames(&self, frames: Vec<OutputFrame>);

    /// Ask the host to reapply network settings (IPv6 toggled)
    fn request_reapply(&self);
}

struct Running {
    stack: StackHandle,
    host: Arc<dyn HostTunnel>,
    settings: Settings,
    routing: RoutingDocument,
    config: VlessConfig,
}

/// The data-plane engine
pub struct TunnelEngine {
    source: Arc<dyn SettingsSource>,
    geoip: Arc<GeoIpDatabase>,
    stats: Arc<TunnelStats>,
    /// Current compiled router; readable without touching the stack task
    router: ArcSwap<DomainRouter>,
    running: Mutex<Option<Running>>,
}

impl TunnelEngine {
    #[must_use]
    pub fn new(source: Arc<dyn SettingsSource>, geoip: Arc<GeoIpDatabase>) -> Self {
        Self {
            source,
            geoip,
            stats: Arc::new(TunnelStats::new()),
            router: ArcSwap::from_pointee(DomainRouter::empty()),
            running: Mutex::new(None),
        }
    }

    /// Snapshot of the live router (for UI-side "which route would this
    /// domain take" queries); lags a reload by at most one swap.
    #[must_use]
    pub fn router_snapshot(&self) -> Arc<DomainRouter> {
        self.router.load_full()
    }

    /// Start the data plane with the selected config.
    ///
    /// `ipv6_enabled` is what the host actually applied to the tunnel
    /// interface; it overrides the stored setting for this run.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` when the routing document cannot be loaded
    /// or compiled; this is the unrecoverable start failure surfaced to
    /// the host.
    pub async fn start(
        &self,
        host: Arc<dyn HostTunnel>,
        config: VlessConfig,
        ipv6_enabled: bool,
    ) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;
        if let Some(old) = running.take() {
            warn!("Engine start while running; shutting the old stack down");
            old.stack.shutdown().await;
        }

        let mut settings = self.source.load_settings();
        settings.ipv6_enabled = ipv6_enabled;
        let routing = self.source.load_routing()?;
        let router = Arc::new(DomainRouter::from_document(&routing)?);
        self.router.store(Arc::clone(&router));

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        spawn_writer(output_rx, Arc::clone(&host));

        let stack = stack::spawn(StackParams {
            settings,
            router,
            geoip: Arc::clone(&self.geoip),
            default_config: config.clone(),
            stats: Arc::clone(&self.stats),
            output_tx,
        });

        info!(
            "Tunnel started: config {}, {} rules, ipv6 {}",
            config.name,
            routing.rules.len(),
            ipv6_enabled
        );
        *running = Some(Running {
            stack,
            host,
            settings,
            routing,
            config,
        });
        Ok(())
    }

    /// Stop the data plane; counters reset to zero.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(run) = running.take() {
            run.stack.shutdown().await;
            info!("Tunnel stopped");
        }
    }

    /// Feed a batch of raw IP frames from the host
    pub async fn submit_frames(&self, frames: Vec<Vec<u8>>) {
        let running = self.running.lock().await;
        if let Some(run) = running.as_ref() {
            for frame in frames {
                run.stack.input(frame);
            }
        }
    }

    /// `(bytes_in, bytes_out)`; monotonic between teardowns
    #[must_use]
    pub fn read_stats(&self) -> (u64, u64) {
        self.stats.snapshot()
    }

    /// Switch to a new default config, optionally with a new IPv6 state.
    pub async fn switch_config(&self, config: VlessConfig, ipv6_enabled: Option<bool>) {
        let mut running = self.running.lock().await;
        let Some(run) = running.as_mut() else {
            warn!("switch_config with no running tunnel");
            return;
        };

        let mut settings = self.source.load_settings();
        settings.ipv6_enabled = ipv6_enabled.unwrap_or(run.settings.ipv6_enabled);
        if settings.ipv6_enabled != run.settings.ipv6_enabled {
            run.host.request_reapply();
        }

        let (routing, router) = self.reload_router(&run.routing);
        self.router.store(Arc::clone(&router));
        info!("Switching config to {}", config.name);
        run.stack
            .reload(settings, router, config.clone())
            .await;
        run.settings = settings;
        run.routing = routing;
        run.config = config;
    }

    /// Settings store changed (IPv6, DoH, bypass country)
    pub async fn notify_settings_changed(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.as_mut() else { return };

        let settings = self.source.load_settings();
        if settings == run.settings {
            debug!("Settings notification with no change");
            return;
        }
        if settings.ipv6_enabled != run.settings.ipv6_enabled {
            run.host.request_reapply();
        }

        let (routing, router) = self.reload_router(&run.routing);
        self.router.store(Arc::clone(&router));
        info!("Settings changed, reloading stack");
        run.stack
            .reload(settings, router, run.config.clone())
            .await;
        run.settings = settings;
        run.routing = routing;
    }

    /// The routing document changed
    pub async fn notify_routing_changed(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.as_mut() else { return };

        let routing = match self.source.load_routing() {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Routing reload failed, keeping previous rules: {e}");
                return;
            }
        };
        if routing == run.routing {
            debug!("Routing notification with no change");
            return;
        }
        let router = match DomainRouter::from_document(&routing) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!("Router compile failed, keeping previous rules: {e}");
                return;
            }
        };

        self.router.store(Arc::clone(&router));
        info!("Routing changed ({} rules), reloading stack", routing.rules.len());
        run.stack
            .reload(run.settings, router, run.config.clone())
            .await;
        run.routing = routing;
    }

    /// Load the routing document, falling back to the previous one on
    /// any error (teardown proceeds regardless).
    fn reload_router(&self, previous: &RoutingDocument) -> (RoutingDocument, Arc<DomainRouter>) {
        let routing = match self.source.load_routing() {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Routing reload failed, keeping previous rules: {e}");
                previous.clone()
            }
        };
        let router = match DomainRouter::from_document(&routing) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!("Router compile failed, using empty rules: {e}");
                Arc::new(DomainRouter::empty())
            }
        };
        (routing, router)
    }
}

/// The writer context: forwards stack output to the host without ever
/// re-entering the stack.
fn spawn_writer(mut rx: mpsc::UnboundedReceiver<OutputFrame>, host: Arc<dyn HostTunnel>) {
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(64);
        loop {
            let n = rx.recv_many(&mut batch, 64).await;
            if n == 0 {
                break;
            }
            host.send_frames(std::mem::take(&mut batch));
        }
        debug!("Writer task finished");
    });
}
