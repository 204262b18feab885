//! rust-tunnel: client-side VLESS tunnel data plane
//!
//! This crate terminates all IP traffic of a host device in userspace and
//! relays every accepted flow through a VLESS proxy. It owns a virtual
//! network interface, performs DNS interception with synthetic (fake)
//! addresses for domain-based policy routing, and speaks VLESS with the
//! Vision flow, Reality TLS 1.3 emulation, and WebSocket / HTTP-Upgrade /
//! XHTTP carriers, with optional stream multiplexing.
//!
//! # Architecture
//!
//! ```text
//! host tunnel ──frames──> stack context ──accept──> TCP flow handlers
//!      ^                     │    │                      │
//!      │                     │    └──datagrams──> UDP flow tasks
//!   writer context <──output─┘                           │
//!                                                        v
//!                                   transports (TCP/TLS/Reality/WS/XHTTP)
//!                                                        │
//!                                                        v
//!                                              VLESS proxy server
//! ```
//!
//! Two serial execution contexts carry all shared state: the **stack
//! context** (every stack call, timer, router/pool mutation and stats
//! update) and the **writer context** (frames toward the host). Flow
//! handlers and transport I/O run as ordinary tasks and reach the stack
//! only through its command handle.
//!
//! # Modules
//!
//! - [`config`]: endpoint configs, share URLs, shared settings state
//! - [`rules`]: domain router and GeoIP bypass lookup
//! - [`fakedns`]: fake-IP pool and DNS interceptor
//! - [`vless`]: protocol codec and outbound connections
//! - [`vision`]: adaptive padding flow
//! - [`reality`]: TLS 1.3 emulation with embedded authenticator
//! - [`transport`]: TCP / TLS / WebSocket / HTTP-Upgrade / XHTTP dial
//! - [`mux`]: stream multiplexing and XUDP
//! - [`stack`]: userspace TCP/IP binding and flow handlers
//! - [`engine`]: lifecycle, reload controller, stats

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod engine;
pub mod error;
pub mod fakedns;
pub mod mux;
pub mod reality;
pub mod rules;
pub mod stack;
pub mod transport;
pub mod vision;
pub mod vless;

// Re-export the surface the host façade uses
pub use config::{RoutingDocument, Settings, SettingsSource, VlessConfig};
pub use engine::{HostTunnel, TunnelEngine, TunnelStats};
pub use error::TunnelError;
pub use rules::{DomainRouter, GeoIpDatabase, RouteAction};
pub use stack::OutputFrame;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
