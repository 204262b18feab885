//! Routing decisions: domain rules and GeoIP bypass

mod geoip;
mod router;

pub use geoip::GeoIpDatabase;
pub use router::{DomainRouter, ResolvedRoute, RouteAction};
