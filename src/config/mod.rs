//! Configuration types and shared-state readers
//!
//! - [`types`]: the [`VlessConfig`] data model and its dictionary form
//! - [`url`]: `vless://` share URL admission
//! - [`settings`]: the key-value settings store view and `routing.json`

pub mod settings;
pub mod types;
mod url;

pub use settings::{
    format_country_code, pack_country_code, DomainRule, DomainRuleType, RoutingDocument,
    RoutingRule, RuleActionTag, Settings, SettingsSource, StaticSettingsSource,
};
pub use types::{
    Fingerprint, HttpUpgradeParameters, RealityParameters, Security, TlsParameters, TransportKind,
    VisionFlow, VisionSeed, VlessConfig, VlessConfigDict, WsParameters, XhttpMode, XhttpParameters,
};
