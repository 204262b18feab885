//! Shared persistent state read by the core
//!
//! Two sources exist outside the core: a key-value settings store
//! (IPv6 toggle, DoH toggle, bypass country) and the `routing.json`
//! document shared with the config editor. Both are read-only from the
//! core; the host injects a [`SettingsSource`] at start and the reload
//! controller re-reads on change notifications.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::VlessConfig;
use crate::error::ConfigError;

/// Pack a two-letter country code into a `u16` (`0` = disabled)
///
/// The packing matches the GeoIP database: first letter in the high byte,
/// uppercased. Anything but exactly two ASCII letters packs to `0`.
#[must_use]
pub fn pack_country_code(code: &str) -> u16 {
    let bytes = code.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
        return 0;
    }
    let hi = bytes[0].to_ascii_uppercase();
    let lo = bytes[1].to_ascii_uppercase();
    u16::from(hi) << 8 | u16::from(lo)
}

/// Format a packed country code back to its two letters
#[must_use]
pub fn format_country_code(packed: u16) -> Option<String> {
    if packed == 0 {
        return None;
    }
    let hi = (packed >> 8) as u8;
    let lo = (packed & 0xFF) as u8;
    if hi.is_ascii_alphabetic() && lo.is_ascii_alphabetic() {
        Some(String::from_utf8_lossy(&[hi, lo]).into_owned())
    } else {
        None
    }
}

/// Typed view of the shared key-value store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settings {
    /// `ipv6Enabled`: hand out fake AAAA records, bring up the v6 interface
    pub ipv6_enabled: bool,
    /// `dohEnabled`: when false, DDR discovery queries are answered NODATA
    pub doh_enabled: bool,
    /// `bypassCountryCode` packed as a `u16`, `0` = disabled
    pub bypass_country: u16,
}

impl Settings {
    /// Build from the raw store values
    #[must_use]
    pub fn new(ipv6_enabled: bool, doh_enabled: bool, bypass_country_code: &str) -> Self {
        Self {
            ipv6_enabled,
            doh_enabled,
            bypass_country: pack_country_code(bypass_country_code),
        }
    }
}

/// One domain rule inside a routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRule {
    /// `domain`, `domainSuffix` or `domainKeyword`
    #[serde(rename = "type")]
    pub rule_type: DomainRuleType,
    pub value: String,
}

/// Domain rule matching type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainRuleType {
    #[serde(rename = "domain")]
    Domain,
    #[serde(rename = "domainSuffix")]
    DomainSuffix,
    #[serde(rename = "domainKeyword")]
    DomainKeyword,
}

/// Routing rule action tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleActionTag {
    Direct,
    Proxy,
}

/// One rule of the `routing.json` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub action: RuleActionTag,
    /// Present when `action == proxy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<Uuid>,
    #[serde(default)]
    pub domain_rules: Vec<DomainRule>,
}

/// The literal `routing.json` schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingDocument {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub configs: HashMap<Uuid, VlessConfig>,
}

impl RoutingDocument {
    /// Parse from a JSON reader.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseError` for malformed JSON or configs that
    /// fail admission.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        serde_json::from_reader(reader).map_err(ConfigError::from)
    }

    /// Parse from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseError` for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::from)
    }

    /// Load from the shared directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for I/O or parse failures.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(ConfigError::from)
    }

    /// True when no rule carries any domain rule
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.iter().all(|r| r.domain_rules.is_empty())
    }
}

/// Host-injected reader for the shared state
///
/// The reload controller calls these on every change notification and
/// diffs the results against the running values.
pub trait SettingsSource: Send + Sync {
    /// Current key-value settings
    fn load_settings(&self) -> Settings;

    /// Current routing document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the document is missing or malformed;
    /// the caller keeps the previous router in that case.
    fn load_routing(&self) -> Result<RoutingDocument, ConfigError>;
}

/// In-memory [`SettingsSource`], used by tests and embedders
#[derive(Debug, Default)]
pub struct StaticSettingsSource {
    settings: parking_lot::Mutex<Settings>,
    routing: parking_lot::Mutex<RoutingDocument>,
}

impl StaticSettingsSource {
    #[must_use]
    pub fn new(settings: Settings, routing: RoutingDocument) -> Self {
        Self {
            settings: parking_lot::Mutex::new(settings),
            routing: parking_lot::Mutex::new(routing),
        }
    }

    pub fn set_settings(&self, settings: Settings) {
        *self.settings.lock() = settings;
    }

    pub fn set_routing(&self, routing: RoutingDocument) {
        *self.routing.lock() = routing;
    }
}

impl SettingsSource for StaticSettingsSource {
    fn load_settings(&self) -> Settings {
        *self.settings.lock()
    }

    fn load_routing(&self) -> Result<RoutingDocument, ConfigError> {
        Ok(self.routing.lock().clone())
    }
}
