//! Proxy endpoint configuration types
//!
//! [`VlessConfig`] is the valid-by-construction description of one VLESS
//! endpoint: server location, client UUID, transport, security layer and
//! the Vision/mux options. A config is immutable once admitted; identity
//! is the client UUID.
//!
//! Two external representations exist and both round-trip:
//!
//! - the serialized dictionary form used inside `routing.json` (camelCase
//!   keys, see [`VlessConfigDict`]),
//! - the `vless://` share URL (see [`VlessConfig::from_url`]).

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Transport carrying the VLESS stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Raw TCP (possibly inside TLS/Reality)
    #[default]
    Tcp,
    /// WebSocket (RFC 6455)
    Ws,
    /// HTTP/1.1 Upgrade, raw bytes after the 101
    HttpUpgrade,
    /// XHTTP over HTTP/2
    Xhttp,
}

impl TransportKind {
    /// Parse the `type` URL parameter / dictionary value
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownVariant` for unrecognized tags.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "tcp" => Ok(Self::Tcp),
            "ws" => Ok(Self::Ws),
            "httpupgrade" => Ok(Self::HttpUpgrade),
            "xhttp" => Ok(Self::Xhttp),
            other => Err(ConfigError::unknown_variant("transport", other)),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::HttpUpgrade => "httpupgrade",
            Self::Xhttp => "xhttp",
        }
    }
}

/// Vision flow selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisionFlow {
    /// No flow: plain VLESS stream
    #[default]
    None,
    /// `xtls-rprx-vision`
    Vision,
    /// `xtls-rprx-vision-udp443`: Vision plus UDP/443 allowed through XUDP
    VisionUdp443,
}

impl VisionFlow {
    /// Parse a flow string; the empty string means no flow.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownVariant` for unrecognized flows.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "none" => Ok(Self::None),
            "xtls-rprx-vision" => Ok(Self::Vision),
            "xtls-rprx-vision-udp443" => Ok(Self::VisionUdp443),
            other => Err(ConfigError::unknown_variant("flow", other)),
        }
    }

    /// The wire string carried in the VLESS addons (empty when none)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Vision => "xtls-rprx-vision",
            Self::VisionUdp443 => "xtls-rprx-vision-udp443",
        }
    }

    /// Whether Vision padding applies to TCP streams
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Security layer under the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption below VLESS
    #[default]
    None,
    /// Standard TLS 1.3 via rustls
    Tls,
    /// Reality TLS 1.3 emulation
    Reality,
}

impl Security {
    /// Parse the `security` URL parameter / dictionary value
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownVariant` for unrecognized tags.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "none" => Ok(Self::None),
            "tls" => Ok(Self::Tls),
            "reality" => Ok(Self::Reality),
            other => Err(ConfigError::unknown_variant("security", other)),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::Reality => "reality",
        }
    }
}

/// Browser fingerprint tag for TLS ClientHello shaping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fingerprint {
    #[default]
    Chrome120,
    Firefox,
    Safari,
    Edge,
    Ios,
    /// Pick one of the above at connection time
    Random,
}

impl Fingerprint {
    /// Parse the `fp` URL parameter; the empty string selects Chrome.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownVariant` for unrecognized tags.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "chrome" | "chrome_120" => Ok(Self::Chrome120),
            "firefox" => Ok(Self::Firefox),
            "safari" => Ok(Self::Safari),
            "edge" => Ok(Self::Edge),
            "ios" => Ok(Self::Ios),
            "random" => Ok(Self::Random),
            other => Err(ConfigError::unknown_variant("fingerprint", other)),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chrome120 => "chrome_120",
            Self::Firefox => "firefox",
            Self::Safari => "safari",
            Self::Edge => "edge",
            Self::Ios => "ios",
            Self::Random => "random",
        }
    }
}

/// TLS parameters for `security=tls`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsParameters {
    /// SNI
    pub server_name: String,
    /// ALPN protocols, outermost first
    pub alpn: Vec<String>,
    /// Skip certificate verification
    pub allow_insecure: bool,
    /// Browser fingerprint tag
    pub fingerprint: Fingerprint,
}

/// Reality parameters for `security=reality`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityParameters {
    /// Covered SNI sent in the emulated ClientHello
    pub server_name: String,
    /// Server static X25519 public key
    pub public_key: [u8; 32],
    /// Short ID, 0 to 8 bytes
    pub short_id: Vec<u8>,
    /// Browser fingerprint tag
    pub fingerprint: Fingerprint,
}

/// WebSocket transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsParameters {
    /// Host header override (connection address when `None`)
    pub host: Option<String>,
    /// Request path
    pub path: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Maximum early-data bytes embedded in the upgrade request
    pub max_early_data: usize,
    /// Header carrying the base64url early data
    pub early_data_header: String,
}

impl Default for WsParameters {
    fn default() -> Self {
        Self {
            host: None,
            path: "/".to_string(),
            headers: Vec::new(),
            max_early_data: 0,
            early_data_header: "Sec-WebSocket-Protocol".to_string(),
        }
    }
}

/// HTTP-Upgrade transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUpgradeParameters {
    pub host: Option<String>,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpUpgradeParameters {
    fn default() -> Self {
        Self {
            host: None,
            path: "/".to_string(),
            headers: Vec::new(),
        }
    }
}

/// XHTTP sub-mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XhttpMode {
    /// Choose by capability (resolves to stream-one)
    #[default]
    Auto,
    /// Chunked POST uplink + long-lived GET downlink
    PacketUp,
    /// One long-lived POST carrying both directions
    StreamOne,
}

impl XhttpMode {
    /// Parse the `mode` URL parameter / dictionary value
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownVariant` for unrecognized tags.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "auto" => Ok(Self::Auto),
            "packet-up" => Ok(Self::PacketUp),
            "stream-one" => Ok(Self::StreamOne),
            other => Err(ConfigError::unknown_variant("xhttpMode", other)),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::PacketUp => "packet-up",
            Self::StreamOne => "stream-one",
        }
    }
}

/// XHTTP transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhttpParameters {
    pub host: Option<String>,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub mode: XhttpMode,
    /// Suppress the `Content-Type: application/grpc` header
    pub no_grpc_header: bool,
}

impl Default for XhttpParameters {
    fn default() -> Self {
        Self {
            host: None,
            path: "/".to_string(),
            headers: Vec::new(),
            mode: XhttpMode::Auto,
            no_grpc_header: false,
        }
    }
}

/// Vision padding seed: `[content_threshold, long_max, long_base, short_max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisionSeed {
    /// Number of short-padded records before the long pad
    pub content_threshold: u32,
    /// Random span of the long pad
    pub long_max: u32,
    /// Base length of the long pad
    pub long_base: u32,
    /// Upper bound of each short pad
    pub short_max: u32,
}

impl Default for VisionSeed {
    fn default() -> Self {
        Self {
            content_threshold: 900,
            long_max: 500,
            long_base: 900,
            short_max: 256,
        }
    }
}

impl VisionSeed {
    /// Parse the `testseed` URL parameter: exactly four comma-separated u32.
    ///
    /// Returns `None` when the value does not parse; callers fall back to
    /// the default seed.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.len() != 4 {
            return None;
        }
        Some(Self {
            content_threshold: parts[0],
            long_max: parts[1],
            long_base: parts[2],
            short_max: parts[3],
        })
    }

    /// Serialize back to the `testseed` form
    #[must_use]
    pub fn to_param(self) -> String {
        format!(
            "{},{},{},{}",
            self.content_threshold, self.long_max, self.long_base, self.short_max
        )
    }
}

/// One admitted VLESS endpoint
///
/// Constructed through [`VlessConfig::from_url`] or the serde dictionary
/// form; both validate. Identity is `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "VlessConfigDict", into = "VlessConfigDict")]
pub struct VlessConfig {
    /// Display name
    pub name: String,
    /// Server host (domain or IP literal)
    pub server_address: String,
    /// Server port
    pub server_port: u16,
    /// Pre-resolved server IP, when the subscription provided one
    pub resolved_ip: Option<IpAddr>,
    /// Client UUID
    pub uuid: Uuid,
    /// Encryption tag; always `"none"` for VLESS
    pub encryption: String,
    /// Transport carrying the stream
    pub transport: TransportKind,
    /// Vision flow
    pub flow: VisionFlow,
    /// Security layer
    pub security: Security,
    /// TLS parameters (`security=tls`)
    pub tls: Option<TlsParameters>,
    /// Reality parameters (`security=reality`)
    pub reality: Option<RealityParameters>,
    /// WebSocket parameters (`transport=ws`)
    pub ws: Option<WsParameters>,
    /// HTTP-Upgrade parameters (`transport=httpupgrade`)
    pub http_upgrade: Option<HttpUpgradeParameters>,
    /// XHTTP parameters (`transport=xhttp`)
    pub xhttp: Option<XhttpParameters>,
    /// Vision padding seed
    pub seed: VisionSeed,
    /// Stream multiplexing enabled
    pub mux_enabled: bool,
    /// XUDP global-ID UDP enabled
    pub xudp_enabled: bool,
}

impl VlessConfig {
    /// `host:port` of the endpoint, preferring the pre-resolved IP
    #[must_use]
    pub fn dial_address(&self) -> String {
        match self.resolved_ip {
            Some(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.server_port),
            Some(IpAddr::V4(ip)) => format!("{ip}:{}", self.server_port),
            None => {
                if self.server_address.contains(':') {
                    format!("[{}]:{}", self.server_address, self.server_port)
                } else {
                    format!("{}:{}", self.server_address, self.server_port)
                }
            }
        }
    }

    /// The SNI in effect for the security layer (covered SNI under Reality)
    #[must_use]
    pub fn effective_server_name(&self) -> &str {
        match self.security {
            Security::Reality => self
                .reality
                .as_ref()
                .map_or(self.server_address.as_str(), |r| r.server_name.as_str()),
            _ => self
                .tls
                .as_ref()
                .filter(|t| !t.server_name.is_empty())
                .map_or(self.server_address.as_str(), |t| t.server_name.as_str()),
        }
    }

    /// Whether Vision + mux is active, which routes UDP through XUDP
    #[must_use]
    pub fn uses_mux_udp(&self) -> bool {
        self.flow.is_active() && self.mux_enabled
    }

    /// Validate cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a security/transport section is missing
    /// for its selected tag or the Reality key material is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption != "none" {
            return Err(ConfigError::invalid_field(
                "encryption",
                format!("must be \"none\", got {:?}", self.encryption),
            ));
        }
        if self.server_address.is_empty() {
            return Err(ConfigError::MissingField("serverAddress"));
        }
        if self.server_port == 0 {
            return Err(ConfigError::invalid_field("serverPort", "must be nonzero"));
        }
        match self.security {
            Security::Reality => {
                let r = self
                    .reality
                    .as_ref()
                    .ok_or(ConfigError::MissingField("realityPublicKey"))?;
                if r.short_id.len() > 8 {
                    return Err(ConfigError::invalid_field(
                        "realityShortId",
                        format!("{} bytes (max 8)", r.short_id.len()),
                    ));
                }
            }
            Security::Tls | Security::None => {}
        }
        Ok(())
    }
}

impl fmt::Display for VlessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}, {}/{})",
            self.name,
            self.server_address,
            self.server_port,
            self.transport.as_str(),
            self.security.as_str()
        )
    }
}

// ============================================================================
// Dictionary form
// ============================================================================

fn is_false(b: &bool) -> bool {
    !*b
}

/// Serialized dictionary form of [`VlessConfig`]
///
/// This is the literal schema used in `routing.json` and in the start call.
/// Flat camelCase keys; optional sections are omitted when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VlessConfigDict {
    #[serde(default)]
    pub name: String,
    pub server_address: String,
    pub server_port: u16,
    #[serde(default, rename = "resolvedIP", skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<String>,
    pub uuid: String,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub security: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_alpn: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub tls_allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_short_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_headers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_max_early_data: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_early_data_header_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hu_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hu_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hu_headers: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xhttp_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xhttp_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xhttp_headers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xhttp_mode: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub xhttp_no_grpc_header: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_seed: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mux_enabled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub xudp_enabled: bool,
}

fn default_encryption() -> String {
    "none".to_string()
}

/// Parse a `k:v,k:v` comma-joined header list
fn parse_header_list(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

fn join_header_list(headers: &[(String, String)]) -> Option<String> {
    if headers.is_empty() {
        return None;
    }
    Some(
        headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Decode the base64 Reality public key (URL-safe or standard alphabet)
pub(crate) fn decode_public_key(s: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(s))
        .map_err(|e| ConfigError::invalid_field("realityPublicKey", e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ConfigError::invalid_field("realityPublicKey", "must decode to 32 bytes"))
}

/// Decode the hex Reality short ID (0 to 8 bytes)
pub(crate) fn decode_short_id(s: &str) -> Result<Vec<u8>, ConfigError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let bytes =
        hex::decode(s).map_err(|e| ConfigError::invalid_field("realityShortId", e.to_string()))?;
    if bytes.len() > 8 {
        return Err(ConfigError::invalid_field(
            "realityShortId",
            format!("{} bytes (max 8)", bytes.len()),
        ));
    }
    Ok(bytes)
}

impl TryFrom<VlessConfigDict> for VlessConfig {
    type Error = ConfigError;

    fn try_from(d: VlessConfigDict) -> Result<Self, ConfigError> {
        let uuid = Uuid::parse_str(&d.uuid)
            .map_err(|e| ConfigError::invalid_field("uuid", e.to_string()))?;
        let resolved_ip = match d.resolved_ip.as_deref() {
            None | Some("") => None,
            Some(s) => Some(
                IpAddr::from_str(s)
                    .map_err(|e| ConfigError::invalid_field("resolvedIP", e.to_string()))?,
            ),
        };
        let transport = TransportKind::parse(&d.transport)?;
        let flow = VisionFlow::parse(&d.flow)?;
        let security = Security::parse(&d.security)?;

        let tls = if security == Security::Tls {
            Some(TlsParameters {
                server_name: d.tls_server_name.clone().unwrap_or_default(),
                alpn: d
                    .tls_alpn
                    .as_deref()
                    .map(|a| {
                        a.split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                allow_insecure: d.tls_allow_insecure,
                fingerprint: Fingerprint::parse(d.tls_fingerprint.as_deref().unwrap_or(""))?,
            })
        } else {
            None
        };

        let reality = if security == Security::Reality {
            let pk = d
                .reality_public_key
                .as_deref()
                .ok_or(ConfigError::MissingField("realityPublicKey"))?;
            Some(RealityParameters {
                server_name: d.reality_server_name.clone().unwrap_or_default(),
                public_key: decode_public_key(pk)?,
                short_id: decode_short_id(d.reality_short_id.as_deref().unwrap_or(""))?,
                fingerprint: Fingerprint::parse(d.reality_fingerprint.as_deref().unwrap_or(""))?,
            })
        } else {
            None
        };

        let ws = if transport == TransportKind::Ws {
            let defaults = WsParameters::default();
            Some(WsParameters {
                host: d.ws_host.clone().filter(|h| !h.is_empty()),
                path: d.ws_path.clone().unwrap_or(defaults.path),
                headers: d
                    .ws_headers
                    .as_deref()
                    .map(parse_header_list)
                    .unwrap_or_default(),
                max_early_data: d.ws_max_early_data.unwrap_or(0),
                early_data_header: d
                    .ws_early_data_header_name
                    .clone()
                    .filter(|h| !h.is_empty())
                    .unwrap_or(defaults.early_data_header),
            })
        } else {
            None
        };

        let http_upgrade = if transport == TransportKind::HttpUpgrade {
            Some(HttpUpgradeParameters {
                host: d.hu_host.clone().filter(|h| !h.is_empty()),
                path: d.hu_path.clone().unwrap_or_else(|| "/".to_string()),
                headers: d
                    .hu_headers
                    .as_deref()
                    .map(parse_header_list)
                    .unwrap_or_default(),
            })
        } else {
            None
        };

        let xhttp = if transport == TransportKind::Xhttp {
            Some(XhttpParameters {
                host: d.xhttp_host.clone().filter(|h| !h.is_empty()),
                path: d.xhttp_path.clone().unwrap_or_else(|| "/".to_string()),
                headers: d
                    .xhttp_headers
                    .as_deref()
                    .map(parse_header_list)
                    .unwrap_or_default(),
                mode: XhttpMode::parse(d.xhttp_mode.as_deref().unwrap_or(""))?,
                no_grpc_header: d.xhttp_no_grpc_header,
            })
        } else {
            None
        };

        let seed = d
            .test_seed
            .as_deref()
            .and_then(VisionSeed::parse)
            .unwrap_or_default();

        let config = Self {
            name: d.name,
            server_address: d.server_address,
            server_port: d.server_port,
            resolved_ip,
            uuid,
            encryption: d.encryption,
            transport,
            flow,
            security,
            tls,
            reality,
            ws,
            http_upgrade,
            xhttp,
            seed,
            mux_enabled: d.mux_enabled,
            xudp_enabled: d.xudp_enabled,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<VlessConfig> for VlessConfigDict {
    fn from(c: VlessConfig) -> Self {
        let default_seed = VisionSeed::default();
        Self {
            name: c.name,
            server_address: c.server_address,
            server_port: c.server_port,
            resolved_ip: c.resolved_ip.map(|ip| ip.to_string()),
            uuid: c.uuid.to_string(),
            encryption: c.encryption,
            transport: c.transport.as_str().to_string(),
            flow: c.flow.as_str().to_string(),
            security: c.security.as_str().to_string(),
            tls_server_name: c.tls.as_ref().map(|t| t.server_name.clone()),
            tls_alpn: c.tls.as_ref().and_then(|t| {
                if t.alpn.is_empty() {
                    None
                } else {
                    Some(t.alpn.join(","))
                }
            }),
            tls_allow_insecure: c.tls.as_ref().is_some_and(|t| t.allow_insecure),
            tls_fingerprint: c.tls.as_ref().map(|t| t.fingerprint.as_str().to_string()),
            reality_server_name: c.reality.as_ref().map(|r| r.server_name.clone()),
            reality_public_key: c.reality.as_ref().map(|r| {
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(r.public_key)
            }),
            reality_short_id: c.reality.as_ref().map(|r| hex::encode(&r.short_id)),
            reality_fingerprint: c
                .reality
                .as_ref()
                .map(|r| r.fingerprint.as_str().to_string()),
            ws_host: c.ws.as_ref().and_then(|w| w.host.clone()),
            ws_path: c.ws.as_ref().map(|w| w.path.clone()),
            ws_headers: c.ws.as_ref().and_then(|w| join_header_list(&w.headers)),
            ws_max_early_data: c.ws.as_ref().map(|w| w.max_early_data),
            ws_early_data_header_name: c.ws.as_ref().map(|w| w.early_data_header.clone()),
            hu_host: c.http_upgrade.as_ref().and_then(|h| h.host.clone()),
            hu_path: c.http_upgrade.as_ref().map(|h| h.path.clone()),
            hu_headers: c
                .http_upgrade
                .as_ref()
                .and_then(|h| join_header_list(&h.headers)),
            xhttp_host: c.xhttp.as_ref().and_then(|x| x.host.clone()),
            xhttp_path: c.xhttp.as_ref().map(|x| x.path.clone()),
            xhttp_headers: c.xhttp.as_ref().and_then(|x| join_header_list(&x.headers)),
            xhttp_mode: c.xhttp.as_ref().map(|x| x.mode.as_str().to_string()),
            xhttp_no_grpc_header: c.xhttp.as_ref().is_some_and(|x| x.no_grpc_header),
            test_seed: if c.seed == default_seed {
                None
            } else {
                Some(c.seed.to_param())
            },
            mux_enabled: c.mux_enabled,
            xudp_enabled: c.xudp_enabled,
        }
    }
}

/// Ordered view of URL query parameters (used by the URL parser)
pub(crate) type ParamMap = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_dict() -> VlessConfigDict {
        serde_json::from_value(serde_json::json!({
            "serverAddress": "proxy.example.com",
            "serverPort": 443,
            "uuid": "550e8400-e29b-41d4-a716-446655440000",
        }))
        .unwrap()
    }

    #[test]
    fn test_minimal_dict_admission() {
        let config = VlessConfig::try_from(minimal_dict()).unwrap();
        assert_eq!(config.server_address, "proxy.example.com");
        assert_eq!(config.server_port, 443);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.flow, VisionFlow::None);
        assert_eq!(config.security, Security::None);
        assert_eq!(config.encryption, "none");
        assert_eq!(config.seed, VisionSeed::default());
    }

    #[test]
    fn test_dict_roundtrip() {
        let json = serde_json::json!({
            "name": "home",
            "serverAddress": "1.2.3.4",
            "serverPort": 8443,
            "uuid": "550e8400-e29b-41d4-a716-446655440000",
            "transport": "ws",
            "security": "tls",
            "tlsServerName": "cdn.example.com",
            "tlsAlpn": "h2,http/1.1",
            "wsPath": "/tunnel",
            "wsHost": "cdn.example.com",
            "wsHeaders": "X-Auth:token,X-Env:prod",
            "wsMaxEarlyData": 2048,
            "muxEnabled": true,
        });
        let config: VlessConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.transport, TransportKind::Ws);
        let ws = config.ws.as_ref().unwrap();
        assert_eq!(ws.path, "/tunnel");
        assert_eq!(ws.max_early_data, 2048);
        assert_eq!(ws.headers.len(), 2);
        assert_eq!(ws.early_data_header, "Sec-WebSocket-Protocol");
        assert!(config.mux_enabled);

        let back = serde_json::to_value(config.clone()).unwrap();
        let config2: VlessConfig = serde_json::from_value(back).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn test_reality_requires_public_key() {
        let mut d = minimal_dict();
        d.security = "reality".to_string();
        assert!(matches!(
            VlessConfig::try_from(d),
            Err(ConfigError::MissingField("realityPublicKey"))
        ));
    }

    #[test]
    fn test_reality_admission() {
        let mut d = minimal_dict();
        d.security = "reality".to_string();
        d.reality_server_name = Some("www.microsoft.com".to_string());
        d.reality_public_key = Some(
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([0x42u8; 32]),
        );
        d.reality_short_id = Some("0123ab".to_string());
        let config = VlessConfig::try_from(d).unwrap();
        let r = config.reality.as_ref().unwrap();
        assert_eq!(r.public_key, [0x42u8; 32]);
        assert_eq!(r.short_id, vec![0x01, 0x23, 0xab]);
        assert_eq!(config.effective_server_name(), "www.microsoft.com");
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let mut d = minimal_dict();
        d.transport = "grpc".to_string();
        assert!(matches!(
            VlessConfig::try_from(d),
            Err(ConfigError::UnknownVariant { kind: "transport", .. })
        ));
    }

    #[test]
    fn test_bad_uuid_rejected() {
        let mut d = minimal_dict();
        d.uuid = "not-a-uuid".to_string();
        assert!(VlessConfig::try_from(d).is_err());
    }

    #[test]
    fn test_vision_seed_parse() {
        assert_eq!(
            VisionSeed::parse("900,500,900,256"),
            Some(VisionSeed::default())
        );
        assert_eq!(
            VisionSeed::parse("1, 2, 3, 4"),
            Some(VisionSeed {
                content_threshold: 1,
                long_max: 2,
                long_base: 3,
                short_max: 4,
            })
        );
        assert_eq!(VisionSeed::parse("1,2,3"), None);
        assert_eq!(VisionSeed::parse("1,2,3,x"), None);
        assert_eq!(VisionSeed::parse(""), None);
    }

    #[test]
    fn test_short_id_bounds() {
        assert_eq!(decode_short_id("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_short_id("0011223344556677").unwrap().len(), 8);
        assert!(decode_short_id("001122334455667788").is_err());
        assert!(decode_short_id("zz").is_err());
    }

    #[test]
    fn test_dial_address() {
        let mut config = VlessConfig::try_from(minimal_dict()).unwrap();
        assert_eq!(config.dial_address(), "proxy.example.com:443");

        config.resolved_ip = Some("10.1.2.3".parse().unwrap());
        assert_eq!(config.dial_address(), "10.1.2.3:443");

        config.resolved_ip = Some("2001:db8::1".parse().unwrap());
        assert_eq!(config.dial_address(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_uses_mux_udp() {
        let mut config = VlessConfig::try_from(minimal_dict()).unwrap();
        assert!(!config.uses_mux_udp());
        config.flow = VisionFlow::Vision;
        assert!(!config.uses_mux_udp());
        config.mux_enabled = true;
        assert!(config.uses_mux_udp());
    }
}
