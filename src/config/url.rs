//! `vless://` share URL admission
//!
//! Format: `vless://<uuid>@<host>:<port>[/]?<k=v&...>[#<name>]`, with IPv6
//! hosts in brackets. Recognized parameters: `type`, `encryption`, `flow`,
//! `security`, `sni`, `alpn`, `allowInsecure`, `fp`, `pbk`, `sid`, `host`,
//! `path`, `ed`, `mode`, `testseed`, `mux`, `xudp`. Unknown parameters are
//! ignored so that newer share links still admit.

use std::net::IpAddr;
use std::str::FromStr;

use tracing::warn;
use uuid::Uuid;

use super::types::{
    decode_public_key, decode_short_id, Fingerprint, HttpUpgradeParameters, ParamMap,
    RealityParameters, Security, TlsParameters, TransportKind, VisionFlow, VisionSeed, VlessConfig,
    WsParameters, XhttpMode, XhttpParameters,
};
use crate::error::ConfigError;

/// Decode `%XX` percent escapes and `+` as space
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: &str) -> ParamMap {
    let mut params = ParamMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(percent_decode(k))
            .or_insert_with(|| percent_decode(v));
    }
    params
}

fn parse_bool_param(v: &str) -> bool {
    matches!(v, "1" | "true" | "True" | "yes")
}

/// Split `host:port` with IPv6 hosts in brackets
fn parse_host_port(authority: &str) -> Result<(String, u16), ConfigError> {
    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::invalid_url("unterminated IPv6 bracket"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| ConfigError::invalid_url("missing port"))?;
        (host.to_string(), port)
    } else {
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::invalid_url("missing port"))?;
        (host.to_string(), port)
    };
    if host.is_empty() {
        return Err(ConfigError::invalid_url("empty host"));
    }
    let port = port_str
        .parse::<u16>()
        .map_err(|e| ConfigError::invalid_url(format!("bad port: {e}")))?;
    if port == 0 {
        return Err(ConfigError::invalid_url("port must be nonzero"));
    }
    Ok((host, port))
}

impl VlessConfig {
    /// Admit a configuration from a `vless://` share URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a malformed URL, a bad UUID, an unknown
    /// enum tag, or missing Reality key material.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let rest = url
            .strip_prefix("vless://")
            .ok_or_else(|| ConfigError::invalid_url("missing vless:// scheme"))?;

        let (rest, name) = match rest.split_once('#') {
            Some((r, frag)) => (r, percent_decode(frag)),
            None => (rest, String::new()),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, q),
            None => (rest, ""),
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let (uuid_str, authority) = rest
            .split_once('@')
            .ok_or_else(|| ConfigError::invalid_url("missing user info"))?;
        let uuid = Uuid::parse_str(uuid_str)
            .map_err(|e| ConfigError::invalid_field("uuid", e.to_string()))?;
        let (host, port) = parse_host_port(authority)?;

        let params = parse_query(query);
        let get = |key: &str| params.get(key).map(String::as_str).unwrap_or("");

        let transport = TransportKind::parse(get("type"))?;
        let flow = VisionFlow::parse(get("flow"))?;
        let security = Security::parse(get("security"))?;
        let encryption = match get("encryption") {
            "" => "none".to_string(),
            e => e.to_string(),
        };

        let tls = if security == Security::Tls {
            Some(TlsParameters {
                server_name: get("sni").to_string(),
                alpn: get("alpn")
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect(),
                allow_insecure: parse_bool_param(get("allowInsecure")),
                fingerprint: Fingerprint::parse(get("fp"))?,
            })
        } else {
            None
        };

        let reality = if security == Security::Reality {
            let pbk = params
                .get("pbk")
                .ok_or(ConfigError::MissingField("realityPublicKey"))?;
            Some(RealityParameters {
                server_name: get("sni").to_string(),
                public_key: decode_public_key(pbk)?,
                short_id: decode_short_id(get("sid"))?,
                fingerprint: Fingerprint::parse(get("fp"))?,
            })
        } else {
            None
        };

        let ws = if transport == TransportKind::Ws {
            let defaults = WsParameters::default();
            Some(WsParameters {
                host: params.get("host").filter(|h| !h.is_empty()).cloned(),
                path: match get("path") {
                    "" => defaults.path,
                    p => p.to_string(),
                },
                headers: Vec::new(),
                max_early_data: get("ed").parse().unwrap_or(0),
                early_data_header: defaults.early_data_header,
            })
        } else {
            None
        };

        let http_upgrade = if transport == TransportKind::HttpUpgrade {
            Some(HttpUpgradeParameters {
                host: params.get("host").filter(|h| !h.is_empty()).cloned(),
                path: match get("path") {
                    "" => "/".to_string(),
                    p => p.to_string(),
                },
                headers: Vec::new(),
            })
        } else {
            None
        };

        let xhttp = if transport == TransportKind::Xhttp {
            Some(XhttpParameters {
                host: params.get("host").filter(|h| !h.is_empty()).cloned(),
                path: match get("path") {
                    "" => "/".to_string(),
                    p => p.to_string(),
                },
                headers: Vec::new(),
                mode: XhttpMode::parse(get("mode"))?,
                no_grpc_header: false,
            })
        } else {
            None
        };

        let seed = match params.get("testseed") {
            None => VisionSeed::default(),
            Some(raw) => VisionSeed::parse(raw).unwrap_or_else(|| {
                warn!("Ignoring unparseable testseed parameter: {raw:?}");
                VisionSeed::default()
            }),
        };

        let config = Self {
            name: if name.is_empty() {
                format!("{host}:{port}")
            } else {
                name
            },
            resolved_ip: IpAddr::from_str(&host).ok(),
            server_address: host,
            server_port: port,
            uuid,
            encryption,
            transport,
            flow,
            security,
            tls,
            reality,
            ws,
            http_upgrade,
            xhttp,
            seed,
            mux_enabled: parse_bool_param(get("mux")),
            xudp_enabled: parse_bool_param(get("xudp")),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;

    use super::*;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn test_minimal_url() {
        let config =
            VlessConfig::from_url(&format!("vless://{UUID}@proxy.example.com:443")).unwrap();
        assert_eq!(config.server_address, "proxy.example.com");
        assert_eq!(config.server_port, 443);
        assert_eq!(config.uuid.to_string(), UUID);
        assert_eq!(config.security, Security::None);
        assert_eq!(config.name, "proxy.example.com:443");
        assert!(config.resolved_ip.is_none());
    }

    #[test]
    fn test_reality_vision_url() {
        let pbk = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([7u8; 32]);
        let url = format!(
            "vless://{UUID}@1.2.3.4:443/?type=tcp&security=reality&sni=www.apple.com\
             &fp=chrome&pbk={pbk}&sid=ab12&flow=xtls-rprx-vision&mux=1&xudp=1#My%20Server"
        );
        let config = VlessConfig::from_url(&url).unwrap();
        assert_eq!(config.name, "My Server");
        assert_eq!(config.flow, VisionFlow::Vision);
        assert_eq!(config.security, Security::Reality);
        assert!(config.mux_enabled);
        assert!(config.xudp_enabled);
        assert_eq!(config.resolved_ip, Some("1.2.3.4".parse().unwrap()));
        let r = config.reality.unwrap();
        assert_eq!(r.server_name, "www.apple.com");
        assert_eq!(r.short_id, vec![0xab, 0x12]);
        assert_eq!(r.fingerprint, Fingerprint::Chrome120);
    }

    #[test]
    fn test_ws_url_with_early_data() {
        let url = format!(
            "vless://{UUID}@cdn.example.com:443?type=ws&security=tls&sni=cdn.example.com\
             &host=cdn.example.com&path=%2Ftunnel&ed=2048"
        );
        let config = VlessConfig::from_url(&url).unwrap();
        let ws = config.ws.unwrap();
        assert_eq!(ws.path, "/tunnel");
        assert_eq!(ws.host.as_deref(), Some("cdn.example.com"));
        assert_eq!(ws.max_early_data, 2048);
        assert_eq!(ws.early_data_header, "Sec-WebSocket-Protocol");
    }

    #[test]
    fn test_ipv6_host() {
        let config =
            VlessConfig::from_url(&format!("vless://{UUID}@[2001:db8::1]:8443")).unwrap();
        assert_eq!(config.server_address, "2001:db8::1");
        assert_eq!(config.server_port, 8443);
        assert_eq!(config.resolved_ip, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_testseed_param() {
        let url = format!("vless://{UUID}@h.example:443?testseed=10,20,30,40");
        let config = VlessConfig::from_url(&url).unwrap();
        assert_eq!(config.seed.content_threshold, 10);
        assert_eq!(config.seed.short_max, 40);

        // Unparseable seed falls back to the default
        let url = format!("vless://{UUID}@h.example:443?testseed=banana");
        let config = VlessConfig::from_url(&url).unwrap();
        assert_eq!(config.seed, VisionSeed::default());
    }

    #[test]
    fn test_xhttp_mode() {
        let url = format!("vless://{UUID}@h.example:443?type=xhttp&mode=packet-up&path=/up");
        let config = VlessConfig::from_url(&url).unwrap();
        let xhttp = config.xhttp.unwrap();
        assert_eq!(xhttp.mode, XhttpMode::PacketUp);
        assert_eq!(xhttp.path, "/up");
    }

    #[test]
    fn test_url_config_survives_dict_roundtrip() {
        let pbk = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([3u8; 32]);
        let url = format!(
            "vless://{UUID}@proxy.example.com:443?type=ws&security=reality&sni=covered.example\
             &pbk={pbk}&sid=ff00&path=/ws&ed=1024&flow=xtls-rprx-vision&mux=1#Round%20Trip"
        );
        let config = VlessConfig::from_url(&url).unwrap();
        let json = serde_json::to_value(config.clone()).unwrap();
        let back: VlessConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_rejects() {
        assert!(VlessConfig::from_url("http://x@y:1").is_err());
        assert!(VlessConfig::from_url("vless://not-a-uuid@y.example:1").is_err());
        assert!(VlessConfig::from_url(&format!("vless://{UUID}@y.example")).is_err());
        assert!(VlessConfig::from_url(&format!("vless://{UUID}@y.example:0")).is_err());
        assert!(VlessConfig::from_url(&format!(
            "vless://{UUID}@y.example:443?security=reality"
        ))
        .is_err());
        assert!(VlessConfig::from_url(&format!(
            "vless://{UUID}@y.example:443?type=kcp"
        ))
        .is_err());
    }
}
