//! DNS interceptor
//!
//! Every UDP datagram to port 53 is offered here before a flow is
//! created. Queries for routed domains are answered locally with a fake
//! address; everything else falls through to a normal UDP flow.
//!
//! The wire handling is deliberately minimal: one question, no
//! compression pointers in queries, and responses built by copying the
//! query's header + question section and patching it in place:
//!
//! ```text
//! flags     0x8580  (QR=1, AA=1, RD=1, RA=1)
//! answer    name pointer 0xC00C | type | class IN | TTL 1 | rdlength | rdata
//! ```
//!
//! With DoH disabled, DDR discovery queries (`_dns.resolver.arpa`) are
//! answered NODATA so the client cannot upgrade to an encrypted resolver
//! that would bypass interception.

use tracing::{debug, trace, warn};

use super::pool::FakeIpPool;
use crate::rules::{DomainRouter, RouteAction};

/// QTYPE A
pub const QTYPE_A: u16 = 1;
/// QTYPE AAAA
pub const QTYPE_AAAA: u16 = 28;

/// Response flags: QR=1, AA=1, RD=1, RA=1
pub const RESPONSE_FLAGS: u16 = 0x8580;

/// DDR special-use name (RFC 9462)
const DDR_QNAME: &str = "_dns.resolver.arpa";

const HEADER_LEN: usize = 12;

/// A parsed question section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Lowercased QNAME without the trailing dot
    pub qname: String,
    pub qtype: u16,
    /// Byte offset just past QNAME + QTYPE + QCLASS
    pub question_end: usize,
}

/// Parse the first question of a query.
///
/// Returns `None` for anything that does not look like a plain query:
/// truncated header, QDCOUNT of zero, compression pointers inside QNAME,
/// or an empty name.
#[must_use]
pub fn parse_question(data: &[u8]) -> Option<DnsQuestion> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut offset = HEADER_LEN;
    let mut qname = String::new();
    loop {
        let label_len = *data.get(offset)? as usize;
        offset += 1;
        if label_len == 0 {
            break;
        }
        // Compression pointers are not expected in queries
        if label_len & 0xC0 != 0 {
            return None;
        }
        let label = data.get(offset..offset + label_len)?;
        if !qname.is_empty() {
            qname.push('.');
        }
        for &b in label {
            qname.push(b.to_ascii_lowercase() as char);
        }
        offset += label_len;
    }
    if qname.is_empty() {
        return None;
    }

    let qtype = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]);
    // QTYPE + QCLASS
    let question_end = offset + 4;
    if question_end > data.len() {
        return None;
    }

    Some(DnsQuestion {
        qname,
        qtype,
        question_end,
    })
}

/// Patch the copied header into a response and set ANCOUNT
fn patch_response_header(buf: &mut [u8], ancount: u16) {
    buf[2..4].copy_from_slice(&RESPONSE_FLAGS.to_be_bytes());
    buf[6..8].copy_from_slice(&ancount.to_be_bytes());
    // NSCOUNT and ARCOUNT are cleared; any additional records in the
    // query (EDNS) are not echoed because the copy stops at the question.
    buf[8..12].fill(0);
}

/// Build a NODATA response: header + question, ANCOUNT = 0
#[must_use]
pub fn build_nodata_response(query: &[u8], question_end: usize) -> Vec<u8> {
    let mut buf = query[..question_end].to_vec();
    patch_response_header(&mut buf, 0);
    buf
}

/// Build a single-answer response with the given RDATA (4 or 16 bytes)
#[must_use]
pub fn build_answer_response(
    query: &[u8],
    question_end: usize,
    qtype: u16,
    rdata: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(question_end + 12 + rdata.len());
    buf.extend_from_slice(&query[..question_end]);
    patch_response_header(&mut buf, 1);

    // Answer record: pointer to the QNAME at offset 12
    buf.extend_from_slice(&[0xC0, 0x0C]);
    buf.extend_from_slice(&qtype.to_be_bytes());
    // CLASS = IN
    buf.extend_from_slice(&[0x00, 0x01]);
    // TTL = 1 second, so clients re-ask and the router stays authoritative
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    buf.extend_from_slice(rdata);
    buf
}

/// Outcome of offering a datagram to the interceptor
#[derive(Debug, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// A synthesized response to emit back to the querier; no flow is
    /// created for it
    Respond(Vec<u8>),
    /// Not ours; let the datagram create or join a UDP flow
    Passthrough,
}

/// Offer a port-53 payload to the interceptor.
///
/// Implements the decision chain: parse, DDR block, QTYPE filter, router
/// match, pool allocation, response synthesis.
pub fn intercept(
    query: &[u8],
    router: &DomainRouter,
    pool: &mut FakeIpPool,
    doh_enabled: bool,
    ipv6_enabled: bool,
) -> InterceptOutcome {
    let Some(question) = parse_question(query) else {
        return InterceptOutcome::Passthrough;
    };

    // DDR discovery is blocked whenever DoH is off, regardless of QTYPE
    if !doh_enabled && question.qname == DDR_QNAME {
        trace!("DNS blocking DDR discovery for {}", question.qname);
        return InterceptOutcome::Respond(build_nodata_response(
            query,
            question.question_end,
        ));
    }

    if question.qtype != QTYPE_A && question.qtype != QTYPE_AAAA {
        return InterceptOutcome::Passthrough;
    }

    if router.is_empty() {
        return InterceptOutcome::Passthrough;
    }

    let (config, is_direct) = match router.match_domain(&question.qname) {
        None => return InterceptOutcome::Passthrough,
        Some(RouteAction::Direct) => (None, true),
        Some(RouteAction::Proxy(id)) => match router.config(&id) {
            Some(c) => (Some(c.clone()), false),
            None => {
                warn!(
                    "DNS rule for {} references unknown config {id}, passing through",
                    question.qname
                );
                return InterceptOutcome::Passthrough;
            }
        },
    };

    let offset = pool.allocate(&question.qname, config, is_direct);

    let response = match question.qtype {
        QTYPE_A => {
            let ip = FakeIpPool::ipv4_for(offset);
            debug!("DNS {} A -> {ip}", question.qname);
            build_answer_response(query, question.question_end, QTYPE_A, &ip.octets())
        }
        QTYPE_AAAA if ipv6_enabled => {
            let ip = FakeIpPool::ipv6_for(offset);
            debug!("DNS {} AAAA -> {ip}", question.qname);
            build_answer_response(query, question.question_end, QTYPE_AAAA, &ip.octets())
        }
        // AAAA with IPv6 disabled: NODATA, the client falls back to A
        _ => build_nodata_response(query, question.question_end),
    };
    InterceptOutcome::Respond(response)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::{
        DomainRule, DomainRuleType, RoutingDocument, RoutingRule, RuleActionTag, VlessConfig,
    };
    use uuid::Uuid;

    const CONFIG_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    /// Build a query for `name` with the given qtype
    fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut q = Vec::new();
        q.extend_from_slice(&id.to_be_bytes());
        // RD set
        q.extend_from_slice(&[0x01, 0x00]);
        // QDCOUNT 1, others 0
        q.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&qtype.to_be_bytes());
        // QCLASS IN
        q.extend_from_slice(&[0, 1]);
        q
    }

    fn test_router() -> DomainRouter {
        let id: Uuid = CONFIG_ID.parse().unwrap();
        let config: VlessConfig = serde_json::from_value(serde_json::json!({
            "serverAddress": "proxy.example.com",
            "serverPort": 443,
            "uuid": CONFIG_ID,
        }))
        .unwrap();
        let mut configs = HashMap::new();
        configs.insert(id, config);
        let doc = RoutingDocument {
            rules: vec![RoutingRule {
                action: RuleActionTag::Proxy,
                config_id: Some(id),
                domain_rules: vec![DomainRule {
                    rule_type: DomainRuleType::Domain,
                    value: "example.com".to_string(),
                }],
            }],
            configs,
        };
        DomainRouter::from_document(&doc).unwrap()
    }

    #[test]
    fn test_parse_question() {
        let q = build_query(0x1234, "Example.COM", QTYPE_A);
        let parsed = parse_question(&q).unwrap();
        assert_eq!(parsed.qname, "example.com");
        assert_eq!(parsed.qtype, QTYPE_A);
        assert_eq!(parsed.question_end, q.len());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_question(&[]).is_none());
        assert!(parse_question(&[0u8; 11]).is_none());
        // QDCOUNT = 0
        let mut q = build_query(1, "example.com", QTYPE_A);
        q[5] = 0;
        assert!(parse_question(&q).is_none());
        // Compression pointer in QNAME
        let mut q = build_query(1, "example.com", QTYPE_A);
        q[HEADER_LEN] = 0xC0;
        assert!(parse_question(&q).is_none());
        // Truncated mid-label
        let q = build_query(1, "example.com", QTYPE_A);
        assert!(parse_question(&q[..HEADER_LEN + 3]).is_none());
    }

    #[test]
    fn test_synthesizes_a_record() {
        let mut pool = FakeIpPool::new();
        let router = test_router();
        let query = build_query(0xBEEF, "example.com", QTYPE_A);

        let InterceptOutcome::Respond(rsp) =
            intercept(&query, &router, &mut pool, false, false)
        else {
            panic!("expected a response");
        };

        // ID copied
        assert_eq!(&rsp[0..2], &0xBEEFu16.to_be_bytes());
        // Flags exactly 0x8580
        assert_eq!(u16::from_be_bytes([rsp[2], rsp[3]]), RESPONSE_FLAGS);
        // QDCOUNT 1, ANCOUNT 1
        assert_eq!(u16::from_be_bytes([rsp[4], rsp[5]]), 1);
        assert_eq!(u16::from_be_bytes([rsp[6], rsp[7]]), 1);

        // Question section preserved byte for byte
        assert_eq!(&rsp[..query.len()], &query[..]);

        // Answer: pointer, type A, class IN, TTL 1, rdlength 4, 198.18.0.1
        let ans = &rsp[query.len()..];
        assert_eq!(&ans[0..2], &[0xC0, 0x0C]);
        assert_eq!(u16::from_be_bytes([ans[2], ans[3]]), QTYPE_A);
        assert_eq!(u16::from_be_bytes([ans[4], ans[5]]), 1);
        assert_eq!(u32::from_be_bytes([ans[6], ans[7], ans[8], ans[9]]), 1);
        assert_eq!(u16::from_be_bytes([ans[10], ans[11]]), 4);
        assert_eq!(&ans[12..16], &[198, 18, 0, 1]);

        // Pool state after: example.com at offset 1
        assert_eq!(pool.offset_of_domain("example.com"), Some(1));

        // The response still parses as the same question
        let reparsed = parse_question(&rsp).unwrap();
        assert_eq!(reparsed.qname, "example.com");
        assert_eq!(reparsed.qtype, QTYPE_A);
    }

    #[test]
    fn test_a_aaaa_share_offset() {
        let mut pool = FakeIpPool::new();
        let router = test_router();

        let InterceptOutcome::Respond(a_rsp) = intercept(
            &build_query(1, "example.com", QTYPE_A),
            &router,
            &mut pool,
            false,
            true,
        ) else {
            panic!()
        };
        let InterceptOutcome::Respond(aaaa_rsp) = intercept(
            &build_query(2, "example.com", QTYPE_AAAA),
            &router,
            &mut pool,
            false,
            true,
        ) else {
            panic!()
        };

        let a_rdata = &a_rsp[a_rsp.len() - 4..];
        let aaaa_rdata = &aaaa_rsp[aaaa_rsp.len() - 16..];
        let v4_offset = FakeIpPool::offset_of_ipv4(std::net::Ipv4Addr::new(
            a_rdata[0], a_rdata[1], a_rdata[2], a_rdata[3],
        ))
        .unwrap();
        let v6: [u8; 16] = aaaa_rdata.try_into().unwrap();
        let v6_offset =
            FakeIpPool::offset_of_ipv6(std::net::Ipv6Addr::from(v6)).unwrap();
        assert_eq!(v4_offset, v6_offset);
    }

    #[test]
    fn test_aaaa_nodata_when_ipv6_disabled() {
        let mut pool = FakeIpPool::new();
        let router = test_router();
        let query = build_query(7, "example.com", QTYPE_AAAA);

        let InterceptOutcome::Respond(rsp) =
            intercept(&query, &router, &mut pool, false, false)
        else {
            panic!()
        };
        assert_eq!(u16::from_be_bytes([rsp[2], rsp[3]]), RESPONSE_FLAGS);
        assert_eq!(u16::from_be_bytes([rsp[6], rsp[7]]), 0);
        assert_eq!(rsp.len(), query.len());
        // The domain is still allocated, so the A query reuses the offset
        assert_eq!(pool.offset_of_domain("example.com"), Some(1));
    }

    #[test]
    fn test_ddr_blocked_when_doh_off() {
        let mut pool = FakeIpPool::new();
        let router = test_router();
        // QTYPE SVCB (64): still blocked
        let query = build_query(9, "_dns.resolver.arpa", 64);

        let InterceptOutcome::Respond(rsp) =
            intercept(&query, &router, &mut pool, false, false)
        else {
            panic!()
        };
        assert_eq!(u16::from_be_bytes([rsp[6], rsp[7]]), 0);
        // No pool side effect
        assert!(pool.is_empty());
    }

    #[test]
    fn test_ddr_passthrough_when_doh_on() {
        let mut pool = FakeIpPool::new();
        let router = test_router();
        let query = build_query(9, "_dns.resolver.arpa", 64);
        assert_eq!(
            intercept(&query, &router, &mut pool, true, false),
            InterceptOutcome::Passthrough
        );
    }

    #[test]
    fn test_other_qtypes_fall_through() {
        let mut pool = FakeIpPool::new();
        let router = test_router();
        // MX query for a routed domain is not intercepted
        let query = build_query(3, "example.com", 15);
        assert_eq!(
            intercept(&query, &router, &mut pool, false, false),
            InterceptOutcome::Passthrough
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_unrouted_domain_falls_through() {
        let mut pool = FakeIpPool::new();
        let router = test_router();
        let query = build_query(4, "unrouted.org", QTYPE_A);
        assert_eq!(
            intercept(&query, &router, &mut pool, false, false),
            InterceptOutcome::Passthrough
        );
    }

    #[test]
    fn test_empty_router_falls_through() {
        let mut pool = FakeIpPool::new();
        let router = DomainRouter::empty();
        let query = build_query(5, "example.com", QTYPE_A);
        assert_eq!(
            intercept(&query, &router, &mut pool, false, false),
            InterceptOutcome::Passthrough
        );
    }

    #[test]
    fn test_unknown_proxy_config_falls_through() {
        let id: Uuid = CONFIG_ID.parse().unwrap();
        let doc = RoutingDocument {
            rules: vec![RoutingRule {
                action: RuleActionTag::Proxy,
                config_id: Some(id),
                domain_rules: vec![DomainRule {
                    rule_type: DomainRuleType::Domain,
                    value: "example.com".to_string(),
                }],
            }],
            configs: HashMap::new(),
        };
        let router = DomainRouter::from_document(&doc).unwrap();
        let mut pool = FakeIpPool::new();
        let query = build_query(6, "example.com", QTYPE_A);
        assert_eq!(
            intercept(&query, &router, &mut pool, false, false),
            InterceptOutcome::Passthrough
        );
        assert!(pool.is_empty());
    }
}
