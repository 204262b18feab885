//! Cross-validation of synthesized DNS responses
//!
//! The interceptor builds responses byte by byte; these tests feed them
//! through an independent DNS implementation (hickory-proto) to prove
//! the wire format is well-formed, the compression pointer resolves, and
//! the answer matches the fake address the pool allocated.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::BinDecodable;

use rust_tunnel::config::{RoutingDocument, VlessConfig};
use rust_tunnel::fakedns::{intercept, FakeIpPool, InterceptOutcome};
use rust_tunnel::DomainRouter;

const CONFIG_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut q = Vec::new();
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&[0x01, 0x00]);
    q.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        q.push(label.len() as u8);
        q.extend_from_slice(label.as_bytes());
    }
    q.push(0);
    q.extend_from_slice(&qtype.to_be_bytes());
    q.extend_from_slice(&[0, 1]);
    q
}

fn test_router() -> DomainRouter {
    let config: VlessConfig = serde_json::from_value(serde_json::json!({
        "serverAddress": "proxy.example.com",
        "serverPort": 443,
        "uuid": CONFIG_ID,
    }))
    .unwrap();
    let mut configs = HashMap::new();
    configs.insert(CONFIG_ID.parse().unwrap(), config);
    let doc: RoutingDocument = serde_json::from_value(serde_json::json!({
        "rules": [
            {
                "action": "proxy",
                "configId": CONFIG_ID,
                "domainRules": [
                    {"type": "domain", "value": "example.com"},
                    {"type": "domainSuffix", "value": "routed.net"}
                ]
            }
        ],
        "configs": {}
    }))
    .unwrap();
    let doc = RoutingDocument { configs, ..doc };
    DomainRouter::from_document(&doc).unwrap()
}

fn respond(query: &[u8], ipv6: bool) -> Vec<u8> {
    let router = test_router();
    let mut pool = FakeIpPool::new();
    match intercept(query, &router, &mut pool, false, ipv6) {
        InterceptOutcome::Respond(r) => r,
        InterceptOutcome::Passthrough => panic!("expected a response"),
    }
}

#[test]
fn a_response_parses_under_hickory() {
    let query = build_query(0x4242, "example.com", 1);
    let response = respond(&query, false);

    let message = Message::from_bytes(&response).expect("response must parse");
    assert_eq!(message.id(), 0x4242);
    assert!(message.header().authoritative());
    assert!(message.header().recursion_desired());
    assert!(message.header().recursion_available());
    assert_eq!(message.response_code(), ResponseCode::NoError);

    // Question preserved
    assert_eq!(message.queries().len(), 1);
    let q = &message.queries()[0];
    assert_eq!(q.name().to_string(), "example.com.");
    assert_eq!(q.query_type(), RecordType::A);

    // One answer, TTL 1, fake address; the 0xC00C pointer resolved to
    // the same owner name
    assert_eq!(message.answers().len(), 1);
    let answer = &message.answers()[0];
    assert_eq!(answer.name().to_string(), "example.com.");
    assert_eq!(answer.ttl(), 1);
    match answer.data() {
        Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(198, 18, 0, 1)),
        other => panic!("expected an A record, got {other:?}"),
    }
}

#[test]
fn aaaa_response_parses_under_hickory() {
    let query = build_query(7, "www.routed.net", 28);
    let response = respond(&query, true);

    let message = Message::from_bytes(&response).unwrap();
    assert_eq!(message.answers().len(), 1);
    match message.answers()[0].data() {
        Some(RData::AAAA(aaaa)) => {
            let octets = aaaa.0.octets();
            assert_eq!(octets[0], 0xfc);
            assert_eq!(u32::from_be_bytes(octets[12..16].try_into().unwrap()), 1);
        }
        other => panic!("expected an AAAA record, got {other:?}"),
    }
}

#[test]
fn nodata_response_parses_under_hickory() {
    // AAAA with IPv6 disabled yields NODATA
    let query = build_query(9, "example.com", 28);
    let response = respond(&query, false);

    let message = Message::from_bytes(&response).unwrap();
    assert_eq!(message.answers().len(), 0);
    assert_eq!(message.queries().len(), 1);
    assert!(message.header().authoritative());
}
