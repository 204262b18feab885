//! Fake-IP pool
//!
//! Maps routed domains to synthetic addresses. Offsets live in
//! `1..=131_071`; the IPv4 form is `198.18.0.0 + offset` (inside
//! `198.18.0.0/15`) and the IPv6 form is `fc00::` with the offset in the
//! last 32 bits. The pool keeps two parallel maps (`domain -> offset`,
//! `offset -> entry`) plus an LRU of offsets for eviction once the offset
//! space is exhausted.
//!
//! Invariants:
//! - the two maps are mutually consistent,
//! - every live offset is in the LRU exactly once,
//! - after [`FakeIpPool::rebuild`], every remaining entry's config matches
//!   the current router's resolution of its domain.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::Ipv4Net;
use tracing::{debug, trace};

use crate::config::VlessConfig;
use crate::rules::{DomainRouter, RouteAction};

/// Smallest valid offset
pub const MIN_OFFSET: u32 = 1;
/// Largest valid offset
pub const MAX_OFFSET: u32 = 131_071;

/// Base of the IPv4 fake range (`198.18.0.0/15`)
pub const FAKE_V4_BASE: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 0);

/// One domain binding
#[derive(Debug, Clone, PartialEq)]
pub struct FakeIpEntry {
    pub domain: String,
    /// `None` iff `is_direct`
    pub config: Option<VlessConfig>,
    pub is_direct: bool,
}

/// Intrusive LRU over offsets: most recent at the head
///
/// Backed by a map of `offset -> (prev, next)` links, so touch/remove are
/// O(1) without reallocating on every access.
#[derive(Debug, Default)]
struct LruList {
    links: HashMap<u32, (Option<u32>, Option<u32>)>,
    head: Option<u32>,
    tail: Option<u32>,
}

impl LruList {
    fn len(&self) -> usize {
        self.links.len()
    }

    fn contains(&self, offset: u32) -> bool {
        self.links.contains_key(&offset)
    }

    fn push_front(&mut self, offset: u32) {
        debug_assert!(!self.links.contains_key(&offset));
        let old_head = self.head;
        self.links.insert(offset, (None, old_head));
        if let Some(h) = old_head {
            if let Some(link) = self.links.get_mut(&h) {
                link.0 = Some(offset);
            }
        }
        self.head = Some(offset);
        if self.tail.is_none() {
            self.tail = Some(offset);
        }
    }

    fn unlink(&mut self, offset: u32) -> bool {
        let Some((prev, next)) = self.links.remove(&offset) else {
            return false;
        };
        match prev {
            Some(p) => {
                if let Some(link) = self.links.get_mut(&p) {
                    link.1 = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(link) = self.links.get_mut(&n) {
                    link.0 = prev;
                }
            }
            None => self.tail = prev,
        }
        true
    }

    fn touch(&mut self, offset: u32) {
        if self.head == Some(offset) {
            return;
        }
        if self.unlink(offset) {
            self.push_front(offset);
        }
    }

    fn pop_back(&mut self) -> Option<u32> {
        let tail = self.tail?;
        self.unlink(tail);
        Some(tail)
    }

    fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
    }
}

/// The fake-IP pool
#[derive(Debug)]
pub struct FakeIpPool {
    domain_to_offset: HashMap<String, u32>,
    entries: HashMap<u32, FakeIpEntry>,
    lru: LruList,
    next_offset: u32,
    v4_net: Ipv4Net,
}

impl Default for FakeIpPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIpPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            domain_to_offset: HashMap::new(),
            entries: HashMap::new(),
            lru: LruList::default(),
            next_offset: MIN_OFFSET,
            v4_net: Ipv4Net::new(FAKE_V4_BASE, 15).expect("static fake range"),
        }
    }

    /// Number of live bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no domain is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate (or refresh) the offset for a domain.
    ///
    /// A known domain keeps its offset: the entry is replaced (the routing
    /// may have changed since the last query) and its LRU position is
    /// refreshed. A new domain takes the next free offset, or evicts the
    /// least recently used binding once the space is exhausted.
    pub fn allocate(
        &mut self,
        domain: &str,
        config: Option<VlessConfig>,
        is_direct: bool,
    ) -> u32 {
        debug_assert_eq!(config.is_none(), is_direct);

        if let Some(&offset) = self.domain_to_offset.get(domain) {
            self.lru.touch(offset);
            self.entries.insert(
                offset,
                FakeIpEntry {
                    domain: domain.to_string(),
                    config,
                    is_direct,
                },
            );
            return offset;
        }

        let offset = if self.next_offset <= MAX_OFFSET {
            let off = self.next_offset;
            self.next_offset += 1;
            off
        } else {
            let victim = self.lru.pop_back().expect("full pool has an LRU tail");
            if let Some(old) = self.entries.remove(&victim) {
                trace!("Fake-IP evicting {} (offset {victim})", old.domain);
                self.domain_to_offset.remove(&old.domain);
            }
            victim
        };

        self.domain_to_offset.insert(domain.to_string(), offset);
        self.entries.insert(
            offset,
            FakeIpEntry {
                domain: domain.to_string(),
                config,
                is_direct,
            },
        );
        self.lru.push_front(offset);
        trace!("Fake-IP bound {domain} -> offset {offset}");
        offset
    }

    /// Look up the entry behind an offset
    #[must_use]
    pub fn entry(&self, offset: u32) -> Option<&FakeIpEntry> {
        self.entries.get(&offset)
    }

    /// Look up the offset of a domain
    #[must_use]
    pub fn offset_of_domain(&self, domain: &str) -> Option<u32> {
        self.domain_to_offset.get(domain).copied()
    }

    /// Resolve a destination IP to its entry, touching the LRU
    pub fn resolve_ip(&mut self, addr: IpAddr) -> Option<&FakeIpEntry> {
        let offset = Self::offset_of_ip(addr)?;
        if self.entries.contains_key(&offset) {
            self.lru.touch(offset);
            self.entries.get(&offset)
        } else {
            None
        }
    }

    /// The IPv4 address for an offset
    #[must_use]
    pub fn ipv4_for(offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(FAKE_V4_BASE) + offset)
    }

    /// The IPv6 address for an offset: `fc00::` + offset in the last 32 bits
    #[must_use]
    pub fn ipv6_for(offset: u32) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0] = 0xfc;
        octets[12..16].copy_from_slice(&offset.to_be_bytes());
        Ipv6Addr::from(octets)
    }

    /// Recover the offset from an IPv4 address; `None` outside the range.
    #[must_use]
    pub fn offset_of_ipv4(addr: Ipv4Addr) -> Option<u32> {
        let base = u32::from(FAKE_V4_BASE);
        let value = u32::from(addr);
        let offset = value.checked_sub(base)?;
        if (MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
            Some(offset)
        } else {
            None
        }
    }

    /// Recover the offset from an IPv6 address; checks the `fc00::` prefix
    /// byte-wise (bytes 0-1 are `fc 00`, bytes 2-11 are zero).
    #[must_use]
    pub fn offset_of_ipv6(addr: Ipv6Addr) -> Option<u32> {
        let o = addr.octets();
        if o[0] != 0xfc || o[1] != 0x00 || o[2..12].iter().any(|&b| b != 0) {
            return None;
        }
        let offset = u32::from_be_bytes([o[12], o[13], o[14], o[15]]);
        if (MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
            Some(offset)
        } else {
            None
        }
    }

    /// Recover the offset from either address family
    #[must_use]
    pub fn offset_of_ip(addr: IpAddr) -> Option<u32> {
        match addr {
            IpAddr::V4(v4) => Self::offset_of_ipv4(v4),
            IpAddr::V6(v6) => Self::offset_of_ipv6(v6),
        }
    }

    /// True when the address lies in a fake range (whether or not bound)
    #[must_use]
    pub fn is_fake_ip(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.v4_net.contains(&v4),
            IpAddr::V6(v6) => Self::offset_of_ipv6(v6).is_some(),
        }
    }

    /// Re-resolve every binding against a new router.
    ///
    /// Entries whose domain no longer matches, or whose proxy config is
    /// gone, are removed; the rest are updated in place. Offsets are
    /// preserved, so live flows keyed on a fake IP survive a reload.
    pub fn rebuild(&mut self, router: &DomainRouter) {
        let domains: Vec<String> = self.domain_to_offset.keys().cloned().collect();
        let mut removed = 0usize;
        for domain in domains {
            let keep = match router.match_domain(&domain) {
                Some(RouteAction::Direct) => Some((None, true)),
                Some(RouteAction::Proxy(id)) => {
                    router.config(&id).map(|c| (Some(c.clone()), false))
                }
                None => None,
            };
            match keep {
                Some((config, is_direct)) => {
                    let offset = self.domain_to_offset[&domain];
                    if let Some(entry) = self.entries.get_mut(&offset) {
                        entry.config = config;
                        entry.is_direct = is_direct;
                    }
                }
                None => {
                    self.remove_domain(&domain);
                    removed += 1;
                }
            }
        }
        debug!(
            "Fake-IP pool rebuilt: {} kept, {removed} removed",
            self.entries.len()
        );
    }

    fn remove_domain(&mut self, domain: &str) {
        if let Some(offset) = self.domain_to_offset.remove(domain) {
            self.entries.remove(&offset);
            self.lru.unlink(offset);
        }
    }

    /// Drop every binding and restart offset allocation
    pub fn clear(&mut self) {
        self.domain_to_offset.clear();
        self.entries.clear();
        self.lru.clear();
        self.next_offset = MIN_OFFSET;
    }

    /// Check the structural invariants; used by tests.
    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.domain_to_offset.len(), self.entries.len());
        assert_eq!(self.lru.len(), self.entries.len());
        for (domain, &offset) in &self.domain_to_offset {
            let entry = self.entries.get(&offset).expect("offset mapped");
            assert_eq!(&entry.domain, domain);
            assert!(self.lru.contains(offset));
            assert_eq!(entry.config.is_none(), entry.is_direct);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DomainRule, DomainRuleType, RoutingDocument, RoutingRule, RuleActionTag,
    };
    use uuid::Uuid;

    fn test_config(id: &str) -> VlessConfig {
        serde_json::from_value(serde_json::json!({
            "serverAddress": "proxy.example.com",
            "serverPort": 443,
            "uuid": id,
        }))
        .unwrap()
    }

    const CONFIG_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn test_first_allocation_is_offset_one() {
        let mut pool = FakeIpPool::new();
        let off = pool.allocate("example.com", Some(test_config(CONFIG_ID)), false);
        assert_eq!(off, 1);
        assert_eq!(FakeIpPool::ipv4_for(off), Ipv4Addr::new(198, 18, 0, 1));
        pool.check_invariants();
    }

    #[test]
    fn test_known_domain_keeps_offset() {
        let mut pool = FakeIpPool::new();
        let a = pool.allocate("a.example", None, true);
        let b = pool.allocate("b.example", None, true);
        assert_ne!(a, b);
        // Re-allocation with a changed route keeps the offset
        let a2 = pool.allocate("a.example", Some(test_config(CONFIG_ID)), false);
        assert_eq!(a, a2);
        let entry = pool.entry(a).unwrap();
        assert!(!entry.is_direct);
        assert!(entry.config.is_some());
        pool.check_invariants();
    }

    #[test]
    fn test_ip_round_trip() {
        for offset in [MIN_OFFSET, 2, 77, 65_536, MAX_OFFSET] {
            let v4 = FakeIpPool::ipv4_for(offset);
            assert_eq!(FakeIpPool::offset_of_ipv4(v4), Some(offset));
            let v6 = FakeIpPool::ipv6_for(offset);
            assert_eq!(FakeIpPool::offset_of_ipv6(v6), Some(offset));
        }
    }

    #[test]
    fn test_offset_bounds_rejected() {
        // Offset 0 is the base address itself
        assert_eq!(FakeIpPool::offset_of_ipv4(FAKE_V4_BASE), None);
        assert_eq!(
            FakeIpPool::offset_of_ipv4(Ipv4Addr::from(
                u32::from(FAKE_V4_BASE) + MAX_OFFSET + 1
            )),
            None
        );
        assert_eq!(FakeIpPool::offset_of_ipv6(FakeIpPool::ipv6_for(0)), None);
        let mut octets = [0u8; 16];
        octets[0] = 0xfc;
        octets[12..16].copy_from_slice(&(MAX_OFFSET + 1).to_be_bytes());
        assert_eq!(FakeIpPool::offset_of_ipv6(Ipv6Addr::from(octets)), None);
        // Wrong prefix
        assert_eq!(
            FakeIpPool::offset_of_ipv6("fd00::1".parse().unwrap()),
            None
        );
        assert_eq!(
            FakeIpPool::offset_of_ipv6("fc00:1::1".parse().unwrap()),
            None
        );
        // Outside the v4 range entirely
        assert_eq!(
            FakeIpPool::offset_of_ipv4(Ipv4Addr::new(10, 0, 0, 1)),
            None
        );
    }

    #[test]
    fn test_v4_v6_parity() {
        let mut pool = FakeIpPool::new();
        let off = pool.allocate("example.com", None, true);
        let v4 = FakeIpPool::ipv4_for(off);
        let v6 = FakeIpPool::ipv6_for(off);
        assert_eq!(FakeIpPool::offset_of_ipv4(v4), FakeIpPool::offset_of_ipv6(v6));
    }

    #[test]
    fn test_resolve_ip_touches_lru() {
        let mut pool = FakeIpPool::new();
        let a = pool.allocate("a.example", None, true);
        let _b = pool.allocate("b.example", None, true);
        // a is now least recent; touching it makes b the LRU tail
        assert!(pool.resolve_ip(IpAddr::V4(FakeIpPool::ipv4_for(a))).is_some());
        pool.check_invariants();
    }

    #[test]
    fn test_eviction_after_exhaustion() {
        let mut pool = FakeIpPool::new();
        // Shrink the space artificially by driving next_offset to the cap
        pool.next_offset = MAX_OFFSET - 1;
        let a = pool.allocate("a.example", None, true);
        let b = pool.allocate("b.example", None, true);
        assert_eq!(a, MAX_OFFSET - 1);
        assert_eq!(b, MAX_OFFSET);
        // Space exhausted: next allocation evicts the LRU tail (a)
        let c = pool.allocate("c.example", None, true);
        assert_eq!(c, a);
        assert_eq!(pool.offset_of_domain("a.example"), None);
        assert_eq!(pool.offset_of_domain("b.example"), Some(b));
        pool.check_invariants();
    }

    fn router_with_rule(domain: &str, config_id: Option<Uuid>) -> DomainRouter {
        let mut configs = std::collections::HashMap::new();
        let action = match config_id {
            Some(id) => {
                configs.insert(id, test_config(&id.to_string()));
                RuleActionTag::Proxy
            }
            None => RuleActionTag::Direct,
        };
        let doc = RoutingDocument {
            rules: vec![RoutingRule {
                action,
                config_id,
                domain_rules: vec![DomainRule {
                    rule_type: DomainRuleType::Domain,
                    value: domain.to_string(),
                }],
            }],
            configs,
        };
        DomainRouter::from_document(&doc).unwrap()
    }

    #[test]
    fn test_rebuild_removes_unmatched() {
        let mut pool = FakeIpPool::new();
        pool.allocate("example.com", Some(test_config(CONFIG_ID)), false);
        pool.allocate("other.com", None, true);

        let router = router_with_rule("example.com", Some(CONFIG_ID.parse().unwrap()));
        pool.rebuild(&router);
        assert_eq!(pool.len(), 1);
        assert!(pool.offset_of_domain("example.com").is_some());
        assert!(pool.offset_of_domain("other.com").is_none());
        pool.check_invariants();
    }

    #[test]
    fn test_rebuild_updates_in_place_and_preserves_offset() {
        let mut pool = FakeIpPool::new();
        let off = pool.allocate("example.com", Some(test_config(CONFIG_ID)), false);
        assert_eq!(off, 1);

        // Routing change: example.com is now direct
        let router = router_with_rule("example.com", None);
        pool.rebuild(&router);
        assert_eq!(pool.offset_of_domain("example.com"), Some(1));
        let entry = pool.entry(1).unwrap();
        assert!(entry.is_direct);
        assert!(entry.config.is_none());
        pool.check_invariants();
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut pool = FakeIpPool::new();
        pool.allocate("example.com", Some(test_config(CONFIG_ID)), false);
        pool.allocate("gone.example", None, true);

        let router = router_with_rule("example.com", Some(CONFIG_ID.parse().unwrap()));
        pool.rebuild(&router);
        let after_first: Vec<_> = {
            let mut v: Vec<_> = pool.domain_to_offset.iter().map(|(d, o)| (d.clone(), *o)).collect();
            v.sort();
            v
        };
        pool.rebuild(&router);
        let after_second: Vec<_> = {
            let mut v: Vec<_> = pool.domain_to_offset.iter().map(|(d, o)| (d.clone(), *o)).collect();
            v.sort();
            v
        };
        assert_eq!(after_first, after_second);
        pool.check_invariants();
    }

    #[test]
    fn test_rebuild_removes_entry_with_missing_config() {
        let mut pool = FakeIpPool::new();
        pool.allocate("example.com", Some(test_config(CONFIG_ID)), false);

        // Rule still matches but the referenced config is absent
        let doc = RoutingDocument {
            rules: vec![RoutingRule {
                action: RuleActionTag::Proxy,
                config_id: Some(CONFIG_ID.parse().unwrap()),
                domain_rules: vec![DomainRule {
                    rule_type: DomainRuleType::Domain,
                    value: "example.com".to_string(),
                }],
            }],
            configs: std::collections::HashMap::new(),
        };
        let router = DomainRouter::from_document(&doc).unwrap();
        pool.rebuild(&router);
        assert!(pool.is_empty());
        pool.check_invariants();
    }

    #[test]
    fn test_clear() {
        let mut pool = FakeIpPool::new();
        pool.allocate("a.example", None, true);
        pool.allocate("b.example", None, true);
        pool.clear();
        assert!(pool.is_empty());
        // Offsets restart at 1
        assert_eq!(pool.allocate("c.example", None, true), 1);
        pool.check_invariants();
    }

    #[test]
    fn test_is_fake_ip() {
        let pool = FakeIpPool::new();
        assert!(pool.is_fake_ip("198.18.0.1".parse().unwrap()));
        assert!(pool.is_fake_ip("198.19.255.255".parse().unwrap()));
        assert!(!pool.is_fake_ip("198.20.0.0".parse().unwrap()));
        assert!(!pool.is_fake_ip("8.8.8.8".parse().unwrap()));
        assert!(pool.is_fake_ip(IpAddr::V6(FakeIpPool::ipv6_for(5))));
        assert!(!pool.is_fake_ip("fd00::5".parse().unwrap()));
    }
}
