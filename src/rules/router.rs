//! Domain router
//!
//! Compiles the routing document into a matcher with three rule classes,
//! checked in priority order:
//!
//! 1. Exact match — O(1) hash lookup
//! 2. Suffix match — exact equality or a `"." + suffix` trailing match
//! 3. Keyword match — substring search via an Aho-Corasick automaton
//!
//! Within a class, the first-inserted rule wins. All comparisons are on the
//! lowercased domain, so `match_domain` is a pure function of its input for
//! a fixed rule set.

use std::collections::HashMap;

use aho_corasick::AhoCorasick;
use uuid::Uuid;

use crate::config::{DomainRuleType, RoutingDocument, RuleActionTag, VlessConfig};
use crate::error::RuleError;

/// Routing decision for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Bypass the proxy
    Direct,
    /// Relay through the config with this UUID
    Proxy(Uuid),
}

impl RouteAction {
    #[must_use]
    pub const fn is_direct(self) -> bool {
        matches!(self, Self::Direct)
    }
}

/// A matched route together with its resolved config
#[derive(Debug, Clone)]
pub struct ResolvedRoute<'a> {
    pub action: RouteAction,
    /// The proxy config; `None` for direct routes **and** for proxy routes
    /// whose config id is unknown (callers log and fall through)
    pub config: Option<&'a VlessConfig>,
}

/// Compiled rule set
#[derive(Debug, Default)]
pub struct DomainRouter {
    exact: HashMap<String, RouteAction>,
    suffixes: Vec<(String, RouteAction)>,
    keyword_actions: Vec<RouteAction>,
    keyword_automaton: Option<AhoCorasick>,
    configs: HashMap<Uuid, VlessConfig>,
    rule_count: usize,
}

impl DomainRouter {
    /// An empty router; matches nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a routing document.
    ///
    /// Rules are visited in document order, so earlier rules shadow later
    /// ones within the same class. Rule values are lowercased here, once.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::MatcherBuild` if the keyword automaton cannot be
    /// constructed.
    pub fn from_document(doc: &RoutingDocument) -> Result<Self, RuleError> {
        let mut exact = HashMap::new();
        let mut suffixes: Vec<(String, RouteAction)> = Vec::new();
        let mut keywords: Vec<String> = Vec::new();
        let mut keyword_actions = Vec::new();
        let mut rule_count = 0;

        for rule in &doc.rules {
            let action = match rule.action {
                RuleActionTag::Direct => RouteAction::Direct,
                RuleActionTag::Proxy => match rule.config_id {
                    Some(id) => RouteAction::Proxy(id),
                    // Proxy rule without a config id cannot route anywhere
                    None => continue,
                },
            };

            for dr in &rule.domain_rules {
                let value = dr.value.to_ascii_lowercase();
                if value.is_empty() {
                    continue;
                }
                rule_count += 1;
                match dr.rule_type {
                    DomainRuleType::Domain => {
                        exact.entry(value).or_insert(action);
                    }
                    DomainRuleType::DomainSuffix => {
                        if !suffixes.iter().any(|(s, _)| *s == value) {
                            suffixes.push((value, action));
                        }
                    }
                    DomainRuleType::DomainKeyword => {
                        if !keywords.contains(&value) {
                            keywords.push(value);
                            keyword_actions.push(action);
                        }
                    }
                }
            }
        }

        let keyword_automaton = if keywords.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(&keywords)
                    .map_err(|e| RuleError::MatcherBuild(e.to_string()))?,
            )
        };

        Ok(Self {
            exact,
            suffixes,
            keyword_actions,
            keyword_automaton,
            configs: doc.configs.clone(),
            rule_count,
        })
    }

    /// Number of compiled domain rules
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// True when there is nothing to match against
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }

    /// Look up a config by its UUID
    #[must_use]
    pub fn config(&self, id: &Uuid) -> Option<&VlessConfig> {
        self.configs.get(id)
    }

    /// Match a domain against the rule set.
    ///
    /// Exact beats suffix beats keyword; within keywords, the
    /// first-inserted pattern wins regardless of match position.
    #[must_use]
    pub fn match_domain(&self, domain: &str) -> Option<RouteAction> {
        if domain.is_empty() || self.is_empty() {
            return None;
        }
        let domain = domain.to_ascii_lowercase();

        if let Some(action) = self.exact.get(&domain) {
            return Some(*action);
        }

        for (suffix, action) in &self.suffixes {
            if domain == *suffix {
                return Some(*action);
            }
            if domain.len() > suffix.len()
                && domain.ends_with(suffix.as_str())
                && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
            {
                return Some(*action);
            }
        }

        if let Some(automaton) = &self.keyword_automaton {
            let first = automaton
                .find_overlapping_iter(&domain)
                .map(|m| m.pattern().as_usize())
                .min()?;
            return Some(self.keyword_actions[first]);
        }

        None
    }

    /// Match a domain and resolve its config in one step
    #[must_use]
    pub fn resolve(&self, domain: &str) -> Option<ResolvedRoute<'_>> {
        let action = self.match_domain(domain)?;
        let config = match action {
            RouteAction::Direct => None,
            RouteAction::Proxy(id) => self.configs.get(&id),
        };
        Some(ResolvedRoute { action, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainRule, RoutingRule};

    fn proxy_id() -> Uuid {
        "550e8400-e29b-41d4-a716-446655440000".parse().unwrap()
    }

    fn rule(
        action: RuleActionTag,
        config_id: Option<Uuid>,
        rules: &[(DomainRuleType, &str)],
    ) -> RoutingRule {
        RoutingRule {
            action,
            config_id,
            domain_rules: rules
                .iter()
                .map(|(t, v)| DomainRule {
                    rule_type: *t,
                    value: (*v).to_string(),
                })
                .collect(),
        }
    }

    fn sample_router() -> DomainRouter {
        let doc = RoutingDocument {
            rules: vec![
                rule(
                    RuleActionTag::Proxy,
                    Some(proxy_id()),
                    &[
                        (DomainRuleType::Domain, "example.com"),
                        (DomainRuleType::DomainSuffix, "google.com"),
                        (DomainRuleType::DomainKeyword, "tracker"),
                    ],
                ),
                rule(
                    RuleActionTag::Direct,
                    None,
                    &[
                        (DomainRuleType::Domain, "example.com"),
                        (DomainRuleType::DomainSuffix, "corp.internal"),
                        (DomainRuleType::DomainKeyword, "cdn"),
                    ],
                ),
            ],
            configs: HashMap::new(),
        };
        DomainRouter::from_document(&doc).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let router = sample_router();
        // First-inserted exact rule wins
        assert_eq!(
            router.match_domain("example.com"),
            Some(RouteAction::Proxy(proxy_id()))
        );
        assert_eq!(
            router.match_domain("EXAMPLE.COM"),
            Some(RouteAction::Proxy(proxy_id()))
        );
        assert_eq!(router.match_domain("www.example.com"), None);
    }

    #[test]
    fn test_suffix_match() {
        let router = sample_router();
        assert_eq!(
            router.match_domain("google.com"),
            Some(RouteAction::Proxy(proxy_id()))
        );
        assert_eq!(
            router.match_domain("mail.google.com"),
            Some(RouteAction::Proxy(proxy_id()))
        );
        // Not a label boundary
        assert_eq!(router.match_domain("notgoogle.com"), None);
        assert_eq!(
            router.match_domain("db.corp.internal"),
            Some(RouteAction::Direct)
        );
    }

    #[test]
    fn test_keyword_match() {
        let router = sample_router();
        assert_eq!(
            router.match_domain("ads.tracker.example.org"),
            Some(RouteAction::Proxy(proxy_id()))
        );
        assert_eq!(
            router.match_domain("static.cdn77.org"),
            Some(RouteAction::Direct)
        );
    }

    #[test]
    fn test_keyword_first_inserted_wins() {
        // "cdn" appears earlier in the haystack but "tracker" was inserted
        // first, so "tracker" decides.
        let router = sample_router();
        assert_eq!(
            router.match_domain("cdn.tracker.org"),
            Some(RouteAction::Proxy(proxy_id()))
        );
    }

    #[test]
    fn test_match_order_exact_over_suffix_over_keyword() {
        let doc = RoutingDocument {
            rules: vec![
                rule(
                    RuleActionTag::Direct,
                    None,
                    &[(DomainRuleType::DomainKeyword, "example")],
                ),
                rule(
                    RuleActionTag::Proxy,
                    Some(proxy_id()),
                    &[(DomainRuleType::DomainSuffix, "example.com")],
                ),
                rule(
                    RuleActionTag::Direct,
                    None,
                    &[(DomainRuleType::Domain, "www.example.com")],
                ),
            ],
            configs: HashMap::new(),
        };
        let router = DomainRouter::from_document(&doc).unwrap();

        // Matches all three classes; exact wins
        assert_eq!(
            router.match_domain("www.example.com"),
            Some(RouteAction::Direct)
        );
        // Matches suffix and keyword; suffix wins
        assert_eq!(
            router.match_domain("api.example.com"),
            Some(RouteAction::Proxy(proxy_id()))
        );
        // Keyword only
        assert_eq!(
            router.match_domain("example.org"),
            Some(RouteAction::Direct)
        );
    }

    #[test]
    fn test_determinism() {
        let router = sample_router();
        for _ in 0..3 {
            assert_eq!(
                router.match_domain("Mail.Google.Com"),
                Some(RouteAction::Proxy(proxy_id()))
            );
        }
    }

    #[test]
    fn test_empty_router() {
        let router = DomainRouter::empty();
        assert!(router.is_empty());
        assert_eq!(router.match_domain("example.com"), None);
        assert_eq!(router.match_domain(""), None);
    }

    #[test]
    fn test_proxy_rule_without_config_id_skipped() {
        let doc = RoutingDocument {
            rules: vec![rule(
                RuleActionTag::Proxy,
                None,
                &[(DomainRuleType::Domain, "example.com")],
            )],
            configs: HashMap::new(),
        };
        let router = DomainRouter::from_document(&doc).unwrap();
        assert!(router.is_empty());
    }

    #[test]
    fn test_resolve_unknown_config() {
        let router = sample_router();
        let resolved = router.resolve("example.com").unwrap();
        assert_eq!(resolved.action, RouteAction::Proxy(proxy_id()));
        // Config table is empty in the sample, so resolution yields None
        assert!(resolved.config.is_none());

        let resolved = router.resolve("db.corp.internal").unwrap();
        assert_eq!(resolved.action, RouteAction::Direct);
        assert!(resolved.config.is_none());
    }
}
