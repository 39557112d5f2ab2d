//! Bypass matchers.
//!
//! A bypass answers one question: does this destination fall outside normal
//! forwarding? What a positive answer means is decided by the caller:
//! services refuse the connection, hops truncate the route, and nodes drop
//! out of the candidate list.
use std::sync::Arc;

use crate::{
    config::models::BypassConfig,
    core::{addr::host_of, matcher::AddrMatcher},
};

/// Destination being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct BypassQuery<'a> {
    pub network: &'a str,
    pub addr: &'a str,
    /// Host name seen before resolution, if the address was already resolved
    pub host: Option<&'a str>,
}

impl<'a> BypassQuery<'a> {
    pub fn new(network: &'a str, addr: &'a str) -> Self {
        Self {
            network,
            addr,
            host: None,
        }
    }

    pub fn with_host(mut self, host: &'a str) -> Self {
        self.host = Some(host);
        self
    }
}

/// Trait defining the bypass decision
pub trait Bypass: Send + Sync + 'static {
    fn contains(&self, query: &BypassQuery<'_>) -> bool;
}

/// Pattern based bypass with optional allow-list semantics.
#[derive(Debug)]
pub struct MatcherBypass {
    name: String,
    matcher: AddrMatcher,
    whitelist: bool,
}

impl MatcherBypass {
    pub fn new(name: impl Into<String>, matcher: AddrMatcher, whitelist: bool) -> Self {
        Self {
            name: name.into(),
            matcher,
            whitelist,
        }
    }

    pub fn from_config(config: &BypassConfig) -> Result<Self, String> {
        let matcher = AddrMatcher::new(&config.matchers)
            .map_err(|e| format!("bypass {}: {e}", config.name))?;
        tracing::info!(
            "Creating bypass: name={}, matchers={}, whitelist={}",
            config.name,
            matcher.len(),
            config.whitelist
        );
        Ok(Self::new(config.name.clone(), matcher, config.whitelist))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Bypass for MatcherBypass {
    fn contains(&self, query: &BypassQuery<'_>) -> bool {
        if query.addr.is_empty() {
            return false;
        }

        let matched = self.matcher.matches(host_of(query.addr))
            || query.host.is_some_and(|host| self.matcher.matches(host_of(host)));
        let bypass = matched != self.whitelist;

        if bypass {
            tracing::debug!(bypass = %self.name, addr = query.addr, "bypass: {}", query.addr);
        }
        bypass
    }
}

/// Several bypasses combined; any positive answer wins.
pub struct BypassGroup {
    members: Vec<Arc<dyn Bypass>>,
}

impl BypassGroup {
    pub fn new(members: Vec<Arc<dyn Bypass>>) -> Self {
        Self { members }
    }

    /// Collapse a list into a single optional bypass.
    pub fn combine(mut members: Vec<Arc<dyn Bypass>>) -> Option<Arc<dyn Bypass>> {
        match members.len() {
            0 => None,
            1 => members.pop(),
            _ => Some(Arc::new(BypassGroup::new(members))),
        }
    }
}

impl Bypass for BypassGroup {
    fn contains(&self, query: &BypassQuery<'_>) -> bool {
        self.members.iter().any(|member| member.contains(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bypass(patterns: &[&str], whitelist: bool) -> MatcherBypass {
        MatcherBypass::new("test", AddrMatcher::new(patterns).unwrap(), whitelist)
    }

    #[test]
    fn test_blacklist_mode() {
        let bp = bypass(&["10.0.0.0/8", ".internal"], false);
        assert!(bp.contains(&BypassQuery::new("tcp", "10.1.2.3:443")));
        assert!(bp.contains(&BypassQuery::new("tcp", "db.internal:5432")));
        assert!(!bp.contains(&BypassQuery::new("tcp", "example.com:443")));
    }

    #[test]
    fn test_whitelist_mode_inverts() {
        let bp = bypass(&["example.com"], true);
        assert!(!bp.contains(&BypassQuery::new("tcp", "example.com:443")));
        assert!(bp.contains(&BypassQuery::new("tcp", "other.org:443")));
    }

    #[test]
    fn test_empty_address_never_bypassed() {
        let bp = bypass(&["*"], true);
        assert!(!bp.contains(&BypassQuery::new("tcp", "")));
    }

    #[test]
    fn test_host_hint_is_checked() {
        let bp = bypass(&["example.com"], false);
        let query = BypassQuery::new("tcp", "93.184.216.34:443").with_host("example.com:443");
        assert!(bp.contains(&query));
    }

    #[test]
    fn test_group_any() {
        let group = BypassGroup::combine(vec![
            Arc::new(bypass(&["a.test"], false)),
            Arc::new(bypass(&["b.test"], false)),
        ])
        .unwrap();
        assert!(group.contains(&BypassQuery::new("tcp", "b.test:1")));
        assert!(!group.contains(&BypassQuery::new("tcp", "c.test:1")));
        assert!(BypassGroup::combine(vec![]).is_none());
    }
}
