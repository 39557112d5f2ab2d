//! Admission control: may this client proceed at all?
use std::{collections::HashSet, net::SocketAddr};

use crate::{config::models::AdmissionConfig, core::matcher::AddrMatcher};

/// What an admission controller gets to look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionRequest<'a> {
    pub client: Option<SocketAddr>,
    pub identity: Option<&'a str>,
}

/// Policy gate evaluated before a connection (or node attempt) proceeds.
///
/// A `false` answer is a normal outcome that the caller turns into a closed
/// connection, not an error.
pub trait Admission: Send + Sync + 'static {
    fn admit(&self, request: &AdmissionRequest<'_>) -> bool;
}

/// Admission by client address patterns and identity allow-list.
#[derive(Debug)]
pub struct MatcherAdmission {
    name: String,
    matcher: AddrMatcher,
    whitelist: bool,
    identities: HashSet<String>,
}

impl MatcherAdmission {
    pub fn new(
        name: impl Into<String>,
        matcher: AddrMatcher,
        whitelist: bool,
        identities: HashSet<String>,
    ) -> Self {
        Self {
            name: name.into(),
            matcher,
            whitelist,
            identities,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Result<Self, String> {
        let matcher = AddrMatcher::new(&config.matchers)
            .map_err(|e| format!("admission {}: {e}", config.name))?;
        tracing::info!(
            "Creating admission: name={}, matchers={}, whitelist={}, identities={}",
            config.name,
            matcher.len(),
            config.whitelist,
            config.identities.len()
        );
        Ok(Self::new(
            config.name.clone(),
            matcher,
            config.whitelist,
            config.identities.iter().cloned().collect(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Admission for MatcherAdmission {
    fn admit(&self, request: &AdmissionRequest<'_>) -> bool {
        if !self.identities.is_empty() {
            let known = request
                .identity
                .is_some_and(|id| self.identities.contains(id));
            if !known {
                tracing::debug!(admission = %self.name, identity = ?request.identity, "identity not admitted");
                return false;
            }
        }

        let Some(client) = request.client else {
            return true;
        };
        if self.matcher.is_empty() {
            return true;
        }

        let matched = self.matcher.matches_ip(client.ip());
        let admitted = matched == self.whitelist;
        if !admitted {
            tracing::debug!(admission = %self.name, client = %client, "client not admitted");
        }
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(patterns: &[&str], whitelist: bool, ids: &[&str]) -> MatcherAdmission {
        MatcherAdmission::new(
            "adm",
            AddrMatcher::new(patterns).unwrap(),
            whitelist,
            ids.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn client(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_blacklist() {
        let adm = admission(&["192.168.0.0/16"], false, &[]);
        assert!(!adm.admit(&AdmissionRequest {
            client: client("192.168.1.10:5000"),
            identity: None
        }));
        assert!(adm.admit(&AdmissionRequest {
            client: client("10.0.0.1:5000"),
            identity: None
        }));
    }

    #[test]
    fn test_whitelist() {
        let adm = admission(&["127.0.0.1", "::1"], true, &[]);
        assert!(adm.admit(&AdmissionRequest {
            client: client("127.0.0.1:4000"),
            identity: None
        }));
        assert!(!adm.admit(&AdmissionRequest {
            client: client("10.0.0.1:4000"),
            identity: None
        }));
    }

    #[test]
    fn test_missing_client_is_admitted() {
        let adm = admission(&["127.0.0.1"], true, &[]);
        assert!(adm.admit(&AdmissionRequest::default()));
    }

    #[test]
    fn test_identity_allow_list() {
        let adm = admission(&[], false, &["alice"]);
        assert!(adm.admit(&AdmissionRequest {
            client: None,
            identity: Some("alice")
        }));
        assert!(!adm.admit(&AdmissionRequest {
            client: None,
            identity: Some("bob")
        }));
        assert!(!adm.admit(&AdmissionRequest::default()));
    }
}
