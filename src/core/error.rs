use std::{io, time::Duration};

use thiserror::Error;

/// Errors produced while resolving, gating and dialing a forward path.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    /// The address has no parseable host/port
    #[error("malformed address '{address}': {reason}")]
    MalformedAddress { address: String, reason: String },

    /// Resolution produced no usable address
    #[error("resolver: domain {0} does not exist")]
    DomainNotFound(String),

    /// A hop without any configured node was asked for one
    #[error("hop {0}: no available node")]
    NoAvailableNode(String),

    /// Every candidate node of a hop was tried or rejected
    #[error("hop {hop}: all nodes exhausted after {attempts} attempt(s)")]
    HopExhausted { hop: String, attempts: usize },

    /// An admission controller refused the connection
    #[error("admission denied by {0}")]
    AdmissionDenied(String),

    /// A limiter refused the connection
    #[error("limiter {limiter} rejected key {key}")]
    LimiterRejected { limiter: String, key: String },

    /// The transport connect or the hop handshake failed
    #[error("dial {address} failed: {source}")]
    DialFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The destination matched an ingress bypass rule
    #[error("destination {0} is bypassed")]
    Bypassed(String),

    /// The connection was cancelled (peer gone or shutdown)
    #[error("operation cancelled")]
    Cancelled,

    /// A step exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The node's protocol cannot carry this network
    #[error("node {node} cannot carry {network}")]
    UnsupportedNetwork { node: String, network: String },
}

impl ForwardError {
    pub fn malformed(address: &str, reason: impl Into<String>) -> Self {
        ForwardError::MalformedAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn dial(address: &str, source: io::Error) -> Self {
        ForwardError::DialFailed {
            address: address.to_string(),
            source,
        }
    }

    /// Failures that only disqualify the current node; the route builder moves
    /// on to the next candidate of the same hop. Only the subset reported by
    /// [`ForwardError::is_transport_failure`] counts against node health.
    pub fn is_node_recoverable(&self) -> bool {
        matches!(
            self,
            ForwardError::DomainNotFound(_)
                | ForwardError::AdmissionDenied(_)
                | ForwardError::LimiterRejected { .. }
                | ForwardError::DialFailed { .. }
                | ForwardError::Timeout(_)
                | ForwardError::UnsupportedNetwork { .. }
        )
    }

    /// The node could not be reached or did not answer in time.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ForwardError::DomainNotFound(_) | ForwardError::DialFailed { .. } | ForwardError::Timeout(_)
        )
    }

    /// Policy refusals are expected backpressure and are not logged as errors.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            ForwardError::AdmissionDenied(_)
                | ForwardError::LimiterRejected { .. }
                | ForwardError::Bypassed(_)
        )
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::MalformedAddress { .. } => "malformed_address",
            ForwardError::DomainNotFound(_) => "domain_not_found",
            ForwardError::NoAvailableNode(_) => "no_available_node",
            ForwardError::HopExhausted { .. } => "hop_exhausted",
            ForwardError::AdmissionDenied(_) => "admission_denied",
            ForwardError::LimiterRejected { .. } => "limiter_rejected",
            ForwardError::DialFailed { .. } => "dial_failed",
            ForwardError::Bypassed(_) => "bypassed",
            ForwardError::Cancelled => "cancelled",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::UnsupportedNetwork { .. } => "unsupported_network",
        }
    }
}

/// Result type for forwarding operations
pub type ForwardResult<T> = Result<T, ForwardError>;

/// Errors a resolver implementation can report.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResolveError {
    /// The query is outside this resolver's domain; callers pass the address through.
    #[error("resolver: invalid query")]
    Invalid,

    /// The lookup reported a problem but still produced addresses
    #[error("resolver: partial result for {host}: {reason}")]
    Partial {
        host: String,
        addrs: Vec<std::net::IpAddr>,
        reason: String,
    },

    /// The lookup failed outright
    #[error("resolver: lookup {host} failed: {reason}")]
    Lookup { host: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_recoverable_classification() {
        assert!(ForwardError::DomainNotFound("a.test".into()).is_node_recoverable());
        assert!(ForwardError::AdmissionDenied("adm".into()).is_node_recoverable());
        assert!(
            ForwardError::dial("1.2.3.4:80", io::Error::from(io::ErrorKind::ConnectionRefused))
                .is_node_recoverable()
        );
        assert!(!ForwardError::Cancelled.is_node_recoverable());
        assert!(!ForwardError::malformed("x", "missing port").is_node_recoverable());
        assert!(
            !ForwardError::HopExhausted {
                hop: "h".into(),
                attempts: 2
            }
            .is_node_recoverable()
        );
    }

    #[test]
    fn test_refusals_are_not_transport_failures() {
        assert!(ForwardError::Timeout(Duration::from_secs(1)).is_transport_failure());
        assert!(ForwardError::DomainNotFound("a.test".into()).is_transport_failure());
        assert!(!ForwardError::AdmissionDenied("adm".into()).is_transport_failure());
        let rejected = ForwardError::LimiterRejected {
            limiter: "r".into(),
            key: "10.0.0.1".into(),
        };
        assert!(rejected.is_node_recoverable());
        assert!(!rejected.is_transport_failure());

        let unsupported = ForwardError::UnsupportedNetwork {
            node: "proxy".into(),
            network: "udp".into(),
        };
        assert!(unsupported.is_node_recoverable());
        assert!(!unsupported.is_transport_failure());
        assert_eq!(unsupported.kind(), "unsupported_network");
    }

    #[test]
    fn test_domain_not_found_names_host() {
        let err = ForwardError::DomainNotFound("missing.example".into());
        assert_eq!(
            err.to_string(),
            "resolver: domain missing.example does not exist"
        );
    }
}
