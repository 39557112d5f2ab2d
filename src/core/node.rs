//! A single candidate endpoint of a hop.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    core::{
        admission::{Admission, AdmissionRequest},
        bypass::{Bypass, BypassQuery},
        hosts::HostMapper,
        limiter::LimiterSet,
        resolver::Resolver,
    },
    metrics::set_node_health_status,
    ports::Connector,
};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Failure marker of a node.
///
/// Both fields are plain atomics so that concurrent routes can mark the same
/// node without coordination. A success clears the streak.
#[derive(Debug, Default)]
pub struct NodeHealth {
    consecutive_failures: AtomicU32,
    /// Unix time of the latest failure in milliseconds
    last_failure_ms: AtomicU64,
}

impl NodeHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt; returns the new failure streak.
    pub fn mark_failed(&self) -> u32 {
        self.last_failure_ms.store(now_millis(), Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a successful attempt.
    pub fn mark_ok(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Whether the node may be selected: fewer than `max_fails` failures in a
    /// row, or the latest failure is older than `fail_timeout`.
    pub fn is_available(&self, max_fails: u32, fail_timeout: Duration) -> bool {
        if max_fails == 0 || self.failures() < max_fails {
            return true;
        }
        let last = self.last_failure_ms.load(Ordering::Acquire);
        now_millis().saturating_sub(last) >= fail_timeout.as_millis() as u64
    }
}

/// One candidate endpoint and the policies attached to it.
///
/// Everything but `health` is fixed once the node is built.
pub struct Node {
    name: String,
    addr: String,
    connector: Arc<dyn Connector>,
    bypass: Option<Arc<dyn Bypass>>,
    admission: Option<Arc<dyn Admission>>,
    resolver: Option<Arc<dyn Resolver>>,
    hosts: Option<Arc<dyn HostMapper>>,
    limiters: LimiterSet,
    weight: u32,
    health: NodeHealth,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            connector,
            bypass: None,
            admission: None,
            resolver: None,
            hosts: None,
            limiters: LimiterSet::default(),
            weight: 1,
            health: NodeHealth::new(),
        }
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_admission(mut self, admission: Option<Arc<dyn Admission>>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<dyn Resolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_hosts(mut self, hosts: Option<Arc<dyn HostMapper>>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_limiters(mut self, limiters: LimiterSet) -> Self {
        self.limiters = limiters;
        self
    }

    /// Selection weight; zero is raised to one.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn resolver(&self) -> Option<&dyn Resolver> {
        self.resolver.as_deref()
    }

    pub fn hosts(&self) -> Option<&dyn HostMapper> {
        self.hosts.as_deref()
    }

    pub fn limiters(&self) -> &LimiterSet {
        &self.limiters
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health(&self) -> &NodeHealth {
        &self.health
    }

    /// Whether the node's own bypass excludes it for this destination.
    pub fn bypasses(&self, query: &BypassQuery<'_>) -> bool {
        self.bypass.as_ref().is_some_and(|b| b.contains(query))
    }

    /// Admission verdict for this node; a node without admission admits all.
    pub fn admits(&self, request: &AdmissionRequest<'_>) -> bool {
        self.admission.as_ref().is_none_or(|a| a.admit(request))
    }

    pub fn mark_failed(&self) {
        let failures = self.health.mark_failed();
        set_node_health_status(&self.name, false);
        tracing::debug!(node = %self.name, failures, "node marked failed");
    }

    pub fn mark_ok(&self) {
        if self.health.failures() > 0 {
            tracing::debug!(node = %self.name, "node recovered");
        }
        self.health.mark_ok();
        set_node_health_status(&self.name, true);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("connector", &self.connector.kind())
            .field("weight", &self.weight)
            .field("failures", &self.health.failures())
            .finish()
    }
}
