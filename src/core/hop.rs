//! A forwarding stage: a named group of interchangeable nodes.
use std::{collections::HashSet, sync::Arc};

use crate::core::{
    bypass::{Bypass, BypassQuery},
    error::{ForwardError, ForwardResult},
    hosts::HostMapper,
    limiter::LimitContext,
    node::Node,
    resolver::Resolver,
    selector::Selector,
};

/// Outcome of asking a hop for a node.
#[derive(Debug)]
pub enum Selection {
    /// Try this node next
    Node(Arc<Node>),
    /// The destination bypasses this hop; the route ends before it
    Bypassed,
    /// No eligible node is left
    Exhausted,
}

pub struct Hop {
    name: String,
    nodes: Vec<Arc<Node>>,
    selector: Selector,
    bypass: Option<Arc<dyn Bypass>>,
    resolver: Option<Arc<dyn Resolver>>,
    hosts: Option<Arc<dyn HostMapper>>,
}

impl Hop {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node>>, selector: Selector) -> Self {
        Self {
            name: name.into(),
            nodes,
            selector,
            bypass: None,
            resolver: None,
            hosts: None,
        }
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Resolver for a node address: the node's own, else the hop's.
    pub fn resolver_for<'a>(&'a self, node: &'a Node) -> Option<&'a dyn Resolver> {
        node.resolver().or(self.resolver.as_deref())
    }

    /// Host mapper for a node address: the node's own, else the hop's.
    pub fn hosts_for<'a>(&'a self, node: &'a Node) -> Option<&'a dyn HostMapper> {
        node.hosts().or(self.hosts.as_deref())
    }

    /// Pick the next node to try for `query`, excluding nodes in `tried`.
    ///
    /// Candidates are the untried nodes that do not bypass the destination
    /// and pass their limiter precheck; the selector's health filter and
    /// strategy choose among them. Nothing is dialed or acquired here.
    pub async fn select_node(
        &self,
        query: &BypassQuery<'_>,
        ctx: &LimitContext<'_>,
        tried: &HashSet<String>,
    ) -> ForwardResult<Selection> {
        if self.nodes.is_empty() {
            return Err(ForwardError::NoAvailableNode(self.name.clone()));
        }

        if self.bypass.as_ref().is_some_and(|b| b.contains(query)) {
            tracing::debug!(hop = %self.name, addr = query.addr, "hop bypassed");
            return Ok(Selection::Bypassed);
        }

        let untried: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|node| !tried.contains(node.name()))
            .collect();
        if untried.is_empty() {
            return Ok(Selection::Exhausted);
        }

        let reachable: Vec<&Arc<Node>> = untried
            .into_iter()
            .filter(|node| !node.bypasses(query))
            .collect();
        if reachable.is_empty() {
            if tried.is_empty() {
                tracing::debug!(hop = %self.name, addr = query.addr, "every node bypassed");
                return Ok(Selection::Bypassed);
            }
            return Ok(Selection::Exhausted);
        }

        let mut candidates = Vec::with_capacity(reachable.len());
        for node in reachable {
            if node.limiters().precheck(&ctx.for_node(node.name())).await {
                candidates.push(node.clone());
            } else {
                tracing::debug!(hop = %self.name, node = %node.name(), "node at connection capacity");
            }
        }

        Ok(self
            .selector
            .select(&candidates)
            .map(Selection::Node)
            .unwrap_or(Selection::Exhausted))
    }
}

impl std::fmt::Debug for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hop")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
