//! Chains of hops and the per-connection routes walked through them.
use std::sync::Arc;

use crate::core::{hop::Hop, node::Node};

/// An ordered sequence of hops. No hops means a direct connection.
#[derive(Debug)]
pub struct Chain {
    name: String,
    hops: Vec<Arc<Hop>>,
}

impl Chain {
    pub fn new(name: impl Into<String>, hops: Vec<Arc<Hop>>) -> Self {
        Self {
            name: name.into(),
            hops,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hops(&self) -> &[Arc<Hop>] {
        &self.hops
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// A node chosen for one hop of a route, with the address it was dialed at.
#[derive(Debug, Clone)]
pub struct RouteNode {
    pub hop: String,
    pub node: Arc<Node>,
    /// Node address after resolution
    pub addr: String,
}

/// Per-connection instantiation of a chain; never shared.
#[derive(Debug, Clone, Default)]
pub struct Route {
    chain: Option<String>,
    nodes: Vec<RouteNode>,
    /// Set when a bypass ended the route before the chain's last hop
    truncated: bool,
}

impl Route {
    pub fn new(chain: Option<&str>) -> Self {
        Self {
            chain: chain.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn chain(&self) -> Option<&str> {
        self.chain.as_deref()
    }

    pub fn nodes(&self) -> &[RouteNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn push(&mut self, node: RouteNode) {
        self.nodes.push(node);
    }

    pub(crate) fn truncate_here(&mut self) {
        self.truncated = true;
    }

    /// The last established node, whose connector reaches the destination.
    pub fn last(&self) -> Option<&RouteNode> {
        self.nodes.last()
    }

    /// `a -> b -> c` for logs
    pub fn path(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.node.name())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
