//! Node selection strategies and the health filter in front of them.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::Rng;

use crate::{
    config::models::{SelectStrategy, SelectorConfig},
    core::node::Node,
};

/// Trait defining the interface for node selection strategies
pub trait SelectionStrategy: Send + Sync + 'static {
    /// Pick one of `nodes`; `None` only when the slice is empty.
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>>;

    fn boxed(self) -> Box<dyn SelectionStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Declared order: the first candidate, i.e. plain failover
#[derive(Debug, Default)]
pub struct OrderedStrategy;

impl SelectionStrategy for OrderedStrategy {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        nodes.first().cloned()
    }
}

/// Round-robin selection strategy
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(nodes[count % nodes.len()].clone())
    }
}

/// Random selection weighted by node weight
#[derive(Debug, Default)]
pub struct WeightedRandomStrategy;

impl SelectionStrategy for WeightedRandomStrategy {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        let total: u64 = nodes.iter().map(|n| u64::from(n.weight())).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::rng().random_range(0..total);
        for node in nodes {
            let weight = u64::from(node.weight());
            if pick < weight {
                return Some(node.clone());
            }
            pick -= weight;
        }
        nodes.last().cloned()
    }
}

/// Fewest consecutive failures first; declared order breaks ties
#[derive(Debug, Default)]
pub struct LeastFailuresStrategy;

impl SelectionStrategy for LeastFailuresStrategy {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        nodes
            .iter()
            .min_by_key(|node| node.health().failures())
            .cloned()
    }
}

/// Health filter plus strategy, as configured on a hop.
pub struct Selector {
    strategy: Box<dyn SelectionStrategy>,
    max_fails: u32,
    fail_timeout: Duration,
}

impl Selector {
    pub fn new(strategy: Box<dyn SelectionStrategy>, max_fails: u32, fail_timeout: Duration) -> Self {
        Self {
            strategy,
            max_fails,
            fail_timeout,
        }
    }

    /// Select among `candidates`, skipping nodes marked failed.
    ///
    /// When every candidate is marked failed the filter is ignored so that a
    /// hop never refuses outright just because all of its nodes had trouble.
    pub fn select(&self, candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
        let healthy: Vec<Arc<Node>> = candidates
            .iter()
            .filter(|node| node.health().is_available(self.max_fails, self.fail_timeout))
            .cloned()
            .collect();

        if healthy.is_empty() {
            if !candidates.is_empty() {
                tracing::debug!("all {} candidate node(s) marked failed, ignoring health", candidates.len());
            }
            self.strategy.select(candidates)
        } else {
            self.strategy.select(&healthy)
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(RoundRobinStrategy::new().boxed(), 1, Duration::from_secs(10))
    }
}

/// Factory for creating selectors from configuration
pub struct SelectorFactory;

impl SelectorFactory {
    pub fn create_strategy(strategy: &SelectStrategy) -> Box<dyn SelectionStrategy> {
        match strategy {
            SelectStrategy::Ordered => OrderedStrategy.boxed(),
            SelectStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            SelectStrategy::Random => WeightedRandomStrategy.boxed(),
            SelectStrategy::Health => LeastFailuresStrategy.boxed(),
        }
    }

    pub fn create(config: &SelectorConfig) -> Result<Selector, String> {
        let fail_timeout = humantime::parse_duration(&config.fail_timeout)
            .map_err(|e| format!("Invalid fail_timeout '{}': {e}", config.fail_timeout))?;
        Ok(Selector::new(
            Self::create_strategy(&config.strategy),
            config.max_fails,
            fail_timeout,
        ))
    }
}
