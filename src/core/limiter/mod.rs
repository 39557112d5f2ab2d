//! Rate, connection and traffic limiters and their composition.
//!
//! Limiters are shared between every connection task that references them.
//! A [`LimiterSet`] applies several of them conjunctively: the connection
//! proceeds only if each one grants it. Connection permits are RAII guards,
//! so whatever was granted before a later limiter refuses is released when
//! the partial [`Grant`] is dropped.
use std::{net::IpAddr, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    config::models::{LimitBy, MissingKeyPolicy},
    core::error::{ForwardError, ForwardResult},
};

pub mod conn;
pub mod rate;
pub mod traffic;

pub use conn::{ConnLimiter, ConnPermit};
pub use rate::RateLimiter;
pub use traffic::{Direction, TrafficBudget, TrafficLimiter};

/// Key used by limiters scoped `global`
pub const GLOBAL_KEY: &str = "*";

/// Facts a limiter can derive its scope key from.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitContext<'a> {
    pub client: Option<IpAddr>,
    pub identity: Option<&'a str>,
    pub node: Option<&'a str>,
}

impl<'a> LimitContext<'a> {
    /// Same context, scoped to a node
    pub fn for_node(&self, node: &'a str) -> Self {
        Self {
            node: Some(node),
            ..*self
        }
    }
}

/// Outcome of deriving a key for a limiter.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScopeKey {
    /// Apply the limiter under this key
    Key(String),
    /// The key is missing and the policy lets the connection through unlimited
    Skip,
    /// The key is missing and the policy rejects
    Reject,
}

pub(crate) fn scope_key(by: LimitBy, policy: MissingKeyPolicy, ctx: &LimitContext<'_>) -> ScopeKey {
    let key = match by {
        LimitBy::Global => Some(GLOBAL_KEY.to_string()),
        LimitBy::Client => ctx.client.map(|ip| ip.to_string()),
        LimitBy::Identity => ctx.identity.map(str::to_string),
        LimitBy::Node => ctx.node.map(str::to_string),
    };
    match (key, policy) {
        (Some(key), _) => ScopeKey::Key(key),
        (None, MissingKeyPolicy::Allow) => ScopeKey::Skip,
        (None, MissingKeyPolicy::Deny) => ScopeKey::Reject,
    }
}

/// Everything a connection was granted by a limiter set.
///
/// Dropping the grant releases its connection permits exactly once.
#[derive(Default)]
pub struct Grant {
    permits: Vec<ConnPermit>,
    budgets: Vec<TrafficBudget>,
}

impl Grant {
    /// Absorb another grant; its permits are now released with this one.
    pub fn merge(&mut self, other: Grant) {
        self.permits.extend(other.permits);
        self.budgets.extend(other.budgets);
    }

    pub fn permits(&self) -> usize {
        self.permits.len()
    }

    pub fn budgets(&self) -> &[TrafficBudget] {
        &self.budgets
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty() && self.budgets.is_empty()
    }
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant")
            .field("permits", &self.permits.len())
            .field("budgets", &self.budgets.len())
            .finish()
    }
}

/// A conjunction of limiters applied at one gate (service or node).
#[derive(Clone, Default)]
pub struct LimiterSet {
    rate: Vec<Arc<RateLimiter>>,
    conn: Vec<Arc<ConnLimiter>>,
    traffic: Vec<Arc<TrafficLimiter>>,
}

impl LimiterSet {
    pub fn new(
        rate: Vec<Arc<RateLimiter>>,
        conn: Vec<Arc<ConnLimiter>>,
        traffic: Vec<Arc<TrafficLimiter>>,
    ) -> Self {
        Self {
            rate,
            conn,
            traffic,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rate.is_empty() && self.conn.is_empty() && self.traffic.is_empty()
    }

    /// Cheap check that no connection limiter is already at capacity.
    ///
    /// Nothing is acquired; a positive answer can still be followed by a
    /// rejection in [`LimiterSet::acquire`].
    pub async fn precheck(&self, ctx: &LimitContext<'_>) -> bool {
        for limiter in &self.conn {
            if limiter.is_exhausted(ctx).await {
                return false;
            }
        }
        true
    }

    /// Acquire every limiter or none.
    pub async fn acquire(
        &self,
        ctx: &LimitContext<'_>,
        cancel: &CancellationToken,
    ) -> ForwardResult<Grant> {
        let mut grant = Grant::default();

        for limiter in &self.rate {
            limiter.acquire(ctx, cancel).await?;
        }

        for limiter in &self.conn {
            match limiter.acquire(ctx).await {
                Some(permit) => grant.permits.push(permit),
                None => {
                    // `grant` is dropped on return, releasing earlier permits
                    return Err(ForwardError::LimiterRejected {
                        limiter: limiter.name().to_string(),
                        key: limiter.describe_key(ctx),
                    });
                }
            }
        }

        for limiter in &self.traffic {
            if let Some(budget) = limiter.budget(ctx)? {
                grant.budgets.push(budget);
            }
        }

        Ok(grant)
    }
}
