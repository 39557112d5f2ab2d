//! Concurrent connection limiting.
//!
//! Counters live in an `scc::HashMap` keyed by scope. A counter is only
//! changed under its entry lock, and the entry is removed when its last
//! permit is released, so the map holds just the keys in use.
use std::sync::Arc;

use scc::HashMap as SccHashMap;

use super::{LimitContext, ScopeKey, rate::describe, scope_key};
use crate::config::models::{ConnLimiterConfig, LimitBy, MissingKeyPolicy};

type Counters = Arc<SccHashMap<String, usize>>;

pub struct ConnLimiter {
    name: String,
    by: LimitBy,
    limit: usize,
    on_missing_key: MissingKeyPolicy,
    counters: Counters,
}

/// One held connection slot. Dropping it gives the slot back.
#[derive(Debug)]
pub struct ConnPermit {
    slot: Option<(Counters, String)>,
}

impl ConnPermit {
    /// A permit that holds nothing (missing key allowed through)
    fn unlimited() -> Self {
        Self { slot: None }
    }
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        if let Some((counters, key)) = self.slot.take() {
            counters.remove_if_sync(&key, |count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
        }
    }
}

impl ConnLimiter {
    pub fn new(config: &ConnLimiterConfig) -> Result<Self, String> {
        if config.limit == 0 {
            return Err(format!(
                "connection limiter {}: 'limit' must be greater than 0",
                config.name
            ));
        }
        tracing::info!(
            "Creating connection limiter: name={}, by={:?}, limit={}",
            config.name,
            config.by,
            config.limit
        );
        Ok(Self {
            name: config.name.clone(),
            by: config.by,
            limit: config.limit,
            on_missing_key: config.on_missing_key,
            counters: Arc::new(SccHashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn describe_key(&self, ctx: &LimitContext<'_>) -> String {
        describe(self.by, ctx)
    }

    /// Take a slot, or `None` when the key is at capacity.
    pub async fn acquire(&self, ctx: &LimitContext<'_>) -> Option<ConnPermit> {
        let key = match scope_key(self.by, self.on_missing_key, ctx) {
            ScopeKey::Key(key) => key,
            ScopeKey::Skip => return Some(ConnPermit::unlimited()),
            ScopeKey::Reject => return None,
        };

        let mut entry = self.counters.entry_async(key.clone()).await.or_insert(0);
        let current = *entry.get();
        if current >= self.limit {
            tracing::debug!(limiter = %self.name, current, limit = self.limit, "connection limit reached");
            return None;
        }
        *entry.get_mut() = current + 1;
        drop(entry);

        Some(ConnPermit {
            slot: Some((self.counters.clone(), key)),
        })
    }

    /// Slots currently held for the context's key.
    pub async fn in_use(&self, ctx: &LimitContext<'_>) -> usize {
        let ScopeKey::Key(key) = scope_key(self.by, self.on_missing_key, ctx) else {
            return 0;
        };
        self.counters
            .read_async(&key, |_, count| *count)
            .await
            .unwrap_or(0)
    }

    /// Number of scope keys with at least one slot held.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    /// Whether an `acquire` for this context would be refused right now.
    pub async fn is_exhausted(&self, ctx: &LimitContext<'_>) -> bool {
        match scope_key(self.by, self.on_missing_key, ctx) {
            ScopeKey::Key(_) => self.in_use(ctx).await >= self.limit,
            ScopeKey::Skip => false,
            ScopeKey::Reject => true,
        }
    }
}
