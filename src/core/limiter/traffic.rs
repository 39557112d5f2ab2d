//! Byte-rate limiting for relayed traffic.
//!
//! Each direction is a keyed `governor` bucket where one cell is one byte and
//! the burst equals the per-second rate. A relay asks for a budget when the
//! route is established and debits it as bytes move; chunks larger than the
//! burst are debited piecewise.
use std::{num::NonZeroU32, sync::Arc};

use governor::{Quota, RateLimiter as Governor};
use tokio_util::sync::CancellationToken;

use super::{LimitContext, ScopeKey, rate::KeyedRateLimiterImpl, scope_key};
use crate::{
    config::models::{LimitBy, MissingKeyPolicy, TrafficLimiterConfig},
    core::error::{ForwardError, ForwardResult},
};

/// Flow direction as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Input,
    /// Upstream to client
    Output,
}

struct Bucket {
    limiter: KeyedRateLimiterImpl,
    burst: NonZeroU32,
}

impl Bucket {
    fn new(bytes_per_second: u64) -> Result<Self, String> {
        let rate = u32::try_from(bytes_per_second)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| format!("traffic rate {bytes_per_second} must be between 1 and u32::MAX"))?;
        Ok(Self {
            limiter: Governor::keyed(Quota::per_second(rate)),
            burst: rate,
        })
    }
}

pub struct TrafficLimiter {
    name: String,
    by: LimitBy,
    on_missing_key: MissingKeyPolicy,
    input: Option<Bucket>,
    output: Option<Bucket>,
}

impl TrafficLimiter {
    pub fn new(config: &TrafficLimiterConfig) -> Result<Self, String> {
        let bucket = |rate: Option<u64>| {
            rate.map(Bucket::new)
                .transpose()
                .map_err(|e| format!("traffic limiter {}: {e}", config.name))
        };
        let input = bucket(config.input)?;
        let output = bucket(config.output)?;
        if input.is_none() && output.is_none() {
            return Err(format!(
                "traffic limiter {}: at least one of 'input' or 'output' is required",
                config.name
            ));
        }

        tracing::info!(
            "Creating traffic limiter: name={}, by={:?}, input={:?}, output={:?}",
            config.name,
            config.by,
            config.input,
            config.output
        );

        Ok(Self {
            name: config.name.clone(),
            by: config.by,
            on_missing_key: config.on_missing_key,
            input,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forget keys whose buckets are full again.
    pub fn retain_recent(&self) {
        for bucket in [&self.input, &self.output].into_iter().flatten() {
            bucket.limiter.retain_recent();
            bucket.limiter.shrink_to_fit();
        }
    }

    /// Keys holding state in either direction (approximate under concurrency).
    pub fn tracked_keys(&self) -> usize {
        [&self.input, &self.output]
            .into_iter()
            .flatten()
            .map(|bucket| bucket.limiter.len())
            .max()
            .unwrap_or(0)
    }

    fn bucket(&self, direction: Direction) -> Option<&Bucket> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }

    /// Bind the limiter to the context's key for the lifetime of a relay.
    ///
    /// `Ok(None)` means the key is missing and the policy lets traffic flow
    /// unthrottled.
    pub fn budget(self: &Arc<Self>, ctx: &LimitContext<'_>) -> ForwardResult<Option<TrafficBudget>> {
        match scope_key(self.by, self.on_missing_key, ctx) {
            ScopeKey::Key(key) => Ok(Some(TrafficBudget {
                limiter: Arc::clone(self),
                key,
            })),
            ScopeKey::Skip => Ok(None),
            ScopeKey::Reject => Err(ForwardError::LimiterRejected {
                limiter: self.name.clone(),
                key: "<missing>".to_string(),
            }),
        }
    }
}

/// A traffic limiter bound to one scope key.
#[derive(Clone)]
pub struct TrafficBudget {
    limiter: Arc<TrafficLimiter>,
    key: String,
}

impl TrafficBudget {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Largest chunk a single debit can cover in `direction`.
    pub fn max_chunk(&self, direction: Direction) -> Option<usize> {
        self.limiter
            .bucket(direction)
            .map(|bucket| bucket.burst.get() as usize)
    }

    /// Wait until `bytes` may pass in `direction`.
    pub async fn consume(
        &self,
        direction: Direction,
        bytes: usize,
        cancel: &CancellationToken,
    ) -> ForwardResult<()> {
        let Some(bucket) = self.limiter.bucket(direction) else {
            return Ok(());
        };

        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(bucket.burst.get() as usize);
            // step is in 1..=burst, so it fits a NonZeroU32
            let Some(cells) = u32::try_from(step).ok().and_then(NonZeroU32::new) else {
                break;
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
                ready = bucket.limiter.until_key_n_ready(&self.key, cells) => {
                    ready.map_err(|_| ForwardError::LimiterRejected {
                        limiter: self.limiter.name.clone(),
                        key: self.key.clone(),
                    })?;
                }
            }
            remaining -= step;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TrafficBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficBudget")
            .field("limiter", &self.limiter.name)
            .field("key", &self.key)
            .finish()
    }
}
