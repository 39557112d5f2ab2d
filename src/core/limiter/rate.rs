//! Request-rate limiting built atop `governor`.
//!
//! One keyed GCRA limiter per configured entry. `requests` per `period` maps
//! onto a replenish interval of `period / requests` with a burst of
//! `requests`, so a fresh key can spend its whole allowance at once.
use std::num::NonZeroU32;

use governor::{Quota, RateLimiter as Governor, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use tokio_util::sync::CancellationToken;

use super::{LimitContext, ScopeKey, scope_key};
use crate::{
    config::models::{LimitBy, MissingKeyPolicy, RateLimiterConfig},
    core::error::{ForwardError, ForwardResult},
};

pub type KeyedRateLimiterImpl = Governor<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct RateLimiter {
    name: String,
    by: LimitBy,
    wait: bool,
    on_missing_key: MissingKeyPolicy,
    limiter: KeyedRateLimiterImpl,
}

impl RateLimiter {
    /// Build a limiter from a `RateLimiterConfig` definition.
    pub fn new(config: &RateLimiterConfig) -> Result<Self, String> {
        let period = humantime::parse_duration(&config.period)
            .map_err(|e| format!("Invalid period string '{}': {e}", config.period))?;

        let requests = u32::try_from(config.requests)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| "Rate limit 'requests' must be between 1 and u32::MAX".to_string())?;

        let quota = Quota::with_period(period / requests.get())
            .ok_or_else(|| format!("Invalid period duration: {period:?}"))?
            .allow_burst(requests);

        tracing::info!(
            "Creating rate limiter: name={}, by={:?}, requests={}, period={:?}, wait={}",
            config.name,
            config.by,
            requests,
            period,
            config.wait
        );

        Ok(Self {
            name: config.name.clone(),
            by: config.by,
            wait: config.wait,
            on_missing_key: config.on_missing_key,
            limiter: Governor::keyed(quota),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn rejected(&self, key: impl Into<String>) -> ForwardError {
        ForwardError::LimiterRejected {
            limiter: self.name.clone(),
            key: key.into(),
        }
    }

    /// Non-blocking check; consumes one cell when allowed.
    pub fn allow(&self, ctx: &LimitContext<'_>) -> bool {
        match scope_key(self.by, self.on_missing_key, ctx) {
            ScopeKey::Key(key) => self.limiter.check_key(&key).is_ok(),
            ScopeKey::Skip => true,
            ScopeKey::Reject => false,
        }
    }

    /// Block until the key has capacity or `cancel` fires.
    pub async fn wait(&self, ctx: &LimitContext<'_>, cancel: &CancellationToken) -> ForwardResult<()> {
        let key = match scope_key(self.by, self.on_missing_key, ctx) {
            ScopeKey::Key(key) => key,
            ScopeKey::Skip => return Ok(()),
            ScopeKey::Reject => return Err(self.rejected("<missing>")),
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            _ = self.limiter.until_key_ready(&key) => Ok(()),
        }
    }

    /// Apply the limiter in its configured mode.
    pub async fn acquire(&self, ctx: &LimitContext<'_>, cancel: &CancellationToken) -> ForwardResult<()> {
        if self.wait {
            return self.wait(ctx, cancel).await;
        }
        if self.allow(ctx) {
            Ok(())
        } else {
            tracing::debug!(limiter = %self.name, "rate limit exceeded");
            Err(self.rejected(describe(self.by, ctx)))
        }
    }

    /// Forget keys whose state is back to fresh, then release the memory.
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Keys currently holding rate state (approximate under concurrency).
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}

pub(crate) fn describe(by: LimitBy, ctx: &LimitContext<'_>) -> String {
    match scope_key(by, MissingKeyPolicy::Allow, ctx) {
        ScopeKey::Key(key) => key,
        _ => "<missing>".to_string(),
    }
}
