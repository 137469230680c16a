//! Per account/region rate limiting
//!
//! Limiters and concurrency slots live in registries scoped to one run and
//! handed to workers explicitly. A scope's limiter is only ever fed by fetch
//! responses from that same scope.

use crate::models::ScopeKey;
use crate::retry::MAX_RETRY_HINT;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until one request may be sent
    async fn acquire(&self);

    /// The upstream throttled a request from this scope
    async fn on_throttled(&self, retry_after: Option<Duration>);

    async fn on_success(&self);
}

/// Limiter that never waits, for tests and unthrottled upstreams
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn acquire(&self) {}
    async fn on_throttled(&self, _retry_after: Option<Duration>) {}
    async fn on_success(&self) {}
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Steady-state request rate. Zero disables limiting.
    pub requests_per_second: f64,
    /// Tokens available up front
    pub burst: u32,
    /// Floor the adaptive rate never drops below
    pub min_rate: f64,
    /// Pause after a throttle that came without a retry hint
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 10,
            min_rate: 0.5,
            cooldown: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
    paused_until: Option<Instant>,
}

/// Token bucket with additive-increase / multiplicative-decrease on the rate
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let state = BucketState {
            tokens: f64::from(config.burst.max(1)),
            rate: config.requests_per_second,
            last_refill: Instant::now(),
            paused_until: None,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    fn unlimited(&self) -> bool {
        self.config.requests_per_second <= 0.0
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.burst.max(1))
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self) {
        if self.unlimited() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                match state.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        state.paused_until = None;
                        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                        state.tokens = (state.tokens + elapsed * state.rate).min(self.capacity());
                        state.last_refill = now;

                        if state.tokens >= 1.0 {
                            state.tokens -= 1.0;
                            return;
                        }
                        Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn on_throttled(&self, retry_after: Option<Duration>) {
        if self.unlimited() {
            return;
        }
        let mut state = self.state.lock().await;
        state.rate = (state.rate / 2.0).max(self.config.min_rate.max(0.01));
        state.tokens = 0.0;
        let pause = retry_after.unwrap_or(self.config.cooldown).min(MAX_RETRY_HINT);
        if let Some(until) = Instant::now().checked_add(pause) {
            state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
        }
        debug!(rate = state.rate, "Throttled, reducing request rate");
    }

    async fn on_success(&self) {
        if self.unlimited() {
            return;
        }
        let mut state = self.state.lock().await;
        let step = self.config.requests_per_second / 10.0;
        state.rate = (state.rate + step).min(self.config.requests_per_second);
    }
}

/// Builds the limiter for a scope the first time it is seen
pub type LimiterFactory = Arc<dyn Fn(&ScopeKey) -> Arc<dyn RateLimiter> + Send + Sync>;

/// Factory giving every scope its own token bucket
pub fn token_bucket_factory(config: RateLimitConfig) -> LimiterFactory {
    Arc::new(move |_scope: &ScopeKey| {
        Arc::new(TokenBucketLimiter::new(config.clone())) as Arc<dyn RateLimiter>
    })
}

/// One limiter per account/region, created lazily
pub struct LimiterRegistry {
    limiters: DashMap<ScopeKey, Arc<dyn RateLimiter>>,
    factory: LimiterFactory,
}

impl LimiterRegistry {
    pub fn new(factory: LimiterFactory) -> Self {
        Self {
            limiters: DashMap::new(),
            factory,
        }
    }

    /// Registry whose scopes each get a fresh token bucket
    pub fn token_buckets(config: RateLimitConfig) -> Self {
        Self::new(token_bucket_factory(config))
    }

    pub fn for_scope(&self, scope: &ScopeKey) -> Arc<dyn RateLimiter> {
        self.limiters
            .entry(scope.clone())
            .or_insert_with(|| (self.factory)(scope))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// Caps simultaneous in-flight fetches per account/region
pub struct ScopeSlots {
    permits: usize,
    slots: DashMap<ScopeKey, Arc<Semaphore>>,
}

impl ScopeSlots {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            slots: DashMap::new(),
        }
    }

    pub fn semaphore(&self, scope: &ScopeKey) -> Arc<Semaphore> {
        self.slots
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
            .value()
            .clone()
    }

    pub async fn acquire(&self, scope: &ScopeKey) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore(scope).acquire_owned().await
    }
}
