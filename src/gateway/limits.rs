use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::{Clock, SystemClock};

/// Seconds over which an empty token budget refills completely.
pub const TOKEN_REFILL_WINDOW_SECS: f64 = 3600.0;
/// One request credit is granted per this many milliseconds.
pub const REQUEST_CREDIT_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_tokens: u64,
    pub max_requests: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50_000,
            max_requests: 60,
        }
    }
}

/// Continuous-refill token/request allowance for one API key.
///
/// Invariants: `0 <= tokens <= max_tokens` and `0 <= requests <= max_requests`. Every read
/// goes through [`KeyBudget::refill`] first, so checks never see a budget older than `now`.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyBudget {
    max_tokens: u64,
    max_requests: u64,
    tokens: f64,
    requests: u64,
    last_refill_ms: u64,
}

impl KeyBudget {
    pub fn full(limits: LimitsConfig, now_ms: u64) -> Self {
        Self {
            max_tokens: limits.max_tokens,
            max_requests: limits.max_requests,
            tokens: limits.max_tokens as f64,
            requests: limits.max_requests,
            last_refill_ms: now_ms,
        }
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Credits `Δt · max_tokens / 3600` tokens and `⌊Δt / 60⌋` requests, where `Δt` is the
    /// time since the previous refill. A clock that moves backwards credits nothing.
    pub fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let max_tokens = self.max_tokens as f64;
        let elapsed_secs = elapsed_ms as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * max_tokens / TOKEN_REFILL_WINDOW_SECS)
            .clamp(0.0, max_tokens);

        let credits = elapsed_ms / REQUEST_CREDIT_INTERVAL_MS;
        self.requests = self
            .requests
            .saturating_add(credits)
            .min(self.max_requests);

        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    pub fn try_consume_request(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.requests == 0 {
            return false;
        }
        self.requests -= 1;
        true
    }

    pub fn try_consume_tokens(&mut self, tokens: u64, now_ms: u64) -> bool {
        self.refill(now_ms);
        let tokens = tokens as f64;
        if self.tokens < tokens {
            return false;
        }
        self.tokens -= tokens;
        true
    }

    pub fn is_exhausted(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        self.tokens <= 0.0 || self.requests == 0
    }

    pub fn snapshot_headers(&mut self, now_ms: u64) -> RateLimitHeaders {
        self.refill(now_ms);

        let since_refill_secs = now_ms.saturating_sub(self.last_refill_ms) / 1000;
        let credit_secs = REQUEST_CREDIT_INTERVAL_MS / 1000;
        let reset_requests_secs = credit_secs - since_refill_secs % credit_secs;

        let reset_tokens_secs = if self.max_tokens == 0 {
            0
        } else {
            let missing = self.max_tokens as f64 - self.tokens;
            (missing * TOKEN_REFILL_WINDOW_SECS / self.max_tokens as f64)
                .ceil()
                .max(0.0) as u64
        };

        RateLimitHeaders {
            limit_requests: self.max_requests,
            limit_tokens: self.max_tokens,
            remaining_requests: self.requests,
            remaining_tokens: self.tokens.floor().max(0.0) as u64,
            reset_requests_secs,
            reset_tokens_secs,
        }
    }
}

/// The `x-ratelimit-*` values reported on every response that reached budget evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit_requests: u64,
    pub limit_tokens: u64,
    pub remaining_requests: u64,
    pub remaining_tokens: u64,
    pub reset_requests_secs: u64,
    pub reset_tokens_secs: u64,
}

impl RateLimitHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 6] {
        [
            ("x-ratelimit-limit-requests", self.limit_requests.to_string()),
            ("x-ratelimit-limit-tokens", self.limit_tokens.to_string()),
            (
                "x-ratelimit-remaining-requests",
                self.remaining_requests.to_string(),
            ),
            (
                "x-ratelimit-remaining-tokens",
                self.remaining_tokens.to_string(),
            ),
            (
                "x-ratelimit-reset-requests",
                format!("{}s", self.reset_requests_secs),
            ),
            (
                "x-ratelimit-reset-tokens",
                format!("{}s", self.reset_tokens_secs),
            ),
        ]
    }
}

/// Budget of a single key behind its own lock.
///
/// Each public method is one atomic refill-then-act unit; the lock is never held across an
/// `.await`, so requests on other keys are never blocked by this one.
pub struct KeyLimiter {
    budget: Mutex<KeyBudget>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for KeyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLimiter")
            .field("budget", &*self.lock())
            .finish()
    }
}

impl KeyLimiter {
    pub fn new(limits: LimitsConfig, clock: Arc<dyn Clock>) -> Self {
        let budget = KeyBudget::full(limits, clock.now_millis());
        Self {
            budget: Mutex::new(budget),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyBudget> {
        self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn refill(&self) {
        let now = self.clock.now_millis();
        self.lock().refill(now);
    }

    pub fn try_consume_request(&self) -> bool {
        let now = self.clock.now_millis();
        self.lock().try_consume_request(now)
    }

    pub fn try_consume_tokens(&self, tokens: u64) -> bool {
        let now = self.clock.now_millis();
        self.lock().try_consume_tokens(tokens, now)
    }

    pub fn is_exhausted(&self) -> bool {
        let now = self.clock.now_millis();
        self.lock().is_exhausted(now)
    }

    pub fn snapshot_headers(&self) -> RateLimitHeaders {
        let now = self.clock.now_millis();
        self.lock().snapshot_headers(now)
    }

    /// Refreshed copy of the budget.
    pub fn budget(&self) -> KeyBudget {
        let now = self.clock.now_millis();
        let mut budget = self.lock();
        budget.refill(now);
        budget.clone()
    }

    pub fn log_usage(&self, key_id: &str, streamed_tokens: u64, suffix: &str) {
        let budget = self.budget();
        let remaining = budget.tokens().floor().max(0.0) as u64;
        tracing::info!(
            key_id,
            streamed_tokens,
            remaining_tokens = remaining,
            "{key_id} streamed {streamed_tokens} tokens, {remaining}/{} remaining{suffix}",
            budget.max_tokens()
        );
    }
}

/// Per-key budgets, built once at startup from the provisioned key set.
pub struct RateLimiter {
    keys: HashMap<String, Arc<KeyLimiter>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: HashMap::new(),
            clock,
        }
    }

    pub fn with_key(mut self, key_id: impl Into<String>, limits: LimitsConfig) -> Self {
        self.register(key_id, limits);
        self
    }

    pub fn register(&mut self, key_id: impl Into<String>, limits: LimitsConfig) {
        let limiter = KeyLimiter::new(limits, self.clock.clone());
        self.keys.insert(key_id.into(), Arc::new(limiter));
    }

    pub fn get(&self, key_id: &str) -> Option<Arc<KeyLimiter>> {
        self.keys.get(key_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::ManualClock;
    use super::*;

    const START_MS: u64 = 1_700_000_000_000;

    fn limits(max_tokens: u64, max_requests: u64) -> LimitsConfig {
        LimitsConfig {
            max_tokens,
            max_requests,
        }
    }

    fn limiter(limits: LimitsConfig) -> (Arc<ManualClock>, KeyLimiter) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let limiter = KeyLimiter::new(limits, clock.clone());
        (clock, limiter)
    }

    #[test]
    fn refill_adds_tokens_linearly_and_requests_per_minute() {
        let mut budget = KeyBudget::full(limits(3600, 60), START_MS);
        assert!(budget.try_consume_tokens(1000, START_MS));
        for _ in 0..10 {
            assert!(budget.try_consume_request(START_MS));
        }

        budget.refill(START_MS + 150_000);
        assert!((budget.tokens() - (2600.0 + 150.0)).abs() < 1e-9);
        assert_eq!(budget.requests(), 50 + 2);
    }

    #[test]
    fn refill_clamps_to_ceilings() {
        let mut budget = KeyBudget::full(limits(100, 5), START_MS);
        assert!(budget.try_consume_tokens(10, START_MS));
        assert!(budget.try_consume_request(START_MS));

        budget.refill(START_MS + 10 * 3_600_000);
        assert_eq!(budget.tokens(), 100.0);
        assert_eq!(budget.requests(), 5);
    }

    #[test]
    fn request_credits_count_only_time_since_last_refill() {
        let mut budget = KeyBudget::full(limits(100, 5), START_MS);
        assert!(budget.try_consume_request(START_MS));

        budget.refill(START_MS + 45_000);
        budget.refill(START_MS + 75_000);
        assert_eq!(budget.requests(), 4);

        budget.refill(START_MS + 135_000);
        assert_eq!(budget.requests(), 5);
    }

    #[test]
    fn clock_rollback_never_drains_budget() {
        let mut budget = KeyBudget::full(limits(100, 5), START_MS);
        assert!(budget.try_consume_tokens(50, START_MS));
        budget.refill(START_MS - 60_000);
        assert_eq!(budget.tokens(), 50.0);
        assert_eq!(budget.requests(), 5);
    }

    #[test]
    fn consume_tokens_fails_without_mutation() {
        let (_clock, limiter) = limiter(limits(3, 60));
        assert!(limiter.try_consume_tokens(2));
        assert!(!limiter.try_consume_tokens(2));
        assert_eq!(limiter.budget().tokens(), 1.0);
        assert!(limiter.try_consume_tokens(1));
        assert!(!limiter.try_consume_tokens(1));
        assert_eq!(limiter.budget().tokens(), 0.0);
    }

    #[test]
    fn consume_request_fails_without_mutation() {
        let (clock, limiter) = limiter(limits(10, 1));
        assert!(limiter.try_consume_request());
        assert!(!limiter.try_consume_request());
        assert_eq!(limiter.budget().requests(), 0);

        clock.advance(Duration::from_secs(60));
        assert!(limiter.try_consume_request());
    }

    #[test]
    fn exhausted_when_either_allowance_is_spent() {
        let (clock, limiter) = limiter(limits(1, 1));
        assert!(!limiter.is_exhausted());

        assert!(limiter.try_consume_tokens(1));
        assert!(limiter.is_exhausted());

        clock.advance(Duration::from_secs(3600));
        assert!(!limiter.is_exhausted());

        assert!(limiter.try_consume_request());
        assert!(limiter.is_exhausted());
    }

    #[test]
    fn headers_report_floor_remaining_and_reset_times() {
        let (clock, limiter) = limiter(limits(3600, 60));
        let headers = limiter.snapshot_headers();
        assert_eq!(headers.remaining_tokens, 3600);
        assert_eq!(headers.reset_tokens_secs, 0);
        assert_eq!(headers.reset_requests_secs, 60);

        assert!(limiter.try_consume_tokens(100));
        assert!(limiter.try_consume_request());
        clock.advance(Duration::from_millis(20_500));

        let headers = limiter.snapshot_headers();
        assert_eq!(headers.limit_tokens, 3600);
        assert_eq!(headers.limit_requests, 60);
        assert_eq!(headers.remaining_tokens, 3520);
        assert_eq!(headers.remaining_requests, 59);
        assert_eq!(headers.reset_tokens_secs, 80);
        assert_eq!(headers.reset_requests_secs, 60);
    }

    #[test]
    fn header_pairs_use_seconds_suffix() {
        let (_clock, limiter) = limiter(limits(50_000, 60));
        let pairs = limiter.snapshot_headers().pairs();
        let lookup = |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(lookup("x-ratelimit-limit-tokens").as_deref(), Some("50000"));
        assert_eq!(lookup("x-ratelimit-reset-requests").as_deref(), Some("60s"));
        assert_eq!(lookup("x-ratelimit-reset-tokens").as_deref(), Some("0s"));
    }

    #[test]
    fn concurrent_consumers_on_one_key_never_overspend() {
        let (_clock, limiter) = limiter(limits(1000, 60));
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let mut granted = 0u64;
                    for _ in 0..200 {
                        if limiter.try_consume_tokens(1) {
                            granted += 1;
                        }
                    }
                    granted
                })
            })
            .collect();

        let granted: u64 = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .sum();
        assert_eq!(granted, 1000);
        assert_eq!(limiter.budget().tokens(), 0.0);
    }

    #[test]
    fn registry_keeps_keys_independent() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let limiter = RateLimiter::new(clock)
            .with_key("a", limits(1, 10))
            .with_key("b", limits(1, 10));

        let a = limiter.get("a").expect("a");
        let b = limiter.get("b").expect("b");
        assert!(a.try_consume_tokens(1));
        assert!(a.is_exhausted());
        assert!(!b.is_exhausted());
        assert!(limiter.get("missing").is_none());
        assert_eq!(limiter.len(), 2);
    }
}
