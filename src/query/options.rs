//! Query Options Module
//!
//! Per-query staleness, garbage collection and retry configuration.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::config::Config;
use crate::error::RepoError;

// == Fetcher ==
/// Future produced by a single fetch attempt.
pub type FetchFuture = BoxFuture<'static, Result<Value, RepoError>>;

/// Re-invocable fetch function attached to a query.
///
/// Stored on the cache entry so invalidation and focus events can refetch a
/// key without the original caller being around.
#[derive(Clone)]
pub struct Fetcher(Arc<dyn Fn() -> FetchFuture + Send + Sync>);

impl Fetcher {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RepoError>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    pub fn call(&self) -> FetchFuture {
        (self.0)()
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fetcher(..)")
    }
}

/// Shorthand for [`Fetcher::new`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RepoError>> + Send + 'static,
{
    Fetcher::new(f)
}

// == Retry ==
/// Predicate deciding whether failure number `n` may be retried.
pub type RetryPredicate = Arc<dyn Fn(u32, &RepoError) -> bool + Send + Sync>;

/// How many times a failed fetch is retried.
#[derive(Clone)]
pub enum Retry {
    /// Retry up to this many times
    Count(u32),
    /// Retry while the predicate returns true
    Predicate(RetryPredicate),
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Retry::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry: Retry,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry: Retry, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retry,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(Retry::Count(0), Duration::ZERO, Duration::ZERO)
    }

    // == Should Retry ==
    /// Decides whether to retry after `failure_count` consecutive failures.
    ///
    /// Authentication, validation and conflict errors are never retried,
    /// whatever the configured count or predicate says.
    pub fn should_retry(&self, failure_count: u32, error: &RepoError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        match &self.retry {
            Retry::Count(max) => failure_count <= *max,
            Retry::Predicate(predicate) => predicate(failure_count, error),
        }
    }

    // == Backoff ==
    /// Delay before the retry that follows failure number `failure_count`:
    /// `min(base * 2^(failure_count - 1), max)`.
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Retry::Count(3),
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
        )
    }
}

// == Query Options ==
/// Options recognised by `query`, `prefetch` and `watch`.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long fetched data counts as fresh; `Duration::MAX` never goes stale by time
    pub stale_time: Duration,
    /// How long an unobserved entry survives before eviction
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    /// Refetch when the application regains focus, if stale and observed
    pub refetch_on_focus: bool,
    /// Per-attempt timeout; a timed-out attempt counts as a transient failure
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    /// Options seeded from the engine configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_time: config.default_stale_time(),
            gc_time: config.default_gc_time(),
            retry: RetryPolicy::new(
                Retry::Count(config.default_retry_count),
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            refetch_on_focus: config.refetch_on_focus,
            timeout: None,
        }
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry.retry = retry;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
