//! Login throttling using the token bucket algorithm.
//!
//! Every login attempt draws a token from a bucket keyed by the attempted
//! username. This caps how fast a single account can be probed, on top of
//! the lockout enforced by the session verifier, and keeps one noisy client
//! from burning through another user's failed-login budget in a burst.
//!
//! # Algorithm
//!
//! - Each username has a bucket holding up to `burst` tokens, starting full
//! - Tokens are added at `rate` tokens per second
//! - Each attempt consumes one token
//! - An empty bucket rejects the attempt with a `Retry-After` hint
//!
//! Buckets idle for longer than [`STALE_ENTRY_TIMEOUT`] are discarded by
//! [`LoginThrottle::spawn_cleanup_task`].
//!
//! # Example
//!
//! ```rust
//! use beeline_server::rate_limit::{LoginThrottle, ThrottleDecision};
//!
//! #[tokio::main]
//! async fn main() {
//!     let throttle = LoginThrottle::new(1.0, 2);
//!
//!     assert!(throttle.check("alice").await.is_allowed());
//!     assert!(throttle.check("alice").await.is_allowed());
//!     assert!(throttle.check("alice").await.is_throttled());
//!
//!     // Other usernames are unaffected.
//!     assert_eq!(throttle.check("bob").await, ThrottleDecision::Allowed);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Duration after which idle buckets are discarded (10 minutes).
pub const STALE_ENTRY_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// The attempt may proceed.
    Allowed,

    /// Too many attempts; retry after the given number of seconds.
    Throttled {
        retry_after_secs: u64,
    },
}

impl ThrottleDecision {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[inline]
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Seconds to put in the `Retry-After` header, if throttled.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Throttled { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn take(&mut self, rate: f64, burst: u32) -> ThrottleDecision {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return ThrottleDecision::Allowed;
        }

        let wait = ((1.0 - self.tokens) / rate).ceil() as u64;
        ThrottleDecision::Throttled {
            retry_after_secs: wait.max(1),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_refill.elapsed()
    }
}

#[derive(Debug)]
struct Buckets {
    by_username: HashMap<String, Bucket>,
    rate: f64,
    burst: u32,
}

/// Per-username login throttle.
///
/// Cheap to clone; clones share the same buckets.
#[derive(Debug, Clone)]
pub struct LoginThrottle {
    inner: Arc<RwLock<Buckets>>,
}

impl LoginThrottle {
    /// Creates a throttle allowing `rate` attempts per second per username,
    /// with bursts of up to `burst` attempts.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Buckets {
                by_username: HashMap::new(),
                rate,
                burst,
            })),
        }
    }

    /// Records a login attempt for `username` and decides whether it may
    /// proceed.
    ///
    /// Usernames are compared case-insensitively so `Alice` and `alice`
    /// share one bucket.
    pub async fn check(&self, username: &str) -> ThrottleDecision {
        let mut inner = self.inner.write().await;
        let (rate, burst) = (inner.rate, inner.burst);

        let decision = inner
            .by_username
            .entry(username.to_ascii_lowercase())
            .or_insert_with(|| Bucket::full(burst))
            .take(rate, burst);

        if let ThrottleDecision::Throttled { retry_after_secs } = decision {
            debug!(username = %username, retry_after_secs, "Login attempt throttled");
        }
        decision
    }

    /// Drops buckets idle for longer than `timeout`. Returns how many were
    /// removed.
    pub async fn cleanup_idle(&self, timeout: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.by_username.len();
        inner
            .by_username
            .retain(|_, bucket| bucket.idle_for() < timeout);
        before - inner.by_username.len()
    }

    /// Number of usernames currently tracked.
    pub async fn tracked_count(&self) -> usize {
        self.inner.read().await.by_username.len()
    }

    /// Spawns a background task that discards idle buckets every
    /// `cleanup_interval`.
    ///
    /// The task runs until its handle is aborted.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let throttle = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = throttle.cleanup_idle(STALE_ENTRY_TIMEOUT).await;
                if removed > 0 {
                    debug!(removed_count = removed, "Cleaned up idle login throttle entries");
                }
            }
        })
    }
}
