//! Per-client rate limiting for challenge issuance.
//!
//! Each client gets a fixed window: a request counter and the instant the
//! window resets. Windows are replenished lazily when the client next shows
//! up, and the table of tracked clients is an LRU so that a flood of distinct
//! client ids cannot grow memory without bound.

use crate::clock::Clock;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Default number of challenges a client may request per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 100;

/// Default window length in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Default number of clients tracked at once (≈ a few MB of memory).
pub const DEFAULT_TRACKED_CLIENTS: usize = 100_000;

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
    /// Clients tracked before the least recently seen is forgotten.
    pub tracked_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: Duration::milliseconds(60_000),
            tracked_clients: DEFAULT_TRACKED_CLIENTS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Rate limiter statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct RateLimitStats {
    /// Requests let through.
    pub allowed: u64,
    /// Requests refused.
    pub limited: u64,
}

impl RateLimitStats {
    /// Share of requests refused, as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn limited_rate(&self) -> f64 {
        let total = self.allowed + self.limited;
        if total == 0 {
            0.0
        } else {
            (self.limited as f64 / total as f64) * 100.0
        }
    }
}

/// Fixed-window rate limiter keyed by client id.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<LruCache<String, Window>>>,
    stats: Arc<Mutex<RateLimitStats>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let cap = NonZeroUsize::new(config.tracked_clients).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(RateLimitStats::default())),
            config,
            clock,
        }
    }

    /// Count a request from `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] with the seconds until the client's
    /// window resets if the client has used up its window.
    pub fn check(&self, client_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();

        let current = windows
            .get(client_id)
            .copied()
            .filter(|window| now <= window.reset_at);
        let verdict = match current {
            Some(window) if window.count >= self.config.max_requests => Err(window.reset_at),
            Some(window) => {
                windows.put(
                    client_id.to_string(),
                    Window {
                        count: window.count + 1,
                        ..window
                    },
                );
                Ok(())
            }
            None => {
                windows.put(
                    client_id.to_string(),
                    Window {
                        count: 1,
                        reset_at: now + self.config.window,
                    },
                );
                Ok(())
            }
        };
        drop(windows);

        let mut stats = self.stats.lock();
        match verdict {
            Ok(()) => {
                stats.allowed += 1;
                Ok(())
            }
            Err(reset_at) => {
                stats.limited += 1;
                let millis = (reset_at - now).num_milliseconds().max(0);
                let retry_after_secs = u64::try_from((millis + 999) / 1000).unwrap_or(0);
                debug!(
                    "Rate limited {} for {}s",
                    client_id, retry_after_secs
                );
                Err(Error::RateLimited { retry_after_secs })
            }
        }
    }

    /// Get current statistics.
    #[must_use]
    pub fn stats(&self) -> RateLimitStats {
        self.stats.lock().clone()
    }

    /// Number of clients currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_requests: u32, tracked_clients: usize) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::starting_now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_requests,
                window: Duration::seconds(60),
                tracked_clients,
            },
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[test]
    fn test_limits_after_max_requests() {
        let (limiter, _clock) = limiter(3, 10);

        for _ in 0..3 {
            limiter.check("10.0.0.1").unwrap();
        }
        match limiter.check("10.0.0.1") {
            Err(Error::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 60),
            other => unreachable!("expected rate limit, got {other:?}"),
        }

        // Other clients are unaffected
        limiter.check("10.0.0.2").unwrap();

        let stats = limiter.stats();
        assert_eq!(stats.allowed, 4);
        assert_eq!(stats.limited, 1);
        assert!((stats.limited_rate() - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_window_resets() {
        let (limiter, clock) = limiter(1, 10);

        limiter.check("client").unwrap();
        assert!(limiter.check("client").is_err());

        clock.advance(Duration::seconds(30));
        match limiter.check("client") {
            Err(Error::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 30),
            other => unreachable!("expected rate limit, got {other:?}"),
        }

        clock.advance(Duration::seconds(31));
        limiter.check("client").unwrap();
    }

    #[test]
    fn test_tracked_clients_bounded() {
        let (limiter, _clock) = limiter(1, 2);

        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        limiter.check("c").unwrap();
        assert_eq!(limiter.tracked(), 2);

        // "a" was evicted, so it starts a fresh window
        limiter.check("a").unwrap();
    }
}
