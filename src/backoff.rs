//! Exponential backoff for calls against an unreliable remote ledger.
//!
//! Every ledger call in the crate goes through [`Backoff`]. The delay before
//! retry `n` is `initial_delay * factor^n`, capped at `max_delay`, optionally
//! jittered so that many clients recovering from the same outage do not hit
//! the RPC endpoint in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub factor: f64,
    /// Randomize each delay between half and all of its nominal value.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Fetching a transaction by signature.
    #[must_use]
    pub fn transaction_fetch() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            ..Self::default()
        }
    }

    /// Balance and rent-exemption queries.
    #[must_use]
    pub fn balance_query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Submitting a signed transaction.
    #[must_use]
    pub fn submission() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            ..Self::default()
        }
    }

    /// A single signature status lookup inside the confirmation loop.
    #[must_use]
    pub fn status_fetch() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// The first, unauthenticated request to a paid resource.
    #[must_use]
    pub fn outbound_request() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Re-fetching the resource with a payment proof attached.
    #[must_use]
    pub fn proof_refetch() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            factor: 2.0,
            jitter: true,
        }
    }

    /// A policy with no delay between attempts. Intended for tests.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Nominal (un-jittered) delay before retry number `retry` (0-based).
    #[must_use]
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let half = nominal / 2;
        let spread = rand::thread_rng().gen_range(0.0..=1.0);
        half + half.mul_f64(spread)
    }

    /// Run `op`, retrying every failure.
    ///
    /// # Errors
    ///
    /// Returns the last error once all attempts are exhausted.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(op, |_| true).await
    }

    /// Run `op`, retrying only failures for which `should_retry` returns true.
    ///
    /// A failure that is not retryable is returned immediately.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last error once all
    /// attempts are exhausted.
    pub async fn execute_if<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.max_retries && should_retry(&e) => {
                    let delay = self.delay_for(retry);
                    debug!(
                        "Attempt {} of {} failed ({e}), retrying in {}ms",
                        retry + 1,
                        self.max_retries + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_nominal_delay_curve() {
        let backoff = Backoff {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.nominal_delay(0), Duration::from_millis(500));
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.nominal_delay(2), Duration::from_millis(2000));
        // Capped
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(3000));
        assert_eq!(backoff.nominal_delay(10), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<&str, String> = Backoff::immediate(3)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), String> = Backoff::immediate(2)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {n}"))
                }
            })
            .await;

        // One initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "failure 2");
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), String> = Backoff::immediate(5)
            .execute_if(
                || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("terminal".to_string())
                    }
                },
                |e| e != "terminal",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_real_delays_are_applied() {
        let backoff = Backoff {
            max_retries: 2,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
            factor: 2.0,
            jitter: false,
        };
        let start = std::time::Instant::now();
        let result: Result<(), String> = backoff.execute(|| async { Err("down".to_string()) }).await;
        assert!(result.is_err());
        // 20ms + 40ms
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    proptest! {
        #[test]
        fn prop_delays_never_exceed_cap(
            initial_ms in 0u64..5_000,
            max_ms in 0u64..20_000,
            factor in 1.0f64..4.0,
            retry in 0u32..64,
        ) {
            let backoff = Backoff {
                max_retries: 64,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                factor,
                jitter: true,
            };
            let cap = Duration::from_millis(max_ms);
            prop_assert!(backoff.nominal_delay(retry) <= cap);
            prop_assert!(backoff.delay_for(retry) <= cap);
        }

        #[test]
        fn prop_nominal_delays_are_monotonic(
            initial_ms in 1u64..5_000,
            factor in 1.0f64..4.0,
            retry in 0u32..32,
        ) {
            let backoff = Backoff {
                max_retries: 32,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_secs(60),
                factor,
                jitter: false,
            };
            prop_assert!(backoff.nominal_delay(retry) <= backoff.nominal_delay(retry + 1));
        }
    }
}
