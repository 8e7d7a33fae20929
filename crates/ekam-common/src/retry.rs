//! Backoff and deadline helpers.
//!
//! `retry_with_backoff` drives install attempts from the CLI; `with_timeout`
//! is the deadline the controller races every network fetch against.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::EkamError;

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first. Never below 1.
    pub max_attempts: u32,
    /// Pause before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
    /// Each pause is the previous one times this.
    pub multiplier: u32,
    /// Extra random pause, as a percentage of the computed one.
    pub jitter_percent: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            jitter_percent: 25,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn none() -> Self {
        Self::attempts(1)
    }

    /// Default pacing with `max_attempts` attempts.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Pause before `attempt` (1-based). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let factor = self.multiplier.max(1).saturating_pow(retry);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        delay + delay * jitter_percent(self.jitter_percent) / 100
    }
}

/// Clock-derived jitter in `0..=max` percent.
fn jitter_percent(max: u32) -> u32 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    nanos % (max + 1)
}

/// Run `operation` until it succeeds, `retryable` rejects its error, or
/// attempts run out. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !retryable(&error) {
            debug!(attempt, error = %error, "Giving up on permanent error");
            return Err(error);
        }
        if attempt == max_attempts {
            warn!(attempt, error = %error, "Out of attempts");
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        warn!(attempt, max_attempts, ?delay, error = %error, "Attempt failed, backing off");
        sleep(delay).await;
    }
}

/// Await `operation`, giving up after `timeout`.
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: Fut) -> Result<T, EkamError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| EkamError::Timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            jitter_percent: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_attempts_never_zero() {
        assert_eq!(RetryConfig::none().max_attempts, 1);
        assert_eq!(RetryConfig::attempts(0).max_attempts, 1);
        assert_eq!(RetryConfig::attempts(5).max_attempts, 5);
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            jitter_percent: 0,
            ..Default::default()
        };

        let delays: Vec<_> = (1..=6).map(|n| config.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn test_backoff_saturates_on_huge_attempts() {
        let config = RetryConfig {
            jitter_percent: 0,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(200), config.max_delay);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            jitter_percent: 25,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<&str, String> = retry_with_backoff(&quick(3), |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("precache attempt {n} refused"))
                } else {
                    Ok("installed")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("installed"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_with_backoff(&quick(2), |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {n}")) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), EkamError> = retry_with_backoff(
            &quick(5),
            EkamError::is_retryable,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EkamError::config("offline document missing from manifest")) }
            },
        )
        .await;

        assert!(matches!(result, Err(EkamError::Config { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let result = with_timeout(Duration::from_millis(10), sleep(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(EkamError::Timeout(d)) if d == Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_deadline_passes_value_through() {
        let result = with_timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
