//! Retry with exponential backoff and jitter, plus timeout wrappers.
//!
//! Every outbound call (LLM, file-mutation worker, notifier, command
//! executor) goes through [`RetryPolicy`]. A policy with `max_retries = 3`
//! runs the operation at most four times and returns the last error.

use crate::error::RemedyError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Maximum jitter added on top of the computed delay (fraction of delay)
pub const JITTER_FRACTION: f64 = 0.30;

/// Backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            jitter: true,
        }
    }

    /// Policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1`: min(initial * 2^attempt, max) plus up to 30% jitter
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = (self.initial_delay_ms as f64 * 2f64.powi(attempt as i32))
            .min(self.max_delay_ms as f64);

        let jitter = if self.jitter && base > 0.0 {
            rand::thread_rng().gen_range(0.0..=base * JITTER_FRACTION)
        } else {
            0.0
        };

        Duration::from_millis((base + jitter) as u64)
    }

    /// Run `op` until it succeeds or retries are exhausted; returns the last error
    pub async fn retry<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    let delay = self.calculate_backoff(attempt);
                    warn!(
                        "[RETRY] {} failed (attempt {}/{}): {} - retrying in {} ms",
                        label,
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`RetryPolicy::retry`], with each attempt bounded by `timeout`
    pub async fn retry_with_timeout<T, F, Fut>(
        &self,
        label: &str,
        timeout: Duration,
        mut op: F,
    ) -> Result<T, RemedyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemedyError>>,
    {
        self.retry(label, || with_timeout(timeout, op())).await
    }
}

/// Bound a future by `timeout`, mapping expiry to [`RemedyError::Timeout`]
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, RemedyError>
where
    Fut: Future<Output = Result<T, RemedyError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemedyError::Timeout(timeout.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_call_runs_max_retries_plus_one() {
        let policy = RetryPolicy::new(3, 100, 1000);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), String> = policy
            .retry("always-fails", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure #{}", n))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err(), "failure #4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, 10, 100);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<&str, String> = policy
            .retry("flaky", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_is_capped_and_jitter_bounded() {
        let policy = RetryPolicy::new(5, 100, 1000);
        for attempt in 0..6 {
            let base = (100.0 * 2f64.powi(attempt as i32)).min(1000.0);
            let delay = policy.calculate_backoff(attempt).as_millis() as f64;
            assert!(delay >= base.floor());
            assert!(delay <= (base * (1.0 + JITTER_FRACTION)).ceil());
        }
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::new(3, 100, 1000)
        };
        assert_eq!(policy.calculate_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(400));
        assert_eq!(policy.calculate_backoff(5), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_expiry() {
        let result: Result<(), RemedyError> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RemedyError::Timeout(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_timeout_retries_stalled_calls() {
        let policy = RetryPolicy::new(2, 10, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), RemedyError> = policy
            .retry_with_timeout("stalled", Duration::from_millis(20), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(RemedyError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
