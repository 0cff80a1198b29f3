// =============================================================================
// Retry Executor — bounded attempts with exponential backoff and jitter
// =============================================================================
//
// Delay before attempt k (k >= 2) is `min(base * factor^(k-2), max)`, then
// jittered by a uniform factor in [1 - jitter, 1 + jitter]. The default
// retryability predicate covers timeouts, connection failures, and
// rate-limit / transient-HTTP errors.
// =============================================================================

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Options for a single retried operation.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Jitter fraction; 0.25 means a uniform factor in [0.75, 1.25].
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl From<&RetryConfig> for RetryOptions {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            factor: cfg.factor,
            jitter: 0.25,
        }
    }
}

/// Un-jittered delay before attempt `attempt` (1-based; attempt 1 has none).
pub fn backoff_delay(attempt: u32, opts: &RetryOptions) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exp = (attempt - 2) as i32;
    let raw = opts.base_delay.as_millis() as f64 * opts.factor.powi(exp);
    let capped = raw.min(opts.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Apply a uniform jitter factor in [1 - jitter, 1 + jitter].
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// The default retryability predicate: transient network and rate-limit
/// failures retry, everything else surfaces immediately.
pub fn default_retryable(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    const MARKERS: &[&str] = &[
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "connection",
        "unreachable",
        "no such host",
        "rate limit",
        "429",
        "500",
        "502",
        "503",
        "504",
    ];
    MARKERS.iter().any(|m| msg.contains(m))
}

/// Execute `op` with bounded attempts. `label` identifies the operation in
/// logs; `retryable` decides whether a given error is worth another attempt.
pub async fn retry<T, F, Fut, P>(
    label: &str,
    opts: &RetryOptions,
    retryable: P,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let max_attempts = opts.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = apply_jitter(backoff_delay(attempt, opts), opts.jitter);
            debug!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    debug!(label, attempt, "retry succeeded");
                }
                return Ok(v);
            }
            Err(e) if attempt < max_attempts && retryable(&e) => {
                warn!(label, attempt, error = %e, "attempt failed — will retry");
            }
            Err(e) => {
                if attempt < max_attempts {
                    warn!(label, attempt, error = %e, "non-retryable error — giving up");
                }
                return Err(e);
            }
        }
    }
    unreachable!("retry loop returns from within")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_opts(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_follows_geometric_schedule() {
        let opts = RetryOptions {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
            jitter: 0.25,
        };
        assert_eq!(backoff_delay(1, &opts), Duration::ZERO);
        assert_eq!(backoff_delay(2, &opts), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3, &opts), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4, &opts), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let opts = RetryOptions {
            max_attempts: 20,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(backoff_delay(10, &opts), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let jittered = apply_jitter(base, 0.25).as_millis() as f64;
            assert!((750.0..=1250.0).contains(&jittered), "out of range: {jittered}");
        }
    }

    #[test]
    fn default_predicate_matches_transient_classes() {
        assert!(default_retryable(&anyhow::anyhow!("request timeout")));
        assert!(default_retryable(&anyhow::anyhow!("connection refused")));
        assert!(default_retryable(&anyhow::anyhow!("HTTP 503 service unavailable")));
        assert!(default_retryable(&anyhow::anyhow!("rate limit exceeded")));
        assert!(default_retryable(&anyhow::anyhow!("status 429")));
        assert!(!default_retryable(&anyhow::anyhow!("invalid credentials")));
        assert!(!default_retryable(&anyhow::anyhow!("HTTP 404 not found")));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry("test", &fast_opts(3), default_retryable, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("connection reset")
                }
                Ok(7u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_never_exceed_max() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: anyhow::Result<u32> =
            retry("test", &fast_opts(3), default_retryable, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("timeout")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: anyhow::Result<u32> =
            retry("test", &fast_opts(5), default_retryable, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("schema validation failed")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
