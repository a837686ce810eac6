//! Retry policy for provider calls.
//!
//! A throttled or timed-out request is retried after the provider's
//! retry-after hint, capped by configuration. Only the single failed request
//! is repeated, never a whole pagination loop.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

use super::trait_::PlatformError;
use crate::config::RateLimitPolicyConfig;
use crate::models::connection::Provider;
use crate::telemetry::current_job_id;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    provider: Provider,
    max_attempts: u32,
    default_retry_after: Duration,
    max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn new(
        provider: Provider,
        max_attempts: u32,
        default_retry_after: Duration,
        max_retry_after: Duration,
    ) -> Self {
        Self {
            provider,
            max_attempts: max_attempts.max(1),
            default_retry_after,
            max_retry_after,
        }
    }

    pub fn from_config(provider: Provider, config: &RateLimitPolicyConfig) -> Self {
        let (default_secs, max_secs) = config.for_provider(provider.as_str());
        Self::new(
            provider,
            config.max_attempts,
            Duration::from_secs(default_secs),
            Duration::from_secs(max_secs),
        )
    }

    /// Hint used when a throttled response carries no retry-after value.
    pub fn default_retry_after_secs(&self) -> u64 {
        self.default_retry_after.as_secs()
    }

    /// Runs `call`, repeating it after a pause when it fails with a
    /// retryable error and attempts remain.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let PlatformError::RateLimited { .. } = err {
                let metric_labels = vec![("provider", self.provider.to_string())];
                counter!("platform_rate_limited_total", &metric_labels).increment(1);
            }

            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = self.delay_for(&err);
            warn!(
                provider = %self.provider,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                job_id = ?current_job_id(),
                error = %err,
                "retrying provider call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn delay_for(&self, err: &PlatformError) -> Duration {
        match err {
            PlatformError::RateLimited {
                retry_after_secs, ..
            } => Duration::from_secs(*retry_after_secs).min(self.max_retry_after),
            _ => self.default_retry_after.min(self.max_retry_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Provider::Spotify, 2, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn retries_rate_limited_once_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy()
            .run("fetch", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PlatformError::RateLimited {
                            provider: Provider::Spotify,
                            retry_after_secs: 30,
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_propagates() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(PlatformError::RateLimited {
                        provider: Provider::Spotify,
                        retry_after_secs: 1,
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(PlatformError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("add", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(PlatformError::Permanent {
                        provider: Provider::Spotify,
                        status: 400,
                        message: "bad".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(
            Provider::Deezer,
            2,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let err = PlatformError::RateLimited {
            provider: Provider::Deezer,
            retry_after_secs: 3600,
        };
        assert_eq!(policy.delay_for(&err), Duration::from_secs(60));
    }
}
