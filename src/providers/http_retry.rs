//! Bounded retry for chunk transmission.
//!
//! Chunk PUTs are the only calls retried locally: a fixed number of attempts
//! with a fixed pause in between, no backoff growth.
//! Every other request surfaces its first failure.

use std::future::Future;
use std::time::Duration;

use super::ProviderError;

/// Configuration for chunk retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included (default: 3)
    pub attempts: u32,
    /// Pause between attempts (default: 1s)
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// Status codes accepted for a chunk PUT
pub fn is_chunk_success(status: u16) -> bool {
    matches!(status, 200 | 204)
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number. The error of the last attempt is
/// returned unchanged.
pub async fn retry_fixed<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::debug!(
                    "{} failed ({}). Retry {}/{} after {:?}",
                    label, e, attempt, attempts - 1, policy.delay
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_is_chunk_success() {
        assert!(is_chunk_success(200));
        assert!(is_chunk_success(204));
        assert!(!is_chunk_success(201));
        assert!(!is_chunk_success(403));
        assert!(!is_chunk_success(500));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result = retry_fixed(&policy, "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ProviderError::NetworkError("flaky".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result: Result<(), _> = retry_fixed(&policy, "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::NetworkError("down".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::NetworkError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_fixed_delay() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let _: Result<(), _> = retry_fixed(&policy, "op", |_| async {
            Err(ProviderError::NetworkError("down".to_string()))
        })
        .await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
