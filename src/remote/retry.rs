//! Bounded exponential backoff for opening remote sessions
//!
//! Attempts are capped; with the defaults (3 attempts, 1s base) the waits
//! between attempts are 1s then 2s. Exhausting the budget yields
//! [`ConnectionError::RetriesExhausted`], which the engine treats as fatal.

use std::time::Duration;

use super::connection::{RemoteConnection, SpeechConnector};
use crate::error::ConnectionError;
use crate::settings::RetryConfig;

/// How many times to try, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the given zero-based attempt
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt - 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
        )
    }
}

/// Open a remote session, retrying with exponential backoff
pub async fn connect_with_retry<C>(
    connector: &C,
    policy: RetryPolicy,
) -> Result<RemoteConnection, ConnectionError>
where
    C: SpeechConnector + ?Sized,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.delay_before(attempt);
            log::info!(
                "Retrying remote connection in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }

        match connector.connect().await {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                // A missing key will not appear between attempts
                if matches!(e, ConnectionError::MissingApiKey) {
                    return Err(e);
                }
                last_error = Some(e);
            }
        }
    }

    Err(ConnectionError::RetriesExhausted {
        attempts: policy.max_attempts,
        last: Box::new(last_error.unwrap_or_else(|| {
            ConnectionError::ConnectionFailed("Max retries exceeded".to_string())
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockConnector;

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (connector, remote) = MockConnector::new();
        remote.fail_next_connects(2);

        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let connection = connect_with_retry(&connector, policy).await;

        assert!(connection.is_ok());
        assert_eq!(remote.connect_attempts(), 3);
        assert_eq!(remote.connections(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries() {
        let (connector, remote) = MockConnector::new();
        remote.fail_next_connects(5);

        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let err = connect_with_retry(&connector, policy).await.unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(remote.connect_attempts(), 3);
    }
}
