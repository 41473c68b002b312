//! Backoff policy for reaching the file store.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::FileStoreError;
use crate::filestore::FileStoreClient;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied per further failure.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of failures so far
    /// (1-indexed): `initial_delay * multiplier^(failures - 1)`, capped.
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Ping the file store, reconnecting and backing off until it answers.
///
/// Returns the number of failed attempts before success.
pub async fn ensure_connected(
    client: &dyn FileStoreClient,
    policy: &RetryPolicy,
) -> Result<u32, FileStoreError> {
    let mut failures = 0u32;
    loop {
        let outcome = match client.ping().await {
            Ok(()) => Ok(()),
            Err(ping_err) => {
                warn!(error = %ping_err, "File store ping failed, reconnecting");
                match client.reconnect().await {
                    Ok(()) => client.ping().await,
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(()) => {
                if failures > 0 {
                    info!(failures, "File store reachable again");
                }
                return Ok(failures);
            }
            Err(e) => {
                failures += 1;
                if policy.max_attempts.is_some_and(|max| failures >= max) {
                    return Err(FileStoreError::RetriesExhausted { attempts: failures });
                }
                let delay = policy.next_delay(failures);
                warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "File store unreachable, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::filestore::{FileTransaction, StagingRecovery};

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
            max_attempts,
        }
    }

    /// Fails the first `failures` pings.
    struct FlakyStore {
        failures: u32,
        pings: AtomicU32,
    }

    #[async_trait]
    impl FileStoreClient for FlakyStore {
        async fn ping(&self) -> Result<(), FileStoreError> {
            let n = self.pings.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(FileStoreError::Unavailable("down".into()))
            } else {
                Ok(())
            }
        }
        async fn reconnect(&self) -> Result<(), FileStoreError> {
            Ok(())
        }
        async fn begin_local_transaction(&self) -> Result<FileTransaction, FileStoreError> {
            unimplemented!("not used in retry tests")
        }
        async fn prepare(&self, _tx: &FileTransaction) -> Result<(), FileStoreError> {
            Ok(())
        }
        async fn commit_local_transaction(&self, _tx: FileTransaction) -> Result<(), FileStoreError> {
            Ok(())
        }
        async fn rollback_local_transaction_if_active(
            &self,
            _tx: FileTransaction,
        ) -> Result<(), FileStoreError> {
            Ok(())
        }
        async fn recover_abandoned(&self) -> Result<StagingRecovery, FileStoreError> {
            Ok(StagingRecovery::default())
        }
        async fn read(&self, _name: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
            Ok(None)
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        };
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(4), Duration::from_secs(5));
        assert_eq!(policy.next_delay(100), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        // Each failed attempt consumes two pings (before and after reconnect)
        let store = FlakyStore {
            failures: 4,
            pings: AtomicU32::new(0),
        };
        let failures = ensure_connected(&store, &fast_policy(None)).await.unwrap();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = FlakyStore {
            failures: u32::MAX,
            pings: AtomicU32::new(0),
        };
        let result = ensure_connected(&store, &fast_policy(Some(3))).await;
        assert!(matches!(
            result,
            Err(FileStoreError::RetriesExhausted { attempts: 3 })
        ));
    }
}
