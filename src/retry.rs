//! Retry with exponential backoff for storage work
//!
//! Every unit of storage work runs through a [`RetryExecutor`]. Failures are
//! classified by the error type itself ([`ClassifyFailure`]): transient ones
//! (lock contention, busy database, I/O blips) are retried with exponential
//! backoff and jitter up to `max_retries`; permanent ones surface immediately.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier (typically 2.0 for exponential backoff)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add random jitter to prevent thundering herd
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a fixed retry count and initial backoff
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            ..Default::default()
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            // Add 0-25% jitter
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            capped * jitter_factor
        } else {
            capped
        };

        Duration::from_secs_f64(final_ms / 1000.0)
    }

    /// Upper bound on time spent sleeping across every retry
    pub fn worst_case_delay(&self) -> Duration {
        let total_ms: f64 = (0..self.max_retries)
            .map(|attempt| {
                (self.backoff_ms as f64 * self.multiplier.powi(attempt as i32))
                    .min(self.max_backoff_ms as f64)
                    * if self.jitter { 1.25 } else { 1.0 }
            })
            .sum();
        Duration::from_millis(total_ms.ceil() as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependency
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Lock contention, serialization conflict, connectivity blip
    Transient,
    /// Constraint violation, malformed data, authorization failure
    Permanent,
}

/// Trait for errors that know whether retrying could help
pub trait ClassifyFailure: Sized {
    fn failure_class(&self) -> FailureClass;

    /// Wrap the last transient failure once retries are exhausted
    fn exhausted(self, _operation: &str, _attempts: u32) -> Self {
        self
    }
}

/// A value (or error) together with the number of attempts it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    /// Whether at least one retry was needed
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Runs units of work under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute an async operation with retry logic
    ///
    /// # Arguments
    /// * `operation_name` - Name for logging purposes
    /// * `operation` - Produces a fresh attempt each time it is called
    ///
    /// # Returns
    /// The result and the number of attempts made. A permanent failure is
    /// returned as-is; the last transient failure after exhausting retries is
    /// passed through [`ClassifyFailure::exhausted`].
    pub async fn run<F, Fut, T, E>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> std::result::Result<Attempted<T>, Attempted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: ClassifyFailure + std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt + 1,
                    })
                }
                Err(e) => match e.failure_class() {
                    FailureClass::Permanent => {
                        debug!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "Operation failed with permanent error: {}",
                            e
                        );
                        return Err(Attempted {
                            value: e,
                            attempts: attempt + 1,
                        });
                    }
                    FailureClass::Transient => {
                        if attempt >= self.policy.max_retries {
                            warn!(
                                operation = operation_name,
                                attempts = attempt + 1,
                                "Operation failed after {} attempts: {}",
                                attempt + 1,
                                e
                            );
                            return Err(Attempted {
                                value: e.exhausted(operation_name, attempt + 1),
                                attempts: attempt + 1,
                            });
                        }

                        let backoff = self.policy.backoff_duration(attempt);

                        warn!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            max_attempts = self.policy.max_retries + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            "Retrying after transient error: {}",
                            e
                        );

                        sleep(backoff).await;
                        attempt += 1;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_duration() {
        let policy = RetryPolicy {
            backoff_ms: 1000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        // Without jitter, should be exactly: 1, 2, 4, 8, 16, 32, 60 (capped)
        assert_eq!(policy.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_duration(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_duration(6), Duration::from_secs(60)); // Capped
    }

    #[test]
    fn test_backoff_with_jitter() {
        let policy = RetryPolicy {
            backoff_ms: 1000,
            jitter: true,
            ..Default::default()
        };

        let backoff = policy.backoff_duration(0);
        assert!(backoff >= Duration::from_secs(1));
        assert!(backoff <= Duration::from_millis(1250));
    }

    #[test]
    fn test_worst_case_delay_is_bounded_by_ceiling() {
        let policy = RetryPolicy {
            max_retries: 4,
            backoff_ms: 100,
            max_backoff_ms: 250,
            multiplier: 2.0,
            jitter: false,
        };
        // 100 + 200 + 250 + 250
        assert_eq!(policy.worst_case_delay(), Duration::from_millis(800));
    }

    #[derive(Debug)]
    struct TestError {
        transient: bool,
        exhausted_after: Option<u32>,
    }

    impl TestError {
        fn transient() -> Self {
            Self {
                transient: true,
                exhausted_after: None,
            }
        }

        fn permanent() -> Self {
            Self {
                transient: false,
                exhausted_after: None,
            }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError(transient={})", self.transient)
        }
    }

    impl ClassifyFailure for TestError {
        fn failure_class(&self) -> FailureClass {
            if self.transient {
                FailureClass::Transient
            } else {
                FailureClass::Permanent
            }
        }

        fn exhausted(mut self, _operation: &str, attempts: u32) -> Self {
            self.exhausted_after = Some(attempts);
            self
        }
    }

    fn quick(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_retries,
            backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let executor = quick(5);
        let mut attempts = 0;

        let result = executor
            .run("test", || {
                attempts += 1;
                let current = attempts;
                async move {
                    if current < 3 {
                        Err(TestError::transient())
                    } else {
                        Ok("success")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "success");
        assert_eq!(result.attempts, 3);
        assert!(result.was_retried());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let executor = quick(2);
        let mut attempts = 0;

        let result: std::result::Result<Attempted<&str>, _> = executor
            .run("test", || {
                attempts += 1;
                async move { Err(TestError::transient()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(attempts, 3); // Initial + 2 retries
        assert_eq!(err.attempts, 3);
        assert_eq!(err.value.exhausted_after, Some(3));
    }

    #[tokio::test]
    async fn test_no_retry_on_permanent_error() {
        let executor = quick(5);
        let mut attempts = 0;

        let result: std::result::Result<Attempted<&str>, _> = executor
            .run("test", || {
                attempts += 1;
                async move { Err(TestError::permanent()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(attempts, 1); // No retries
        assert_eq!(err.attempts, 1);
        assert_eq!(err.value.exhausted_after, None);
    }

    #[tokio::test]
    async fn test_first_try_success_is_not_retried() {
        let executor = quick(5);
        let result = executor
            .run("test", || async { Ok::<_, TestError>(7) })
            .await
            .unwrap();
        assert_eq!(result.value, 7);
        assert!(!result.was_retried());
    }
}
