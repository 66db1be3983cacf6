use std::future::Future;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::error::Transient;

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Total operation invocations before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Randomization applied to every delay, as a +/- fraction.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// How a retried operation ultimately failed
#[derive(Debug, Error)]
pub enum RetryFailure<E: std::fmt::Display + std::fmt::Debug> {
    /// The admission gate closed; no further attempts were made.
    #[error("aborted by admission gate after {attempts} attempt(s)")]
    Aborted { attempts: u32 },

    /// The error class does not warrant a retry.
    #[error("non-retryable error on attempt {attempts}: {error}")]
    Fatal { attempts: u32, error: E },

    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

/// Result of a retried operation plus attempt accounting
#[derive(Debug)]
pub struct RetryOutcome<T, E: std::fmt::Display + std::fmt::Debug> {
    pub attempts: u32,
    pub total_backoff_ms: u64,
    pub result: Result<T, RetryFailure<E>>,
}

/// Exponential-backoff retry wrapper.
///
/// The admission predicate is re-checked before every attempt, first one
/// included, so a circuit breaker tripping mid-backoff stops the loop
/// instead of letting a doomed attempt through.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<T, E, F, Fut, A>(
        &self,
        label: &str,
        admission: A,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        E: Transient + std::fmt::Display + std::fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Fn() -> bool,
    {
        let mut attempts: u32 = 0;
        let mut total_backoff_ms: u64 = 0;
        loop {
            if !admission() {
                warn!(label, attempts, "retry aborted by admission gate");
                return RetryOutcome {
                    attempts,
                    total_backoff_ms,
                    result: Err(RetryFailure::Aborted { attempts }),
                };
            }

            attempts += 1;
            match operation().await {
                Ok(value) => {
                    debug!(label, attempts, "operation succeeded");
                    return RetryOutcome {
                        attempts,
                        total_backoff_ms,
                        result: Ok(value),
                    };
                }
                Err(error) if !error.is_transient() => {
                    warn!(label, attempts, %error, "non-retryable failure");
                    return RetryOutcome {
                        attempts,
                        total_backoff_ms,
                        result: Err(RetryFailure::Fatal { attempts, error }),
                    };
                }
                Err(error) => {
                    if attempts >= self.policy.max_attempts {
                        warn!(label, attempts, %error, "retries exhausted");
                        return RetryOutcome {
                            attempts,
                            total_backoff_ms,
                            result: Err(RetryFailure::Exhausted {
                                attempts,
                                last_error: error,
                            }),
                        };
                    }
                    let delay_ms = self.backoff_delay_ms(attempts);
                    warn!(
                        label,
                        attempt = attempts,
                        delay_ms,
                        %error,
                        "transient failure, backing off"
                    );
                    total_backoff_ms += delay_ms;
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Delay before the attempt following `completed` attempts:
    /// initial * multiplier^(completed-1), capped, then jittered.
    fn backoff_delay_ms(&self, completed: u32) -> u64 {
        let exponent = completed.saturating_sub(1).min(32) as i32;
        let base =
            self.policy.initial_delay_ms as f64 * self.policy.backoff_multiplier.powi(exponent);
        let capped = base.min(self.policy.max_delay_ms as f64);
        let jitter = self.policy.jitter.clamp(0.0, 0.99);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        (capped * factor).round().max(0.0) as u64
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
