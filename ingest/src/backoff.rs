//! Exponential backoff with a per-attempt cap and a total time budget.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Time after which no further attempt is scheduled.
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
            total_budget: Duration::from_secs(120),
        }
    }
}

/// Config file representation of a [`RetryPolicy`], in milliseconds.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub total_budget_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            total_budget_ms: policy.total_budget.as_millis() as u64,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            total_budget: Duration::from_millis(config.total_budget_ms),
        }
    }
}

/// Retry state: attempts made, the delay before the next one, and the deadline.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    max_delay: Duration,
    deadline: Instant,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            next: policy.initial_delay,
            max_delay: policy.max_delay,
            deadline: Instant::now() + policy.total_budget,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if Instant::now() >= self.deadline {
            return None;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max_delay);
        Some(delay)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    #[error("retry cancelled")]
    Cancelled,
}

/// Runs `op` until it succeeds, the budget is spent, or `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(policy);
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(delay) = backoff.next_delay() else {
            return Err(RetryError::Exhausted {
                attempts: backoff.attempts(),
                last: err,
            });
        };
        tracing::warn!(
            what,
            attempt = backoff.attempts(),
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(initial_ms: u64, max_ms: u64, budget_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            total_budget: Duration::from_millis(budget_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delays_double_up_to_cap() {
        let mut backoff = Backoff::new(&RetryPolicy::default());
        let delays: Vec<u128> = (0..7)
            .map(|_| backoff.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![300, 600, 1200, 2400, 4800, 5000, 5000]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_ends_retries() {
        let mut backoff = Backoff::new(&policy(1000, 1000, 3000));
        assert!(backoff.next_delay().is_some());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = retry_with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "test",
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0..=2 => Err(io::Error::other("refused")),
                    n => Ok(n),
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2200), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_with_last_error() {
        let start = Instant::now();
        let result: Result<(), _> = retry_with_backoff(
            &policy(100, 100, 1000),
            &CancellationToken::new(),
            "test",
            || async { Err(io::Error::other("refused")) },
        )
        .await;

        let Err(RetryError::Exhausted { attempts, last }) = result else {
            panic!("expected exhaustion");
        };
        assert!(attempts >= 2);
        assert_eq!(last.to_string(), "refused");
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = retry_with_backoff(
            &policy(10_000, 10_000, 120_000),
            &cancel,
            "test",
            || async { Err(io::Error::other("refused")) },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn config_converts_to_policy() {
        assert_eq!(RetryPolicy::from(RetryConfig::default()), RetryPolicy::default());
    }
}
