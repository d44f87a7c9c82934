use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::config::{AutomationSection, RetrySection};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl RetryPolicy {
    /// Attempt-level policy: one initial try plus `max_retries` retries.
    pub fn new(config: &RetrySection) -> Self {
        let mut schedule = config
            .backoff_seconds
            .iter()
            .map(|seconds| Duration::from_secs(*seconds))
            .collect::<Vec<_>>();
        if schedule.is_empty() {
            schedule.push(Duration::from_secs(5));
        }
        Self {
            max_attempts: config.max_retries as usize + 1,
            schedule,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Element-location policy: doubles the base delay after every miss.
    pub fn for_elements(config: &AutomationSection) -> Self {
        Self::exponential(config.element_retries.max(1) as usize, config.element_backoff())
    }

    pub fn exponential(max_attempts: usize, base: Duration) -> Self {
        let max_attempts = max_attempts.max(1);
        let schedule = (0..max_attempts.saturating_sub(1).max(1))
            .map(|step| base.saturating_mul(1u32 << step.min(16)))
            .collect();
        Self {
            max_attempts,
            schedule,
            jitter: Duration::ZERO,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn max_retries(&self) -> u32 {
        (self.max_attempts - 1) as u32
    }

    /// Delay before retry number `retry` (1-based), jitter included.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let index = (retry as usize - 1).min(self.schedule.len() - 1);
        let mut delay = self.schedule.get(index).copied().unwrap_or_default();
        if !self.jitter.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }

    /// Runs `operation` until it succeeds, `retryable` rejects the error, or
    /// attempts run out.
    pub async fn run<F, Fut, T, E, R>(&self, mut operation: F, retryable: R) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    })
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt as u32);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn schedule_repeats_last_step() {
        let policy = RetryPolicy::new(&RetrySection {
            max_retries: 4,
            backoff_seconds: vec![1, 3],
            jitter_ms: 0,
        });
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
    }

    #[test]
    fn exponential_doubles() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10));
        let calls = AtomicUsize::new(0);
        let result: Result<RetryOutcome<()>, &str> = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("missing") }
                },
                |_| true,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_stop_immediately() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(10));
        let calls = AtomicUsize::new(0);
        let result: Result<RetryOutcome<()>, &str> = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal") }
                },
                |err| *err != "fatal",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_attempt_count_on_success() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(10));
        let outcome = policy
            .run(
                |attempt| async move {
                    if attempt < 2 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                },
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, 2);
    }
}
