use std::time::Duration;

use tokio_retry2::strategy::{jitter_range, ExponentialBackoff};
use tracing::debug;

/// Decides whether a disconnected bridge should attempt a reconnect right
/// now, given how many attempts have already been made this outage and how
/// long ago the last one was.
pub trait ReconnectRetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, current_retry_count: u32, ms_since_last_retry: u64) -> bool;
}

impl<F> ReconnectRetryPolicy for F
where
    F: Fn(u32, u64) -> bool + Send + Sync + 'static,
{
    fn should_retry(&self, current_retry_count: u32, ms_since_last_retry: u64) -> bool {
        self(current_retry_count, ms_since_last_retry)
    }
}

const EXPONENT_BASE: u32 = 2;
const FACTOR: u32 = 100;
const NUMBER_OF_RETRIES: u32 = 5;
const DEFAULT_JITTER_PERCENT: u32 = 20;
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Exponential backoff with jitter: `factor * base^n` milliseconds for the
/// first `number_of_retries` attempts, then a constant tail at the cap so a
/// long outage keeps being probed.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoffPolicy {
    factor: u32,
    exponent_base: u32,
    number_of_retries: u32,
    jitter_percent: u32,
}

impl ExponentialBackoffPolicy {
    pub fn new(
        exponent_base: u32,
        factor: u32,
        number_of_retries: u32,
        jitter_percent: Option<u32>,
    ) -> Self {
        let exponent_base = if exponent_base > 0 {
            exponent_base
        } else {
            EXPONENT_BASE
        };
        let factor = if factor > 0 { factor } else { FACTOR };
        let policy = ExponentialBackoffPolicy {
            factor,
            exponent_base,
            number_of_retries,
            jitter_percent: jitter_percent.unwrap_or(DEFAULT_JITTER_PERCENT),
        };
        debug!("reconnect policy: {:?}", policy);
        policy
    }

    /// Unjittered delay before attempt number `attempt`, capped.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.number_of_retries);
        let millis = (self.factor as u64)
            .saturating_mul((self.exponent_base as u64).saturating_pow(exponent));
        Duration::from_millis(millis).min(MAX_BACKOFF)
    }

    /// Jittered sleep iterator for in-task waits: bounded attempts followed
    /// by a constant tail at the final delay.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base_backoff =
            ExponentialBackoff::from_millis(self.exponent_base as u64).factor(self.factor as u64);

        let jitter_fraction = self.jitter_percent as f64 / 100.0;
        let jitter_fn = jitter_range(1.0 - jitter_fraction, 1.0 + jitter_fraction);

        let tail = self.delay_for(self.number_of_retries);
        base_backoff
            .map(jitter_fn)
            .map(|d| d.min(MAX_BACKOFF))
            .take(self.number_of_retries as usize)
            .chain(std::iter::repeat(tail))
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        ExponentialBackoffPolicy::new(
            EXPONENT_BASE,
            FACTOR,
            NUMBER_OF_RETRIES,
            Some(DEFAULT_JITTER_PERCENT),
        )
    }
}

impl ReconnectRetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, current_retry_count: u32, ms_since_last_retry: u64) -> bool {
        ms_since_last_retry >= self.delay_for(current_retry_count).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = ExponentialBackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), policy.delay_for(11));
        assert!(policy.delay_for(10) <= MAX_BACKOFF);
    }

    #[test]
    fn should_retry_gates_on_elapsed_time() {
        let policy = ExponentialBackoffPolicy::default();
        assert!(!policy.should_retry(1, 50));
        assert!(policy.should_retry(1, 250));
        // Deep into an outage the cap applies.
        assert!(policy.should_retry(30, MAX_BACKOFF.as_millis() as u64));
    }

    #[test]
    fn delay_iterator_has_a_constant_tail() {
        let policy = ExponentialBackoffPolicy::default();
        let delays: Vec<_> = policy.delays().take(10).collect();
        assert_eq!(delays.len(), 10);
        assert_eq!(delays[6], delays[9]);
        assert!(delays.iter().all(|d| *d <= MAX_BACKOFF));
    }

    #[test]
    fn closures_are_policies() {
        let policy = |count: u32, _ms: u64| count < 3;
        assert!(policy.should_retry(0, 0));
        assert!(!policy.should_retry(3, 10_000));
    }
}
