use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            // Never retry sooner than half the exponential step.
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

/// What to do with an action after a retryable delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again no earlier than `retry_at` (unix seconds).
    RetryAt(i64),
    /// Attempts exhausted; the action needs attention.
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(300), true),
            8,
        )
    }
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` counts failures so far, including the one just observed.
    pub fn decide(&self, attempt: u32, now: i64) -> RetryDecision {
        let mut rng = rand::thread_rng();
        self.decide_with_rng(attempt, now, &mut rng)
    }

    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        now: i64,
        rng: &mut R,
    ) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self
            .backoff
            .delay_with_rng(attempt.saturating_sub(1), rng);
        // Round up so a sub-second delay still lands in the future.
        let secs = delay.as_millis().div_ceil(1000).min(i64::MAX as u128) as i64;
        RetryDecision::RetryAt(now.saturating_add(secs))
    }
}
