use std::time::Duration;

use rand::Rng;

const FACTOR: f64 = 2.0;

/// Delay for attempt `n` (1-based) is `base * 2^(n - 1)`, randomized by `jitter` and capped
/// at `max`.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<Duration> = Exponential::new(Duration::from_millis(100), Duration::from_secs(1))
///     .max_attempts(5)
///     .collect();
/// assert_eq!(delays.len(), 5);
/// assert_eq!(delays[0], Duration::from_millis(100));
/// assert_eq!(delays[4], Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    max: Duration,
    /// Between 0.0 and 1.0. The delay is multiplied by a random value in `[1 - jitter, 1 + jitter]`.
    jitter: f64,
    /// None retries forever.
    max_attempts: Option<usize>,
    attempt: usize,
}

impl Exponential {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let mut delay_ms = self.base.as_millis() as f64 * FACTOR.powi(exponent);

        if self.jitter > 0.0 {
            delay_ms *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }

        // f64 -> u64 saturates, so an overflowing power still ends up at the cap.
        Duration::from_millis(delay_ms as u64).min(self.max)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let delays: Vec<u128> = Exponential::from_millis(50, 300)
            .max_attempts(5)
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut backoff = Exponential::from_millis(1, 10).max_attempts(2);
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_none());
        assert!(backoff.next().is_none());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Exponential::from_millis(1000, 60_000)
            .jitter(0.25)
            .max_attempts(50);
        for delay in backoff {
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(60_000));
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let backoff = Exponential::from_millis(10, 5_000);
        assert_eq!(backoff.delay_for(10_000), Duration::from_millis(5_000));
    }
}
