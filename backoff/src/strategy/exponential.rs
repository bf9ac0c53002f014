use std::time::Duration;

use rand::Rng;

/// Exponential cool-off: the n-th delay is `base * factor^(n-1)`, capped at `cap`.
///
/// With a non-zero jitter `j` every delay is scaled by a random factor drawn from
/// `[1 - j, 1 + j]` before capping. Without `max_attempts` the iterator never ends.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::new(Duration::from_millis(100), Duration::from_secs(1), 2.0)
///     .max_attempts(4)
///     .collect();
/// assert_eq!(delays.len(), 4);
/// assert_eq!(delays[3], Duration::from_millis(800));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(base: Duration, cap: Duration, factor: f64) -> Self {
        Self {
            base,
            cap,
            factor,
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, cap_ms: u64, factor: f64) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            factor,
        )
    }

    /// Randomize every delay by `±jitter` (clamped to `0.0..=1.0`).
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Stop after `attempts` delays.
    pub fn max_attempts(mut self, attempts: u16) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn delay(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.saturating_sub(1));
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }

        // `as` saturates for out of range floats, so a runaway exponent just hits the cap.
        Duration::from_millis(millis as u64).min(self.cap)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}
