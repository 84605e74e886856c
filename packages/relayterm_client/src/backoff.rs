use rand::Rng;
use std::time::Duration;

/// Capped exponential reconnect delay with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Fraction of the delay randomly added or removed, 0.0 to 1.0.
    pub jitter: f64,
    /// Retries before giving up. None retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), or None once exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt > max_attempts {
                return None;
            }
        }

        let exponent = attempt.saturating_sub(1).min(31);
        let nominal = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return Some(nominal);
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Some(nominal.mul_f64(factor).min(self.max))
    }
}
