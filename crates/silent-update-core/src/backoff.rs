use std::time::Duration;

use rand::Rng;

use crate::config::UpdaterConfig;
use crate::error::ErrorClass;

const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(10);
const RATE_LIMIT_FLOOR_SPREAD: Duration = Duration::from_secs(5);

/// Exponential backoff with additive jitter: `base * 2^attempt + rand(0..=jitter)`,
/// never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_jitter: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, cap: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            cap,
            max_jitter,
        }
    }

    #[must_use]
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            Duration::from_millis(config.jitter_ms),
        )
    }

    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, random_up_to(self.max_jitter))
    }

    /// Delay before retrying after a failure of `class`. Rate limiting raises
    /// the floor to somewhere between 10 and 15 seconds.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        let delay = self.delay(attempt);
        if class == ErrorClass::RateLimited {
            let floor = RATE_LIMIT_FLOOR + random_up_to(RATE_LIMIT_FLOOR_SPREAD);
            delay.max(floor).min(self.cap)
        } else {
            delay
        }
    }

    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .saturating_mul(factor)
            .saturating_add(jitter.min(self.max_jitter))
            .min(self.cap)
    }
}

fn random_up_to(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
