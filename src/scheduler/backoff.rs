//! Retry delay policy for failed fetches.

use std::time::Duration;

/// Exponential backoff: `min(base ^ error_count, cap)` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: f64,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(2.0, Duration::from_secs(30))
    }
}

impl Backoff {
    pub const fn new(base: f64, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Builds a policy from configuration seconds. An unusable cap falls back to 30s.
    pub fn from_secs(base: f64, cap_secs: f64) -> Self {
        let cap = Duration::try_from_secs_f64(cap_secs).unwrap_or(Duration::from_secs(30));
        Self::new(base, cap)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before retry number `error_count` (1 for the first failure).
    pub fn delay(&self, error_count: u32) -> Duration {
        let exponent = i32::try_from(error_count).unwrap_or(i32::MAX);
        // f64::min ignores NaN, so a nonsense base still lands on the cap
        let secs = self.base.powi(exponent).min(self.cap.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.cap)
    }
}
