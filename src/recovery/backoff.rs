//! Linear-capped backoff curves.
//!
//! The delay before the next heal attempt grows with the number of
//! consecutive failures (`min(base * count, max)`) and is never shortened
//! while failures keep arriving. A verified success clears the counter.
use crate::config::BackoffConfig;

/// Failure family a curve applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffCurve {
    NoHealPoint,
    PlayError,
    Abort,
}

/// One backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    pub fn from_config(config: &BackoffConfig, curve: BackoffCurve) -> Self {
        match curve {
            BackoffCurve::NoHealPoint => Self::new(config.no_heal_base_ms, config.no_heal_max_ms),
            BackoffCurve::PlayError => {
                Self::new(config.play_error_base_ms, config.play_error_max_ms)
            }
            BackoffCurve::Abort => Self::new(config.abort_base_ms, config.abort_max_ms),
        }
    }

    /// Delay after `count` consecutive failures; zero for no failures.
    pub fn delay_for(&self, count: u32) -> u64 {
        self.base_ms
            .saturating_mul(u64::from(count))
            .min(self.max_ms)
    }

    /// Earliest time the next attempt is allowed.
    ///
    /// Never moves an already scheduled attempt earlier.
    pub fn next_allowed(&self, now_ms: u64, count: u32, current_ms: u64) -> u64 {
        now_ms.saturating_add(self.delay_for(count)).max(current_ms)
    }
}
