//! Heal pipeline and the post-heal catch-up pass.
use serde::Serialize;

use crate::buffer::HealPoint;
use crate::error::HealError;

pub mod catch_up;
pub mod pipeline;

pub use catch_up::{plan_catch_up, CatchUpScheduler};
pub use pipeline::HealPipeline;

/// Result of one heal attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum HealOutcome {
    /// Seeked to the point and playback was requested successfully.
    Healed(HealPoint),
    /// The candidate resumed on its own before the seek.
    Recovered,
    /// Another heal for this candidate is still running.
    AlreadyHealing,
    Failed(HealError),
}

impl HealOutcome {
    pub fn kind(&self) -> HealOutcomeKind {
        match self {
            HealOutcome::Healed(_) => HealOutcomeKind::Healed,
            HealOutcome::Recovered => HealOutcomeKind::Recovered,
            HealOutcome::AlreadyHealing => HealOutcomeKind::AlreadyHealing,
            HealOutcome::Failed(err) => match err {
                HealError::NoHealPoint => HealOutcomeKind::NoHealPoint,
                HealError::StaleGone => HealOutcomeKind::StaleGone,
                HealError::AbortError(_) => HealOutcomeKind::AbortError,
                HealError::PlayStuck { .. } => HealOutcomeKind::PlayStuck,
                HealError::PlayFailed(_) => HealOutcomeKind::PlayFailed,
                HealError::Detached => HealOutcomeKind::Detached,
            },
        }
    }

    pub fn point(&self) -> Option<HealPoint> {
        match self {
            HealOutcome::Healed(point) => Some(*point),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, HealOutcome::Healed(_) | HealOutcome::Recovered)
    }
}

/// Flat outcome label carried by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealOutcomeKind {
    Healed,
    Recovered,
    AlreadyHealing,
    NoHealPoint,
    StaleGone,
    AbortError,
    PlayStuck,
    PlayFailed,
    Detached,
}
