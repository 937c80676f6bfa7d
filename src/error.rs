use thiserror::Error;

use crate::candidate::CandidateId;
use crate::config::ConfigError;
use crate::recovery::FailureKind;
use crate::surface::SurfaceError;

/// Ways a heal attempt can fail. None of them is fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HealError {
    #[error("no heal point with enough headroom")]
    NoHealPoint,
    #[error("heal point vanished before the seek")]
    StaleGone,
    #[error("seek or play aborted: {0}")]
    AbortError(SurfaceError),
    #[error("seeked to the same heal point {repeats} times without resuming")]
    PlayStuck { repeats: u32 },
    #[error("playback failed after seek: {0}")]
    PlayFailed(SurfaceError),
    #[error("candidate detached")]
    Detached,
}

impl HealError {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealError::NoHealPoint => "no_heal_point",
            HealError::StaleGone => "stale_gone",
            HealError::AbortError(_) => "abort_error",
            HealError::PlayStuck { .. } => "play_stuck",
            HealError::PlayFailed(_) => "play_failed",
            HealError::Detached => "detached",
        }
    }

    /// Play-failure family for errors raised after a seek target was chosen.
    pub fn play_failure(&self) -> Option<FailureKind> {
        match self {
            HealError::AbortError(_) => Some(FailureKind::Aborted),
            HealError::PlayFailed(_) => Some(FailureKind::PlayerError),
            HealError::PlayStuck { .. } => Some(FailureKind::Stuck),
            HealError::NoHealPoint | HealError::StaleGone | HealError::Detached => None,
        }
    }
}

impl From<SurfaceError> for HealError {
    fn from(err: SurfaceError) -> Self {
        match err {
            SurfaceError::Detached => HealError::Detached,
            err if err.is_abort() => HealError::AbortError(err),
            err => HealError::PlayFailed(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown candidate {0}")]
    UnknownCandidate(CandidateId),
    #[error("no candidate wraps surface {0:?}")]
    UnknownKey(String),
    #[error("engine is shut down")]
    ShutDown,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
