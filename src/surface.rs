//! Playback surface collaborator.
//!
//! A surface is one media source the host exposes (a media element, a decoder
//! session). The engine only reads its status and asks it to seek or play; it
//! never owns the media pipeline behind it.
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Readiness ladder reported by the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

/// Network activity reported by the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Empty = 0,
    Idle = 1,
    Loading = 2,
    NoSource = 3,
}

/// Half-open buffered interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start && position <= self.end
    }

    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0.0
    }
}

/// Failures reported by `play()`/`load()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SurfaceError {
    /// The request was interrupted (a newer seek/load, a pause).
    #[error("aborted: {0}")]
    Aborted(String),
    /// The host refused to start playback.
    #[error("not allowed: {0}")]
    NotAllowed(String),
    /// The player reported an error.
    #[error("player error: {0}")]
    Player(String),
    /// The surface is no longer attached.
    #[error("surface detached")]
    Detached,
}

impl SurfaceError {
    /// Abort-class errors are retried once and use the lenient backoff curve.
    pub fn is_abort(&self) -> bool {
        matches!(self, SurfaceError::Aborted(_))
    }
}

/// Media source under supervision.
#[async_trait]
pub trait PlaybackSurface: Send + Sync {
    /// Identity of the underlying surface; at most one candidate exists per key.
    fn key(&self) -> &str;
    /// Playhead position in seconds.
    fn current_time(&self) -> f64;
    fn set_current_time(&self, seconds: f64);
    fn paused(&self) -> bool;
    fn ended(&self) -> bool;
    fn ready_state(&self) -> ReadyState;
    fn network_state(&self) -> NetworkState;
    /// Ordered, non-overlapping buffered ranges.
    fn buffered(&self) -> Vec<TimeRange>;
    /// Opaque source identity; empty when no source is set.
    fn current_src(&self) -> String;
    /// Whether the surface is still part of the host page.
    fn is_attached(&self) -> bool;
    /// Media error currently reported by the surface, if any.
    fn error(&self) -> Option<String> {
        None
    }
    async fn play(&self) -> Result<(), SurfaceError>;
    async fn load(&self) -> Result<(), SurfaceError>;
}

/// Point-in-time copy of everything the pure analysis functions read.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceSnapshot {
    pub current_time: f64,
    pub paused: bool,
    pub ended: bool,
    pub ready_state: ReadyState,
    pub network_state: NetworkState,
    pub buffered: Vec<TimeRange>,
    pub current_src: String,
    pub attached: bool,
    pub error: Option<String>,
}

impl SurfaceSnapshot {
    pub fn capture(surface: &dyn PlaybackSurface) -> Self {
        Self {
            current_time: surface.current_time(),
            paused: surface.paused(),
            ended: surface.ended(),
            ready_state: surface.ready_state(),
            network_state: surface.network_state(),
            buffered: surface.buffered(),
            current_src: surface.current_src(),
            attached: surface.is_attached(),
            error: surface.error(),
        }
    }

    pub fn has_source(&self) -> bool {
        !self.current_src.is_empty()
    }

    /// Seconds of contiguous buffer ahead of the playhead.
    pub fn buffer_ahead(&self) -> f64 {
        crate::buffer::buffer_ahead(&self.buffered, self.current_time)
    }

    /// Source was dropped: no source and no data.
    pub fn is_reset(&self) -> bool {
        !self.has_source() && self.ready_state == ReadyState::HaveNothing
    }
}
