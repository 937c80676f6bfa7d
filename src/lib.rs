//! Multi-candidate stream health supervision.
//!
//! Watches several playback surfaces showing the same live stream, detects
//! stalls, heals them by seeking across buffer gaps, and fails over to a
//! healthier candidate when healing keeps failing. Escalation goes through
//! backoff, quiet windows, probation, verified failover, emergency switches
//! and finally a refresh request to the host.

pub mod buffer;
pub mod candidate;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod failover;
pub mod heal;
pub mod monitor;
pub mod recovery;
pub mod sim;
pub mod stall;
pub mod surface;

pub use buffer::{find_heal_point, HeadroomMode, HealPoint};
pub use candidate::{
    CandidateId, CandidateScore, CandidateSelector, SelectionOutcome, SwitchKind,
};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ConfigError, EngineConfig};
pub use context::EngineContext;
pub use engine::{DiscoveryEvent, EngineBuilder, StreamEngine};
pub use error::{EngineError, HealError};
pub use events::{DiagnosticEvent, DiagnosticRecord, EventSink, MemorySink, TracingSink};
pub use failover::{FailoverManager, FailoverRefusal, FailoverResolution};
pub use heal::{HealOutcome, HealPipeline};
pub use monitor::{MonitorState, PlaybackState, StallEvent, WatchdogEvent};
pub use recovery::{EscalationStep, FailureKind, RecoveryPolicy, RefreshReason, RefreshRequester};
pub use sim::SimulatedSurface;
pub use stall::{StallHandler, StallResolution, StallSkip};
pub use surface::{PlaybackSurface, ReadyState, SurfaceError, SurfaceSnapshot, TimeRange};
