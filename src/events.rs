//! Diagnostic facts emitted at decision points.
//!
//! The engine never formats diagnostics. Each decision produces a typed
//! [`DiagnosticEvent`], stamped with the engine session id and clock time, and
//! hands it to an injected [`EventSink`]. High-frequency facts (switch
//! suppressions) are aggregated by [`RateLimitedTally`] before they are emitted.
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::buffer::HealPoint;
use crate::candidate::selector::{SuppressionCause, SwitchKind};
use crate::candidate::CandidateId;
use crate::failover::FailoverRefusal;
use crate::heal::HealOutcomeKind;
use crate::monitor::{PauseAttribution, PlaybackState};
use crate::recovery::{FailureKind, RefreshReason};

/// Why a candidate left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Detached,
    Deregistered,
    Pruned,
}

/// How an active candidate was chosen when none was valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoptionSource {
    LastGood,
    Preferred,
}

/// Count of one suppression cause within a reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuppressionCount {
    pub cause: SuppressionCause,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    CandidateAdded {
        candidate: CandidateId,
        src: String,
    },
    CandidateRemoved {
        candidate: CandidateId,
        reason: RemovalReason,
    },
    ActiveAdopted {
        candidate: CandidateId,
        via: AdoptionSource,
    },
    CandidateSwitched {
        from: Option<CandidateId>,
        to: CandidateId,
        switch: SwitchKind,
        reason: String,
        score_delta: i32,
    },
    SwitchSuppressed {
        causes: Vec<SuppressionCount>,
    },
    StateChanged {
        candidate: CandidateId,
        from: PlaybackState,
        to: PlaybackState,
    },
    StallDetected {
        candidate: CandidateId,
        stall_duration_ms: u64,
        buffer_exhausted: bool,
        pause: PauseAttribution,
    },
    CandidateRecovered {
        candidate: CandidateId,
    },
    HealStarted {
        candidate: CandidateId,
    },
    HealFinished {
        candidate: CandidateId,
        outcome: HealOutcomeKind,
        point: Option<HealPoint>,
        duration_ms: u64,
    },
    BackoffApplied {
        candidate: CandidateId,
        failure: FailureKind,
        count: u32,
        delay_ms: u64,
    },
    BackoffReset {
        candidate: CandidateId,
    },
    QuietWindowEntered {
        candidate: CandidateId,
        until_ms: u64,
    },
    RefreshWindowOpened {
        candidate: CandidateId,
        until_ms: u64,
    },
    ProbationOpened {
        reason: String,
        until_ms: u64,
    },
    CandidateMarkedDead {
        candidate: CandidateId,
        until_ms: u64,
    },
    FailoverStarted {
        from: CandidateId,
        to: CandidateId,
        reason: String,
    },
    FailoverSucceeded {
        from: CandidateId,
        to: CandidateId,
    },
    FailoverReverted {
        from: CandidateId,
        to: CandidateId,
    },
    FailoverRefused {
        from: CandidateId,
        refusal: FailoverRefusal,
    },
    EmergencySwitch {
        from: CandidateId,
        to: CandidateId,
        relaxed_readiness: bool,
    },
    CandidateProbed {
        candidate: CandidateId,
    },
    CatchUpApplied {
        candidate: CandidateId,
        from_s: f64,
        to_s: f64,
    },
    RefreshRequested {
        reason: RefreshReason,
    },
}

impl DiagnosticEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticEvent::CandidateAdded { .. } => "candidate_added",
            DiagnosticEvent::CandidateRemoved { .. } => "candidate_removed",
            DiagnosticEvent::ActiveAdopted { .. } => "active_adopted",
            DiagnosticEvent::CandidateSwitched { .. } => "candidate_switched",
            DiagnosticEvent::SwitchSuppressed { .. } => "switch_suppressed",
            DiagnosticEvent::StateChanged { .. } => "state_changed",
            DiagnosticEvent::StallDetected { .. } => "stall_detected",
            DiagnosticEvent::CandidateRecovered { .. } => "candidate_recovered",
            DiagnosticEvent::HealStarted { .. } => "heal_started",
            DiagnosticEvent::HealFinished { .. } => "heal_finished",
            DiagnosticEvent::BackoffApplied { .. } => "backoff_applied",
            DiagnosticEvent::BackoffReset { .. } => "backoff_reset",
            DiagnosticEvent::QuietWindowEntered { .. } => "quiet_window_entered",
            DiagnosticEvent::RefreshWindowOpened { .. } => "refresh_window_opened",
            DiagnosticEvent::ProbationOpened { .. } => "probation_opened",
            DiagnosticEvent::CandidateMarkedDead { .. } => "candidate_marked_dead",
            DiagnosticEvent::FailoverStarted { .. } => "failover_started",
            DiagnosticEvent::FailoverSucceeded { .. } => "failover_succeeded",
            DiagnosticEvent::FailoverReverted { .. } => "failover_reverted",
            DiagnosticEvent::FailoverRefused { .. } => "failover_refused",
            DiagnosticEvent::EmergencySwitch { .. } => "emergency_switch",
            DiagnosticEvent::CandidateProbed { .. } => "candidate_probed",
            DiagnosticEvent::CatchUpApplied { .. } => "catch_up_applied",
            DiagnosticEvent::RefreshRequested { .. } => "refresh_requested",
        }
    }
}

/// Event stamped with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub session_id: Uuid,
    pub at_ms: u64,
    pub event: DiagnosticEvent,
}

/// Consumer of diagnostic records (logging, telemetry, tests).
pub trait EventSink: Send + Sync {
    fn record(&self, record: DiagnosticRecord);
}

/// Forwards records to `tracing`, choosing the level by severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, record: DiagnosticRecord) {
        let name = record.event.name();
        match &record.event {
            DiagnosticEvent::RefreshRequested { .. }
            | DiagnosticEvent::EmergencySwitch { .. }
            | DiagnosticEvent::FailoverReverted { .. }
            | DiagnosticEvent::QuietWindowEntered { .. } => tracing::warn!(
                session = %record.session_id,
                at_ms = record.at_ms,
                event = name,
                detail = ?record.event
            ),
            DiagnosticEvent::StateChanged { .. }
            | DiagnosticEvent::HealStarted { .. }
            | DiagnosticEvent::BackoffApplied { .. }
            | DiagnosticEvent::BackoffReset { .. } => tracing::debug!(
                session = %record.session_id,
                at_ms = record.at_ms,
                event = name,
                detail = ?record.event
            ),
            _ => tracing::info!(
                session = %record.session_id,
                at_ms = record.at_ms,
                event = name,
                detail = ?record.event
            ),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.records
            .lock()
            .iter()
            .map(|record| record.event.clone())
            .collect()
    }

    /// Number of recorded events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.event.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, record: DiagnosticRecord) {
        self.records.lock().push(record);
    }
}

/// Session-stamping front of a sink.
#[derive(Clone)]
pub struct EventBus {
    session_id: Uuid,
    sink: Arc<dyn EventSink>,
}

impl EventBus {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            sink,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn emit(&self, at_ms: u64, event: DiagnosticEvent) {
        self.sink.record(DiagnosticRecord {
            session_id: self.session_id,
            at_ms,
            event,
        });
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Counts occurrences per key and releases them at most once per interval.
#[derive(Debug)]
pub struct RateLimitedTally<K: Ord + Copy> {
    interval_ms: u64,
    last_flush_ms: Option<u64>,
    counts: BTreeMap<K, u32>,
}

impl<K: Ord + Copy> RateLimitedTally<K> {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_flush_ms: None,
            counts: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, key: K) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    /// Drains the counts when the interval elapsed since the previous flush.
    pub fn flush_if_due(&mut self, now_ms: u64) -> Option<Vec<(K, u32)>> {
        if self.counts.is_empty() {
            return None;
        }
        let due = self
            .last_flush_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.interval_ms);
        if !due {
            return None;
        }
        self.last_flush_ms = Some(now_ms);
        Some(std::mem::take(&mut self.counts).into_iter().collect())
    }

    pub fn pending(&self, key: K) -> u32 {
        self.counts.get(&key).copied().unwrap_or(0)
    }
}
