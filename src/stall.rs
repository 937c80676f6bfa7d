//! Stall handling: what happens when the watchdog confirms a stall.
//!
//! Order of business for one stall event:
//!
//! 1. ignore it while its candidate is part of a failover being verified;
//! 2. re-run selection, which may already switch away from the stalled source;
//! 3. ask the recovery policy whether a heal is allowed (quiet window, backoff);
//! 4. run the heal pipeline and route its outcome back into the policy.
use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::HealPoint;
use crate::candidate::{CandidateId, CandidateSelector};
use crate::context::EngineContext;
use crate::error::HealError;
use crate::failover::FailoverManager;
use crate::heal::{HealOutcome, HealPipeline};
use crate::monitor::StallEvent;
use crate::recovery::{EscalationStep, HealGate, RecoveryPolicy, StallContext};

/// Why a stall event did not lead to a heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallSkip {
    FailoverInFlight,
    NotActive,
    Quiet { until_ms: u64 },
    Backoff { until_ms: u64 },
    Detached,
}

/// What handling one stall event amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum StallResolution {
    Skipped(StallSkip),
    /// Selection moved the active candidate away from the stalled one.
    Switched { from: CandidateId, to: CandidateId },
    Healed(HealPoint),
    Recovered,
    AlreadyHealing,
    Escalated {
        error: HealError,
        steps: Vec<EscalationStep>,
    },
}

pub struct StallHandler {
    ctx: Arc<EngineContext>,
    selector: Arc<CandidateSelector>,
    failover: Arc<FailoverManager>,
    policy: Arc<RecoveryPolicy>,
    pipeline: Arc<HealPipeline>,
}

impl StallHandler {
    pub fn new(
        ctx: Arc<EngineContext>,
        selector: Arc<CandidateSelector>,
        failover: Arc<FailoverManager>,
        policy: Arc<RecoveryPolicy>,
        pipeline: Arc<HealPipeline>,
    ) -> Self {
        Self {
            ctx,
            selector,
            failover,
            policy,
            pipeline,
        }
    }

    pub async fn handle(&self, event: StallEvent) -> StallResolution {
        let id = event.candidate;
        if self.failover.is_involved(id) {
            debug!(candidate = %id, "stall ignored during failover verification");
            return StallResolution::Skipped(StallSkip::FailoverInFlight);
        }
        if !self.ctx.is_attached(id) {
            return StallResolution::Skipped(StallSkip::Detached);
        }

        let selection = self.selector.evaluate("stall");
        if selection.changed() && selection.previous == Some(id) {
            if let Some(to) = selection.active {
                self.start_playback(to).await;
                return StallResolution::Switched { from: id, to };
            }
        }
        if selection.active != Some(id) {
            return StallResolution::Skipped(StallSkip::NotActive);
        }

        match self.policy.heal_gate(id) {
            HealGate::Allowed => {}
            HealGate::Quiet { until_ms } => {
                return StallResolution::Skipped(StallSkip::Quiet { until_ms });
            }
            HealGate::Backoff { until_ms } => {
                return StallResolution::Skipped(StallSkip::Backoff { until_ms });
            }
        }

        let outcome = self.pipeline.heal(id).await;
        self.route(id, event, outcome).await
    }

    /// Feeds a heal outcome into the recovery policy.
    pub async fn route(&self, id: CandidateId, event: StallEvent, outcome: HealOutcome) -> StallResolution {
        match outcome {
            HealOutcome::Healed(point) => {
                self.policy.on_success(id);
                StallResolution::Healed(point)
            }
            HealOutcome::Recovered => {
                self.policy.on_success(id);
                StallResolution::Recovered
            }
            HealOutcome::AlreadyHealing => StallResolution::AlreadyHealing,
            HealOutcome::Failed(HealError::Detached) => {
                StallResolution::Skipped(StallSkip::Detached)
            }
            HealOutcome::Failed(error) => {
                let steps = match error.play_failure() {
                    Some(kind) => self.policy.on_play_failure(id, kind).await,
                    None => {
                        let stall = StallContext {
                            stall_duration_ms: event.stall_duration_ms,
                            buffer_exhausted: event.buffer_exhausted,
                        };
                        self.policy.on_no_heal_point(id, stall).await
                    }
                };
                if !steps.is_empty() {
                    info!(candidate = %id, error = error.as_str(), steps = ?steps, "escalated");
                }
                StallResolution::Escalated { error, steps }
            }
        }
    }

    /// Self-recovery reported by the watchdog counts as a verified success.
    pub fn on_recovered(&self, id: CandidateId) {
        self.policy.on_success(id);
    }

    async fn start_playback(&self, id: CandidateId) {
        if let Some(surface) = self.ctx.surface(id) {
            if let Err(err) = surface.play().await {
                debug!(candidate = %id, error = %err, "play after switch failed");
            }
        }
    }
}

