//! Recovery policy: backoff bookkeeping and the escalation ladder.
//!
//! Every failed heal lands here. The failure counter for its family is bumped,
//! the next heal is pushed out along the matching backoff curve, and the
//! escalation ladder is planned from the current counters. Steps are tried
//! from least to most disruptive:
//!
//! 1. quiet window (single candidate, extreme failure count)
//! 2. refresh-eligibility window
//! 3. probation
//! 4. verified failover
//! 5. emergency switch
//! 6. emergency switch with relaxed readiness
//! 7. refresh request
//!
//! Quiet window, failover, both emergency switches and refresh are
//! disruptive: the first one that takes effect ends the cycle. The refresh
//! window and probation only widen what later steps and selection may do.
use std::cmp::Reverse;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::candidate::{CandidateId, CandidateScore, CandidateSelector, ScoreFactor, SwitchKind};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::events::DiagnosticEvent;
use crate::failover::FailoverManager;
use crate::recovery::backoff::{Backoff, BackoffCurve};
use crate::surface::ReadyState;

/// Failure family routed to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoHealPoint,
    /// Seek or play interrupted (abort-class).
    Aborted,
    /// Explicit player error after seeking.
    PlayerError,
    /// Repeated seeks to the same heal point.
    Stuck,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoHealPoint => "no_heal_point",
            FailureKind::Aborted => "aborted",
            FailureKind::PlayerError => "player_error",
            FailureKind::Stuck => "stuck",
        }
    }

    fn curve(self) -> BackoffCurve {
        match self {
            FailureKind::NoHealPoint => BackoffCurve::NoHealPoint,
            FailureKind::Aborted => BackoffCurve::Abort,
            FailureKind::PlayerError | FailureKind::Stuck => BackoffCurve::PlayError,
        }
    }
}

/// Why a hard reload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    NoHealPoint,
    PlayStuck,
}

impl RefreshReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshReason::NoHealPoint => "no_heal_point",
            RefreshReason::PlayStuck => "play_stuck",
        }
    }
}

/// External collaborator able to hard-reload the playback page.
pub trait RefreshRequester: Send + Sync {
    fn request_refresh(&self, reason: RefreshReason);
}

/// Refresh requester that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRefresher;

impl RefreshRequester for LogRefresher {
    fn request_refresh(&self, reason: RefreshReason) {
        warn!(reason = reason.as_str(), "refresh requested");
    }
}

/// Whether a heal may start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealGate {
    Allowed,
    Quiet { until_ms: u64 },
    Backoff { until_ms: u64 },
}

impl HealGate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, HealGate::Allowed)
    }
}

/// Stall facts accompanying a no-heal-point failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StallContext {
    pub stall_duration_ms: u64,
    pub buffer_exhausted: bool,
}

/// One rung of the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStep {
    QuietWindow,
    OpenRefreshWindow,
    Probation,
    Failover,
    EmergencySwitch,
    RelaxedEmergencySwitch,
    Refresh,
}

impl EscalationStep {
    pub fn is_disruptive(&self) -> bool {
        !matches!(
            self,
            EscalationStep::OpenRefreshWindow | EscalationStep::Probation
        )
    }
}

/// Everything the ladder planner looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationInput {
    pub failure: FailureKind,
    /// Counter of the failure family (no-heal-point or play error).
    pub count: u32,
    pub stuck_count: u32,
    pub stall_duration_ms: u64,
    pub candidate_count: usize,
    /// Readiness is adequate while buffered headroom is low.
    pub refresh_ready: bool,
    pub refresh_window_open: bool,
    pub quiet_available: bool,
    pub emergency_available: bool,
    pub refresh_available: bool,
}

/// Plans the ladder for one failure, in execution order.
pub fn plan_escalation(input: &EscalationInput, config: &EngineConfig) -> Vec<EscalationStep> {
    let esc = &config.escalation;
    let multi = input.candidate_count > 1;
    let mut steps = Vec::new();

    if input.failure == FailureKind::NoHealPoint {
        if !multi && input.count >= esc.quiet_after_no_heal && input.quiet_available {
            steps.push(EscalationStep::QuietWindow);
        }
        if input.refresh_ready && !input.refresh_window_open {
            steps.push(EscalationStep::OpenRefreshWindow);
        }
        if input.count >= esc.probation_after_no_heal {
            steps.push(EscalationStep::Probation);
        }
        if multi
            && (input.count >= esc.failover_after_no_heal
                || input.stall_duration_ms >= esc.failover_after_stall_ms)
        {
            steps.push(EscalationStep::Failover);
        }
        if multi && input.emergency_available {
            if input.count >= esc.emergency_after_no_heal {
                steps.push(EscalationStep::EmergencySwitch);
            }
            if input.count >= esc.relax_readiness_after_no_heal {
                steps.push(EscalationStep::RelaxedEmergencySwitch);
            }
        }
        if input.count >= esc.refresh_after_no_heal
            && input.refresh_available
            && (input.refresh_window_open || input.refresh_ready)
        {
            steps.push(EscalationStep::Refresh);
        }
        return steps;
    }

    if input.count >= esc.probation_after_play_errors {
        steps.push(EscalationStep::Probation);
    }
    if multi && input.count >= esc.failover_after_play_errors {
        steps.push(EscalationStep::Failover);
    }
    if !multi
        && input.failure == FailureKind::Stuck
        && input.stuck_count >= esc.single_candidate_refresh_after_stuck
        && input.refresh_available
    {
        steps.push(EscalationStep::Refresh);
    }
    steps
}

/// Best ready candidate with a real source, trust ignored.
pub fn emergency_target(
    scores: &[CandidateScore],
    from: CandidateId,
    min_ready: ReadyState,
) -> Option<CandidateId> {
    scores
        .iter()
        .filter(|score| score.id != from && score.ready_state >= min_ready)
        .filter(|score| {
            !score.has_factor(ScoreFactor::FallbackSource)
                && !score.has_factor(ScoreFactor::Detached)
                && !score.has_factor(ScoreFactor::EndedOrErrored)
        })
        .max_by_key(|score| (!score.dead, score.score, Reverse(score.id)))
        .map(|score| score.id)
}

#[derive(Debug, Default)]
struct PolicyState {
    quiet: Option<(CandidateId, u64)>,
    last_quiet_ms: Option<u64>,
    refresh_window_until_ms: Option<u64>,
    last_emergency_ms: Option<u64>,
    last_refresh_ms: Option<u64>,
}

pub struct RecoveryPolicy {
    ctx: Arc<EngineContext>,
    selector: Arc<CandidateSelector>,
    failover: Arc<FailoverManager>,
    refresher: Arc<dyn RefreshRequester>,
    state: Mutex<PolicyState>,
}

impl RecoveryPolicy {
    pub fn new(
        ctx: Arc<EngineContext>,
        selector: Arc<CandidateSelector>,
        failover: Arc<FailoverManager>,
        refresher: Arc<dyn RefreshRequester>,
    ) -> Self {
        Self {
            ctx,
            selector,
            failover,
            refresher,
            state: Mutex::new(PolicyState::default()),
        }
    }

    /// Whether a heal for `id` may start now.
    pub fn heal_gate(&self, id: CandidateId) -> HealGate {
        let now = self.ctx.now();
        if let Some((quiet_id, until)) = self.state.lock().quiet {
            if quiet_id == id && now < until {
                return HealGate::Quiet { until_ms: until };
            }
        }
        let next = self
            .ctx
            .with_monitor(id, |m| m.next_heal_allowed_ms.max(m.next_play_heal_allowed_ms))
            .unwrap_or(0);
        if now < next {
            return HealGate::Backoff { until_ms: next };
        }
        HealGate::Allowed
    }

    pub fn quiet_until(&self) -> Option<u64> {
        let now = self.ctx.now();
        self.state
            .lock()
            .quiet
            .map(|(_, until)| until)
            .filter(|until| now < *until)
    }

    pub fn refresh_window_open(&self) -> bool {
        let now = self.ctx.now();
        self.state
            .lock()
            .refresh_window_until_ms
            .is_some_and(|until| now < until)
    }

    /// Handles "no heal point": backoff, then the ladder.
    pub async fn on_no_heal_point(&self, id: CandidateId, stall: StallContext) -> Vec<EscalationStep> {
        let now = self.ctx.now();
        let curve = Backoff::from_config(&self.ctx.config.backoff, BackoffCurve::NoHealPoint);
        let Some((count, next_allowed, tracked_stall)) = self.ctx.with_monitor(id, |m| {
            m.no_heal_point_count = m.no_heal_point_count.saturating_add(1);
            m.next_heal_allowed_ms = curve.next_allowed(now, m.no_heal_point_count, m.next_heal_allowed_ms);
            (m.no_heal_point_count, m.next_heal_allowed_ms, m.stall_duration(now))
        }) else {
            return Vec::new();
        };

        let delay_ms = next_allowed.saturating_sub(now);
        debug!(candidate = %id, count, delay_ms, exhausted = stall.buffer_exhausted, "no heal point");
        self.ctx.emit(DiagnosticEvent::BackoffApplied {
            candidate: id,
            failure: FailureKind::NoHealPoint,
            count,
            delay_ms,
        });

        let stall_duration_ms = stall.stall_duration_ms.max(tracked_stall);
        let input = self.escalation_input(id, FailureKind::NoHealPoint, count, 0, stall_duration_ms);
        let steps = plan_escalation(&input, &self.ctx.config);
        self.execute(id, steps, RefreshReason::NoHealPoint, "no_heal_point")
            .await
    }

    /// Handles a play failure after a heal seek.
    pub async fn on_play_failure(&self, id: CandidateId, kind: FailureKind) -> Vec<EscalationStep> {
        let now = self.ctx.now();
        let curve = Backoff::from_config(&self.ctx.config.backoff, kind.curve());
        let Some((count, stuck, next_allowed, stall_duration_ms)) = self.ctx.with_monitor(id, |m| {
            m.play_error_count = m.play_error_count.saturating_add(1);
            if kind == FailureKind::Stuck {
                m.play_stuck_count = m.play_stuck_count.saturating_add(1);
            }
            m.next_play_heal_allowed_ms =
                curve.next_allowed(now, m.play_error_count, m.next_play_heal_allowed_ms);
            (
                m.play_error_count,
                m.play_stuck_count,
                m.next_play_heal_allowed_ms,
                m.stall_duration(now),
            )
        }) else {
            return Vec::new();
        };

        let delay_ms = next_allowed.saturating_sub(now);
        debug!(candidate = %id, kind = kind.as_str(), count, delay_ms, "play failure");
        self.ctx.emit(DiagnosticEvent::BackoffApplied {
            candidate: id,
            failure: kind,
            count,
            delay_ms,
        });

        let input = self.escalation_input(id, kind, count, stuck, stall_duration_ms);
        let steps = plan_escalation(&input, &self.ctx.config);
        self.execute(id, steps, RefreshReason::PlayStuck, kind.as_str())
            .await
    }

    /// Verified success (heal, failover or self-recovery): clears every counter.
    pub fn on_success(&self, id: CandidateId) {
        let was_backing_off = self
            .ctx
            .with_monitor(id, |m| {
                let was = m.in_backoff();
                m.reset_backoff();
                was
            })
            .unwrap_or(false);
        {
            let mut state = self.state.lock();
            if state.quiet.is_some_and(|(quiet_id, _)| quiet_id == id) {
                state.quiet = None;
            }
        }
        if was_backing_off {
            debug!(candidate = %id, "backoff reset");
            self.ctx
                .emit(DiagnosticEvent::BackoffReset { candidate: id });
        }
    }

    fn escalation_input(
        &self,
        id: CandidateId,
        failure: FailureKind,
        count: u32,
        stuck_count: u32,
        stall_duration_ms: u64,
    ) -> EscalationInput {
        let now = self.ctx.now();
        let config = &self.ctx.config;
        let refresh_ready = self.ctx.snapshot(id).is_some_and(|snapshot| {
            snapshot.ready_state >= ReadyState::HaveFutureData
                && snapshot.buffer_ahead() < config.escalation.refresh_low_headroom_s
        });
        let state = self.state.lock();
        let cooled = |last: Option<u64>, cooldown: u64| {
            last.map_or(true, |at| now.saturating_sub(at) >= cooldown)
        };
        EscalationInput {
            failure,
            count,
            stuck_count,
            stall_duration_ms,
            candidate_count: self.ctx.candidate_count(),
            refresh_ready,
            refresh_window_open: state
                .refresh_window_until_ms
                .is_some_and(|until| now < until),
            quiet_available: cooled(state.last_quiet_ms, config.escalation.quiet_cooldown_ms),
            emergency_available: cooled(
                state.last_emergency_ms,
                config.escalation.emergency_cooldown_ms,
            ),
            refresh_available: cooled(state.last_refresh_ms, config.escalation.refresh_cooldown_ms),
        }
    }

    async fn execute(
        &self,
        id: CandidateId,
        steps: Vec<EscalationStep>,
        refresh_reason: RefreshReason,
        reason: &str,
    ) -> Vec<EscalationStep> {
        let mut applied = Vec::new();
        for step in steps {
            let taken = match step {
                EscalationStep::QuietWindow => self.enter_quiet_window(id),
                EscalationStep::OpenRefreshWindow => self.open_refresh_window(id),
                EscalationStep::Probation => {
                    let opened = self.selector.open_probation(reason);
                    if opened {
                        self.failover.probe_dormant(id).await;
                    }
                    opened
                }
                EscalationStep::Failover => {
                    self.failover.attempt_failover(id, reason).await.is_ok()
                }
                EscalationStep::EmergencySwitch => self.emergency_switch(id, false, reason).await,
                EscalationStep::RelaxedEmergencySwitch => {
                    self.emergency_switch(id, true, reason).await
                }
                EscalationStep::Refresh => self.request_refresh(refresh_reason),
            };
            if taken {
                applied.push(step);
                if step.is_disruptive() {
                    break;
                }
            }
        }
        applied
    }

    fn enter_quiet_window(&self, id: CandidateId) -> bool {
        let now = self.ctx.now();
        let until = now + self.ctx.config.escalation.quiet_window_ms;
        {
            let mut state = self.state.lock();
            state.quiet = Some((id, until));
            state.last_quiet_ms = Some(now);
        }
        warn!(candidate = %id, until_ms = until, "entering quiet window");
        self.ctx.emit(DiagnosticEvent::QuietWindowEntered {
            candidate: id,
            until_ms: until,
        });
        true
    }

    fn open_refresh_window(&self, id: CandidateId) -> bool {
        let until = self.ctx.now() + self.ctx.config.escalation.refresh_window_ms;
        self.state.lock().refresh_window_until_ms = Some(until);
        info!(candidate = %id, until_ms = until, "refresh window opened");
        self.ctx.emit(DiagnosticEvent::RefreshWindowOpened {
            candidate: id,
            until_ms: until,
        });
        true
    }

    async fn emergency_switch(&self, from: CandidateId, relaxed: bool, reason: &str) -> bool {
        if self.failover.is_in_progress() {
            return false;
        }
        let min_ready = if relaxed {
            ReadyState::HaveMetadata
        } else {
            ReadyState::HaveFutureData
        };
        let Some(to) = emergency_target(&self.selector.score_all(), from, min_ready) else {
            debug!(from = %from, relaxed, "no emergency target");
            return false;
        };

        let now = self.ctx.now();
        let dead_until = now + self.ctx.config.selection.dead_candidate_ms;
        self.state.lock().last_emergency_ms = Some(now);
        self.selector.switch_to(to, SwitchKind::Emergency, reason);
        self.ctx.with_monitor(from, |m| m.dead_until_ms = Some(dead_until));

        warn!(from = %from, to = %to, relaxed, "emergency switch");
        self.ctx.emit(DiagnosticEvent::EmergencySwitch {
            from,
            to,
            relaxed_readiness: relaxed,
        });
        self.ctx.emit(DiagnosticEvent::CandidateMarkedDead {
            candidate: from,
            until_ms: dead_until,
        });

        if let Some(surface) = self.ctx.surface(to) {
            if let Err(err) = surface.play().await {
                warn!(candidate = %to, error = %err, "emergency target refused to play");
            }
        }
        true
    }

    fn request_refresh(&self, reason: RefreshReason) -> bool {
        let now = self.ctx.now();
        {
            let mut state = self.state.lock();
            let cooldown = self.ctx.config.escalation.refresh_cooldown_ms;
            if state
                .last_refresh_ms
                .is_some_and(|at| now.saturating_sub(at) < cooldown)
            {
                return false;
            }
            state.last_refresh_ms = Some(now);
        }
        self.ctx
            .emit(DiagnosticEvent::RefreshRequested { reason });
        self.refresher.request_refresh(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::PlaybackState;

    fn input(failure: FailureKind, count: u32, candidates: usize) -> EscalationInput {
        EscalationInput {
            failure,
            count,
            stuck_count: 0,
            stall_duration_ms: 0,
            candidate_count: candidates,
            refresh_ready: false,
            refresh_window_open: false,
            quiet_available: true,
            emergency_available: true,
            refresh_available: true,
        }
    }

    #[test]
    fn early_failures_only_back_off() {
        let config = EngineConfig::default();
        assert!(plan_escalation(&input(FailureKind::NoHealPoint, 1, 2), &config).is_empty());
        assert!(plan_escalation(&input(FailureKind::NoHealPoint, 2, 1), &config).is_empty());
    }

    #[test]
    fn ladder_is_ordered_least_to_most_disruptive() {
        let config = EngineConfig::default();
        let mut full = input(FailureKind::NoHealPoint, 10, 3);
        full.refresh_ready = true;
        assert_eq!(
            plan_escalation(&full, &config),
            vec![
                EscalationStep::OpenRefreshWindow,
                EscalationStep::Probation,
                EscalationStep::Failover,
                EscalationStep::EmergencySwitch,
                EscalationStep::RelaxedEmergencySwitch,
                EscalationStep::Refresh,
            ]
        );
    }

    #[test]
    fn failover_threshold_and_stall_duration() {
        let config = EngineConfig::default();
        assert_eq!(
            plan_escalation(&input(FailureKind::NoHealPoint, 4, 2), &config),
            vec![EscalationStep::Probation, EscalationStep::Failover]
        );
        let mut long_stall = input(FailureKind::NoHealPoint, 1, 2);
        long_stall.stall_duration_ms = 20_000;
        assert_eq!(
            plan_escalation(&long_stall, &config),
            vec![EscalationStep::Failover]
        );
    }

    #[test]
    fn single_candidate_goes_quiet_instead_of_switching() {
        let config = EngineConfig::default();
        let steps = plan_escalation(&input(FailureKind::NoHealPoint, 8, 1), &config);
        assert_eq!(
            steps,
            vec![EscalationStep::QuietWindow, EscalationStep::Probation]
        );
        let mut cooling = input(FailureKind::NoHealPoint, 8, 1);
        cooling.quiet_available = false;
        assert_eq!(
            plan_escalation(&cooling, &config),
            vec![EscalationStep::Probation]
        );
    }

    #[test]
    fn refresh_needs_eligibility_window() {
        let config = EngineConfig::default();
        let closed = input(FailureKind::NoHealPoint, 12, 1);
        assert!(!plan_escalation(&closed, &config).contains(&EscalationStep::Refresh));
        let mut open = closed;
        open.refresh_window_open = true;
        assert!(plan_escalation(&open, &config).contains(&EscalationStep::Refresh));
        open.refresh_available = false;
        assert!(!plan_escalation(&open, &config).contains(&EscalationStep::Refresh));
    }

    #[test]
    fn single_candidate_stuck_refreshes() {
        let config = EngineConfig::default();
        let mut stuck = input(FailureKind::Stuck, 3, 1);
        stuck.stuck_count = 2;
        assert_eq!(
            plan_escalation(&stuck, &config),
            vec![EscalationStep::Probation]
        );
        stuck.stuck_count = 3;
        assert_eq!(
            plan_escalation(&stuck, &config),
            vec![EscalationStep::Probation, EscalationStep::Refresh]
        );
        let mut errors = input(FailureKind::PlayerError, 3, 2);
        errors.stuck_count = 5;
        assert_eq!(
            plan_escalation(&errors, &config),
            vec![EscalationStep::Probation, EscalationStep::Failover]
        );
    }

    #[test]
    fn disruptive_steps_are_named() {
        assert!(!EscalationStep::Probation.is_disruptive());
        assert!(!EscalationStep::OpenRefreshWindow.is_disruptive());
        assert!(EscalationStep::EmergencySwitch.is_disruptive());
        assert!(EscalationStep::QuietWindow.is_disruptive());
    }

    fn score(id: u64, value: i32, ready: ReadyState) -> CandidateScore {
        CandidateScore {
            id: CandidateId::new(id),
            score: value,
            trusted: false,
            dead: false,
            progress_eligible: false,
            progress_streak_ms: 0,
            ready_state: ready,
            state: PlaybackState::Stalled,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn emergency_target_ignores_trust_but_needs_readiness() {
        let scores = [
            score(1, 20, ReadyState::HaveEnoughData),
            score(2, 5, ReadyState::HaveMetadata),
            score(3, 1, ReadyState::HaveFutureData),
        ];
        let from = CandidateId::new(1);
        assert_eq!(
            emergency_target(&scores, from, ReadyState::HaveFutureData),
            Some(CandidateId::new(3))
        );
        assert_eq!(
            emergency_target(&scores, from, ReadyState::HaveMetadata),
            Some(CandidateId::new(2))
        );
        assert_eq!(emergency_target(&scores[..1], from, ReadyState::HaveNothing), None);
    }

    #[test]
    fn abort_uses_lenient_curve() {
        assert_eq!(FailureKind::Aborted.curve(), BackoffCurve::Abort);
        assert_eq!(FailureKind::Stuck.curve(), BackoffCurve::PlayError);
    }
}
