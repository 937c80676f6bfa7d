//! Candidate selection engine.
//!
//! `evaluate` scores every candidate, ranks them, and decides whether the
//! active candidate should change. Switching is deliberately sticky: a
//! preferred candidate must prove progress, the active one must actually be in
//! trouble, trust is respected, and the score advantage must clear a
//! hysteresis delta. Two escape hatches exist: the fast switch away from a
//! stuck heal, and probation, which relaxes the gates after repeated failures.
use std::cmp::Reverse;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::candidate::scorer::{score_candidate, CandidateScore};
use crate::candidate::{CandidateId, CandidateRegistry};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::events::{
    AdoptionSource, DiagnosticEvent, RateLimitedTally, RemovalReason, SuppressionCount,
};
use crate::failover::FailoverLock;
use crate::monitor::{MonitorState, PlaybackState};
use crate::surface::ReadyState;

/// How the active candidate changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchKind {
    /// Active candidate was stuck healing and a proven alternative existed.
    Fast,
    /// Normal switch that cleared every gate including the score delta.
    Hysteresis,
    /// Switch accepted under relaxed probation gates.
    Probation,
    /// Verified failover started by the failover manager.
    Failover,
    /// Failover target failed verification; origin restored.
    FailoverRevert,
    /// Forced switch that bypasses selection.
    Emergency,
}

/// Named reason a switch to the preferred candidate was withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionCause {
    PreferredNotProgressEligible,
    ActiveNotStalled,
    TrustedActiveBlocksUntrusted,
    UntrustedOutsideProbation,
    ScoreDelta,
}

impl SuppressionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionCause::PreferredNotProgressEligible => "preferred_not_progress_eligible",
            SuppressionCause::ActiveNotStalled => "active_not_stalled",
            SuppressionCause::TrustedActiveBlocksUntrusted => "trusted_active_blocks_untrusted",
            SuppressionCause::UntrustedOutsideProbation => "untrusted_outside_probation",
            SuppressionCause::ScoreDelta => "score_delta",
        }
    }
}

/// Result of the switch policy for one (active, preferred) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    Switch(SwitchKind),
    Stay(SuppressionCause),
}

/// Condition of the active candidate as the switch policy sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveCondition {
    pub state: PlaybackState,
    pub no_heal_point_count: u32,
    pub stall_duration_ms: u64,
    pub no_progress_ms: u64,
}

impl ActiveCondition {
    pub fn from_monitor(monitor: &MonitorState, now_ms: u64) -> Self {
        Self {
            state: monitor.state,
            no_heal_point_count: monitor.no_heal_point_count,
            stall_duration_ms: monitor.stall_duration(now_ms),
            no_progress_ms: monitor.no_progress_for(now_ms),
        }
    }

    fn looks_stalled(&self, config: &EngineConfig) -> bool {
        if self.state == PlaybackState::Paused {
            return false;
        }
        self.state.is_troubled() || self.no_progress_ms >= config.watchdog.stall_confirm_ms
    }

    fn stuck_healing(&self, config: &EngineConfig) -> bool {
        self.state == PlaybackState::Healing
            && (self.no_heal_point_count >= config.selection.fast_switch_no_heal_points
                || self.stall_duration_ms >= config.selection.fast_switch_stall_ms)
    }
}

/// Applies the switch gates in order; the first failing gate names the cause.
pub fn decide_switch(
    active: &CandidateScore,
    condition: &ActiveCondition,
    preferred: &CandidateScore,
    probation_active: bool,
    config: &EngineConfig,
) -> SwitchDecision {
    let selection = &config.selection;

    if condition.stuck_healing(config)
        && preferred.trusted
        && preferred.progress_eligible
        && preferred.progress_streak_ms >= selection.fast_switch_min_streak_ms
    {
        return SwitchDecision::Switch(SwitchKind::Fast);
    }

    let probation_ready = probation_active
        && preferred.progress_streak_ms >= selection.probation_min_streak_ms
        && preferred.ready_state >= ReadyState::HaveFutureData;

    if !preferred.progress_eligible && !probation_ready {
        return SwitchDecision::Stay(SuppressionCause::PreferredNotProgressEligible);
    }
    if !condition.looks_stalled(config) {
        return SwitchDecision::Stay(SuppressionCause::ActiveNotStalled);
    }
    if !preferred.trusted && !probation_active {
        if active.trusted {
            return SwitchDecision::Stay(SuppressionCause::TrustedActiveBlocksUntrusted);
        }
        return SwitchDecision::Stay(SuppressionCause::UntrustedOutsideProbation);
    }
    if probation_ready {
        return SwitchDecision::Switch(SwitchKind::Probation);
    }
    if preferred.score - active.score < selection.switch_delta {
        return SwitchDecision::Stay(SuppressionCause::ScoreDelta);
    }
    SwitchDecision::Switch(SwitchKind::Hysteresis)
}

/// Best candidates under each filter.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub best: Option<CandidateId>,
    pub best_non_dead: Option<CandidateId>,
    pub best_trusted: Option<CandidateId>,
    pub best_trusted_non_dead: Option<CandidateId>,
}

impl Ranking {
    pub fn from_scores(scores: &[CandidateScore], active: Option<CandidateId>) -> Self {
        let best_where = |keep: &dyn Fn(&CandidateScore) -> bool| {
            scores
                .iter()
                .filter(|score| keep(*score))
                .max_by_key(|score| (score.score, Some(score.id) == active, Reverse(score.id)))
                .map(|score| score.id)
        };
        Self {
            best: best_where(&|_| true),
            best_non_dead: best_where(&|s| !s.dead),
            best_trusted: best_where(&|s| s.trusted),
            best_trusted_non_dead: best_where(&|s| s.trusted && !s.dead),
        }
    }

    /// Trusted-and-alive, then alive, then trusted, then anything.
    pub fn preferred(&self) -> Option<CandidateId> {
        self.best_trusted_non_dead
            .or(self.best_non_dead)
            .or(self.best_trusted)
            .or(self.best)
    }
}

/// Result of one `evaluate` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    pub active: Option<CandidateId>,
    pub previous: Option<CandidateId>,
    pub preferred: Option<CandidateId>,
    pub switched: Option<SwitchKind>,
    pub adopted: Option<AdoptionSource>,
    pub suppressed: Option<SuppressionCause>,
    /// Selection was skipped because a failover is in flight.
    pub locked: bool,
}

impl SelectionOutcome {
    fn unchanged(active: Option<CandidateId>) -> Self {
        Self {
            active,
            previous: active,
            preferred: None,
            switched: None,
            adopted: None,
            suppressed: None,
            locked: false,
        }
    }

    /// True when the active candidate is different after the pass.
    pub fn changed(&self) -> bool {
        self.active != self.previous
    }
}

#[derive(Debug)]
struct SelectorState {
    probation_until_ms: Option<u64>,
    last_probation_ms: Option<u64>,
    suppressions: RateLimitedTally<SuppressionCause>,
}

/// Decides which candidate is active.
pub struct CandidateSelector {
    ctx: Arc<EngineContext>,
    failover_lock: FailoverLock,
    state: Mutex<SelectorState>,
}

impl CandidateSelector {
    pub fn new(ctx: Arc<EngineContext>, failover_lock: FailoverLock) -> Self {
        let interval = ctx.config.selection.suppression_log_interval_ms;
        Self {
            ctx,
            failover_lock,
            state: Mutex::new(SelectorState {
                probation_until_ms: None,
                last_probation_ms: None,
                suppressions: RateLimitedTally::new(interval),
            }),
        }
    }

    /// Scores every tracked candidate.
    pub fn score_all(&self) -> Vec<CandidateScore> {
        let now = self.ctx.now();
        let registry = self.ctx.registry.lock();
        score_registry(&registry, now, &self.ctx.config)
    }

    pub fn score(&self, id: CandidateId) -> Option<CandidateScore> {
        let now = self.ctx.now();
        let registry = self.ctx.registry.lock();
        let candidate = registry.get(id)?;
        Some(score_candidate(
            id,
            &candidate.snapshot(),
            &candidate.monitor,
            now,
            &self.ctx.config,
        ))
    }

    pub fn probation_active(&self) -> bool {
        let now = self.ctx.now();
        self.state
            .lock()
            .probation_until_ms
            .is_some_and(|until| now < until)
    }

    /// Opens a probation window unless one is active or the cooldown has not elapsed.
    pub fn open_probation(&self, reason: &str) -> bool {
        let now = self.ctx.now();
        let selection = &self.ctx.config.selection;
        let until = {
            let mut state = self.state.lock();
            if state.probation_until_ms.is_some_and(|until| now < until) {
                return false;
            }
            if state
                .last_probation_ms
                .is_some_and(|last| now.saturating_sub(last) < selection.probation_cooldown_ms)
            {
                return false;
            }
            let until = now + selection.probation_window_ms;
            state.probation_until_ms = Some(until);
            state.last_probation_ms = Some(now);
            until
        };
        info!(reason, until_ms = until, "probation opened");
        self.ctx.emit(DiagnosticEvent::ProbationOpened {
            reason: reason.to_string(),
            until_ms: until,
        });
        true
    }

    /// Re-evaluates the candidates and returns the (possibly new) active one.
    pub fn evaluate(&self, reason: &str) -> SelectionOutcome {
        if self.failover_lock.is_held() {
            let mut outcome = SelectionOutcome::unchanged(self.ctx.active());
            outcome.locked = true;
            return outcome;
        }

        let now = self.ctx.now();
        let config = self.ctx.config.clone();
        let probation = self.probation_active();
        let mut events = Vec::new();

        let outcome = {
            let mut registry = self.ctx.registry.lock();
            let scores = score_registry(&registry, now, &config);
            let current = registry.active();
            let mut outcome = SelectionOutcome::unchanged(current);
            if scores.is_empty() {
                return outcome;
            }

            let ranking = Ranking::from_scores(&scores, current);
            let preferred = ranking.preferred();
            outcome.preferred = preferred;
            let score_of = |id: CandidateId| scores.iter().find(|s| s.id == id);

            match (current, preferred) {
                (None, _) => {
                    let (adopt, via) = match registry.last_good() {
                        Some(last_good) => (Some(last_good), AdoptionSource::LastGood),
                        None => (preferred, AdoptionSource::Preferred),
                    };
                    if let Some(adopt) = adopt {
                        registry.set_active(Some(adopt));
                        outcome.active = Some(adopt);
                        outcome.adopted = Some(via);
                        events.push(DiagnosticEvent::ActiveAdopted {
                            candidate: adopt,
                            via,
                        });
                    }
                }
                (Some(active), Some(preferred)) if active != preferred => {
                    let (Some(active_score), Some(preferred_score)) =
                        (score_of(active), score_of(preferred))
                    else {
                        return outcome;
                    };
                    let condition = registry
                        .monitor(active)
                        .map(|monitor| ActiveCondition::from_monitor(monitor, now));
                    let decision = match condition {
                        Some(condition) => decide_switch(
                            active_score,
                            &condition,
                            preferred_score,
                            probation,
                            &config,
                        ),
                        None => SwitchDecision::Stay(SuppressionCause::ActiveNotStalled),
                    };
                    match decision {
                        SwitchDecision::Switch(kind) => {
                            registry.set_active(Some(preferred));
                            outcome.active = Some(preferred);
                            outcome.switched = Some(kind);
                            events.push(DiagnosticEvent::CandidateSwitched {
                                from: Some(active),
                                to: preferred,
                                switch: kind,
                                reason: reason.to_string(),
                                score_delta: preferred_score.score - active_score.score,
                            });
                        }
                        SwitchDecision::Stay(cause) => {
                            outcome.suppressed = Some(cause);
                        }
                    }
                }
                _ => {}
            }

            if let Some(active) = outcome.active {
                if let Some(score) = score_of(active) {
                    if score.trusted && score.progress_eligible && !score.dead {
                        registry.set_last_good(active);
                    }
                }
            }
            outcome
        };

        if let Some(cause) = outcome.suppressed {
            debug!(reason, cause = cause.as_str(), "switch suppressed");
            let flushed = {
                let mut state = self.state.lock();
                state.suppressions.record(cause);
                state.suppressions.flush_if_due(now)
            };
            if let Some(counts) = flushed {
                events.push(DiagnosticEvent::SwitchSuppressed {
                    causes: counts
                        .into_iter()
                        .map(|(cause, count)| SuppressionCount { cause, count })
                        .collect(),
                });
            }
        }
        if let Some(kind) = outcome.switched {
            info!(
                reason,
                from = ?outcome.previous,
                to = ?outcome.active,
                kind = ?kind,
                "active candidate switched"
            );
        }
        for event in events {
            self.ctx.emit(event);
        }
        outcome
    }

    /// Forces the active candidate, bypassing every gate. Returns the previous one.
    pub fn switch_to(&self, to: CandidateId, kind: SwitchKind, reason: &str) -> Option<CandidateId> {
        let previous = {
            let mut registry = self.ctx.registry.lock();
            if !registry.contains(to) {
                return registry.active();
            }
            registry.set_active(Some(to))
        };
        if previous != Some(to) {
            self.ctx.emit(DiagnosticEvent::CandidateSwitched {
                from: previous,
                to,
                switch: kind,
                reason: reason.to_string(),
                score_delta: 0,
            });
        }
        previous
    }

    /// Drops the lowest-scoring candidate that is neither active, last-good
    /// nor in `keep` while the registry is over capacity.
    pub fn prune(&self, keep: &[CandidateId]) -> Vec<CandidateId> {
        let now = self.ctx.now();
        let cap = self.ctx.config.selection.max_candidates;
        let mut pruned = Vec::new();
        {
            let mut registry = self.ctx.registry.lock();
            while registry.len() > cap {
                let protected = [registry.active(), registry.last_good()];
                let victim = score_registry(&registry, now, &self.ctx.config)
                    .into_iter()
                    .filter(|score| !protected.contains(&Some(score.id)) && !keep.contains(&score.id))
                    .min_by_key(|score| (score.score, Reverse(score.id)))
                    .map(|score| score.id);
                let Some(victim) = victim else {
                    break;
                };
                registry.remove(victim);
                pruned.push(victim);
            }
        }
        for candidate in &pruned {
            info!(candidate = %candidate, "candidate pruned");
            self.ctx.emit(DiagnosticEvent::CandidateRemoved {
                candidate: *candidate,
                reason: RemovalReason::Pruned,
            });
        }
        pruned
    }
}

fn score_registry(registry: &CandidateRegistry, now: u64, config: &EngineConfig) -> Vec<CandidateScore> {
    registry
        .iter()
        .map(|candidate| {
            score_candidate(
                candidate.id,
                &candidate.snapshot(),
                &candidate.monitor,
                now,
                config,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::scorer::ScoreReason;

    fn score(id: u64, value: i32) -> CandidateScore {
        CandidateScore {
            id: CandidateId::new(id),
            score: value,
            trusted: true,
            dead: false,
            progress_eligible: true,
            progress_streak_ms: 6_000,
            ready_state: ReadyState::HaveEnoughData,
            state: PlaybackState::Playing,
            reasons: Vec::<ScoreReason>::new(),
        }
    }

    fn stalled() -> ActiveCondition {
        ActiveCondition {
            state: PlaybackState::Stalled,
            no_heal_point_count: 0,
            stall_duration_ms: 3_000,
            no_progress_ms: 3_000,
        }
    }

    #[test]
    fn ranking_prefers_trusted_alive() {
        let mut dead_best = score(1, 30);
        dead_best.dead = true;
        let mut untrusted = score(2, 20);
        untrusted.trusted = false;
        let trusted = score(3, 12);
        let ranking = Ranking::from_scores(&[dead_best, untrusted, trusted], None);
        assert_eq!(ranking.best, Some(CandidateId::new(1)));
        assert_eq!(ranking.best_non_dead, Some(CandidateId::new(2)));
        assert_eq!(ranking.best_trusted, Some(CandidateId::new(1)));
        assert_eq!(ranking.best_trusted_non_dead, Some(CandidateId::new(3)));
        assert_eq!(ranking.preferred(), Some(CandidateId::new(3)));
    }

    #[test]
    fn dead_candidate_is_only_preferred_when_alone() {
        let mut dead = score(1, 50);
        dead.dead = true;
        let mut weak = score(2, -5);
        weak.trusted = false;
        let ranking = Ranking::from_scores(&[dead.clone(), weak], None);
        assert_eq!(ranking.preferred(), Some(CandidateId::new(2)));
        assert_eq!(
            Ranking::from_scores(&[dead], None).preferred(),
            Some(CandidateId::new(1))
        );
    }

    #[test]
    fn ties_keep_the_active_candidate() {
        let ranking = Ranking::from_scores(&[score(1, 10), score(2, 10)], Some(CandidateId::new(2)));
        assert_eq!(ranking.preferred(), Some(CandidateId::new(2)));
        let ranking = Ranking::from_scores(&[score(1, 10), score(2, 10)], None);
        assert_eq!(ranking.preferred(), Some(CandidateId::new(1)));
    }

    #[test]
    fn score_delta_gates_normal_switch() {
        let config = EngineConfig::default();
        let active = score(1, 10);
        let close = score(2, 12);
        assert_eq!(
            decide_switch(&active, &stalled(), &close, false, &config),
            SwitchDecision::Stay(SuppressionCause::ScoreDelta)
        );
        let clear = score(2, 13);
        assert_eq!(
            decide_switch(&active, &stalled(), &clear, false, &config),
            SwitchDecision::Switch(SwitchKind::Hysteresis)
        );
    }

    #[test]
    fn healthy_active_is_not_displaced() {
        let config = EngineConfig::default();
        let playing = ActiveCondition {
            state: PlaybackState::Playing,
            no_heal_point_count: 0,
            stall_duration_ms: 0,
            no_progress_ms: 200,
        };
        assert_eq!(
            decide_switch(&score(1, 0), &playing, &score(2, 40), false, &config),
            SwitchDecision::Stay(SuppressionCause::ActiveNotStalled)
        );
        let paused = ActiveCondition {
            state: PlaybackState::Paused,
            no_progress_ms: 60_000,
            ..playing
        };
        assert_eq!(
            decide_switch(&score(1, 0), &paused, &score(2, 40), false, &config),
            SwitchDecision::Stay(SuppressionCause::ActiveNotStalled)
        );
    }

    #[test]
    fn unproven_preferred_is_rejected() {
        let config = EngineConfig::default();
        let mut fresh = score(2, 40);
        fresh.progress_eligible = false;
        fresh.progress_streak_ms = 1_000;
        assert_eq!(
            decide_switch(&score(1, 0), &stalled(), &fresh, false, &config),
            SwitchDecision::Stay(SuppressionCause::PreferredNotProgressEligible)
        );
    }

    #[test]
    fn trust_gates_outside_probation() {
        let config = EngineConfig::default();
        let mut untrusted = score(2, 40);
        untrusted.trusted = false;
        assert_eq!(
            decide_switch(&score(1, 0), &stalled(), &untrusted, false, &config),
            SwitchDecision::Stay(SuppressionCause::TrustedActiveBlocksUntrusted)
        );
        let mut untrusted_active = score(1, 0);
        untrusted_active.trusted = false;
        assert_eq!(
            decide_switch(&untrusted_active, &stalled(), &untrusted, false, &config),
            SwitchDecision::Stay(SuppressionCause::UntrustedOutsideProbation)
        );
    }

    #[test]
    fn probation_with_readiness_bypasses_gates() {
        let config = EngineConfig::default();
        let mut candidate = score(2, 11);
        candidate.trusted = false;
        candidate.progress_eligible = false;
        candidate.progress_streak_ms = 2_000;
        assert_eq!(
            decide_switch(&score(1, 10), &stalled(), &candidate, true, &config),
            SwitchDecision::Switch(SwitchKind::Probation)
        );
        candidate.ready_state = ReadyState::HaveMetadata;
        assert_eq!(
            decide_switch(&score(1, 10), &stalled(), &candidate, true, &config),
            SwitchDecision::Stay(SuppressionCause::PreferredNotProgressEligible)
        );
    }

    #[test]
    fn fast_switch_away_from_stuck_heal() {
        let config = EngineConfig::default();
        let stuck = ActiveCondition {
            state: PlaybackState::Healing,
            no_heal_point_count: 2,
            stall_duration_ms: 1_000,
            no_progress_ms: 1_000,
        };
        let preferred = score(2, 11);
        assert_eq!(
            decide_switch(&score(1, 10), &stuck, &preferred, false, &config),
            SwitchDecision::Switch(SwitchKind::Fast)
        );
        let not_stuck = ActiveCondition {
            no_heal_point_count: 1,
            ..stuck
        };
        assert_eq!(
            decide_switch(&score(1, 10), &not_stuck, &preferred, false, &config),
            SwitchDecision::Stay(SuppressionCause::ScoreDelta)
        );
    }
}
