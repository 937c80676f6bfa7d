//! Candidate scoring.
//!
//! Score is a base value adjusted by named factors, each recorded in
//! `reasons` so any ranking can be explained after the fact. Trust, the dead
//! window and progress eligibility are reported as flags rather than folded
//! into the number: the selector uses them as hard gates.
use serde::Serialize;

use crate::candidate::CandidateId;
use crate::config::EngineConfig;
use crate::monitor::{MonitorState, PlaybackState};
use crate::surface::{ReadyState, SurfaceSnapshot};

/// Named score adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreFactor {
    FallbackSource,
    Detached,
    Paused,
    ShortStreak,
    RecentRegression,
    EndedOrErrored,
    RecentProgress,
    ReadyState,
}

impl ScoreFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreFactor::FallbackSource => "fallback_src",
            ScoreFactor::Detached => "detached",
            ScoreFactor::Paused => "paused",
            ScoreFactor::ShortStreak => "short_streak",
            ScoreFactor::RecentRegression => "recent_regression",
            ScoreFactor::EndedOrErrored => "ended_or_errored",
            ScoreFactor::RecentProgress => "recent_progress",
            ScoreFactor::ReadyState => "ready_state",
        }
    }
}

/// One applied adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreReason {
    pub factor: ScoreFactor,
    pub delta: i32,
}

/// Evaluation of one candidate at one instant. Never cached across ticks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub id: CandidateId,
    pub score: i32,
    pub trusted: bool,
    pub dead: bool,
    pub progress_eligible: bool,
    pub progress_streak_ms: u64,
    pub ready_state: ReadyState,
    pub state: PlaybackState,
    pub reasons: Vec<ScoreReason>,
}

impl CandidateScore {
    pub fn has_factor(&self, factor: ScoreFactor) -> bool {
        self.reasons.iter().any(|reason| reason.factor == factor)
    }
}

/// Whether the snapshot's source is missing or a configured placeholder.
pub fn is_fallback_source(snapshot: &SurfaceSnapshot, config: &EngineConfig) -> bool {
    !snapshot.has_source()
        || config
            .scoring
            .placeholder_src_prefixes
            .iter()
            .any(|prefix| snapshot.current_src.starts_with(prefix.as_str()))
}

/// Scores one candidate from its surface snapshot and monitor state.
pub fn score_candidate(
    id: CandidateId,
    snapshot: &SurfaceSnapshot,
    monitor: &MonitorState,
    now_ms: u64,
    config: &EngineConfig,
) -> CandidateScore {
    let weights = &config.scoring;
    let mut reasons = Vec::new();
    let mut apply = |factor: ScoreFactor, delta: i32| reasons.push(ScoreReason { factor, delta });

    if is_fallback_source(snapshot, config) {
        apply(ScoreFactor::FallbackSource, -weights.fallback_src_penalty);
    }
    if !snapshot.attached {
        apply(ScoreFactor::Detached, -weights.detached_penalty);
    }
    if snapshot.paused && !snapshot.ended {
        apply(ScoreFactor::Paused, -weights.paused_penalty);
    }
    if monitor.progress_streak_ms < config.progress.min_progress_ms {
        apply(ScoreFactor::ShortStreak, -weights.short_streak_penalty);
    }
    if monitor.recently_regressed(now_ms, config.progress.regression_window_ms) {
        apply(ScoreFactor::RecentRegression, -weights.regression_penalty);
    }
    if snapshot.ended || snapshot.error.is_some() {
        apply(ScoreFactor::EndedOrErrored, -weights.ended_or_error_penalty);
    }
    if monitor.progressed_within(now_ms, weights.recent_progress_window_ms) {
        apply(ScoreFactor::RecentProgress, weights.recent_progress_bonus);
    }
    if snapshot.ready_state >= ReadyState::HaveFutureData {
        apply(ScoreFactor::ReadyState, weights.ready_state_bonus);
    }

    let score = weights.base + reasons.iter().map(|reason| reason.delta).sum::<i32>();
    CandidateScore {
        id,
        score,
        trusted: monitor.progressed_within(now_ms, config.progress.trust_window_ms),
        dead: monitor.is_dead(now_ms),
        progress_eligible: monitor.progress_eligible(),
        progress_streak_ms: monitor.progress_streak_ms,
        ready_state: snapshot.ready_state,
        state: monitor.state,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{NetworkState, TimeRange};

    fn snapshot() -> SurfaceSnapshot {
        SurfaceSnapshot {
            current_time: 10.0,
            paused: false,
            ended: false,
            ready_state: ReadyState::HaveEnoughData,
            network_state: NetworkState::Loading,
            buffered: vec![TimeRange::new(0.0, 20.0)],
            current_src: "https://cdn.example/live.m3u8".into(),
            attached: true,
            error: None,
        }
    }

    fn progressing_monitor(now: u64, config: &EngineConfig) -> MonitorState {
        let mut monitor = MonitorState::new(0, 0.0);
        let mut position = 0.0;
        let mut t = 0;
        monitor.observe_position(position, false, t, &config.progress);
        while t < now {
            t += 500;
            position += 0.5;
            monitor.observe_position(position, false, t, &config.progress);
        }
        monitor
    }

    #[test]
    fn healthy_candidate_scores_high_and_is_trusted() {
        let config = EngineConfig::default();
        let monitor = progressing_monitor(6_000, &config);
        let score = score_candidate(CandidateId::new(1), &snapshot(), &monitor, 6_000, &config);
        assert_eq!(score.score, 10 + 5 + 2);
        assert!(score.trusted);
        assert!(score.progress_eligible);
        assert!(!score.dead);
        assert!(score.has_factor(ScoreFactor::RecentProgress));
    }

    #[test]
    fn fallback_paused_and_fresh_candidate_is_penalized() {
        let config = EngineConfig::default();
        let monitor = MonitorState::new(0, 0.0);
        let mut snap = snapshot();
        snap.current_src = "about:blank".into();
        snap.paused = true;
        snap.ready_state = ReadyState::HaveMetadata;
        let score = score_candidate(CandidateId::new(2), &snap, &monitor, 1_000, &config);
        assert_eq!(score.score, 10 - 8 - 4 - 3);
        assert!(!score.trusted);
        assert!(!score.progress_eligible);
        let factors: Vec<_> = score.reasons.iter().map(|r| r.factor.as_str()).collect();
        assert_eq!(factors, vec!["fallback_src", "paused", "short_streak"]);
    }

    #[test]
    fn trust_decays_without_progress() {
        let config = EngineConfig::default();
        let monitor = progressing_monitor(6_000, &config);
        let later = 6_000 + config.progress.trust_window_ms + 1;
        let score = score_candidate(CandidateId::new(1), &snapshot(), &monitor, later, &config);
        assert!(!score.trusted);
        assert!(!score.has_factor(ScoreFactor::RecentProgress));
    }

    #[test]
    fn dead_window_is_reported() {
        let config = EngineConfig::default();
        let mut monitor = progressing_monitor(6_000, &config);
        monitor.dead_until_ms = Some(10_000);
        let dead = score_candidate(CandidateId::new(1), &snapshot(), &monitor, 9_999, &config);
        assert!(dead.dead);
        let alive = score_candidate(CandidateId::new(1), &snapshot(), &monitor, 10_000, &config);
        assert!(!alive.dead);
    }

    #[test]
    fn detached_and_errored_sources_sink() {
        let config = EngineConfig::default();
        let monitor = MonitorState::new(0, 0.0);
        let mut snap = snapshot();
        snap.attached = false;
        snap.error = Some("decode".into());
        let score = score_candidate(CandidateId::new(3), &snap, &monitor, 0, &config);
        assert!(score.score < 0);
        assert!(score.has_factor(ScoreFactor::Detached));
        assert!(score.has_factor(ScoreFactor::EndedOrErrored));
    }
}
