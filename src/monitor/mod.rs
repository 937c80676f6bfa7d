//! Per-candidate monitor state.
//!
//! One [`MonitorState`] exists for each tracked candidate. It carries the
//! playback state machine, the progress streak that gates eligibility, and the
//! heal/backoff counters the recovery policy maintains. Only the watchdog, the
//! heal pipeline and the recovery policy write to it.
use serde::Serialize;

use crate::buffer::HealPointKey;
use crate::config::ProgressConfig;

pub mod watchdog;

pub use watchdog::{PauseAttribution, StallEvent, Watchdog, WatchdogEvent};

/// Playback state of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stalled,
    Healing,
    Reset,
    Error,
    Ended,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Playing => "PLAYING",
            PlaybackState::Paused => "PAUSED",
            PlaybackState::Stalled => "STALLED",
            PlaybackState::Healing => "HEALING",
            PlaybackState::Reset => "RESET",
            PlaybackState::Error => "ERROR",
            PlaybackState::Ended => "ENDED",
        }
    }

    /// States in which the candidate is not delivering playback.
    pub fn is_troubled(&self) -> bool {
        matches!(
            self,
            PlaybackState::Stalled
                | PlaybackState::Healing
                | PlaybackState::Reset
                | PlaybackState::Error
                | PlaybackState::Ended
        )
    }
}

/// What a single progress observation amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSample {
    /// Playhead moved forward at a plausible rate.
    Advanced,
    /// Playhead moved forward further than wall time allows.
    Jumped,
    /// Playhead moved backwards.
    Regressed,
    /// No meaningful movement.
    Idle,
}

impl ProgressSample {
    /// Any forward movement, continuous or not.
    pub fn moved_forward(&self) -> bool {
        matches!(self, ProgressSample::Advanced | ProgressSample::Jumped)
    }
}

/// Mutable record for one candidate.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub state: PlaybackState,
    pub state_since_ms: u64,
    pub monitored_since_ms: u64,

    pub last_position: f64,
    pub last_sample_ms: Option<u64>,
    /// Last time the playhead was seen moving forward.
    pub last_progress_ms: Option<u64>,
    pub progress_streak_ms: u64,
    progress_eligible: bool,
    pub last_regression_ms: Option<u64>,

    /// Start of the current no-progress period while not paused by the user.
    pub stall_started_ms: Option<u64>,
    pub last_stall_event_ms: Option<u64>,
    pub last_stall_log_ms: Option<u64>,
    /// Start of the current buffer-starvation window.
    pub buffer_starved_since_ms: Option<u64>,

    pub heal_in_flight: bool,
    pub heal_finished_ms: Option<u64>,
    pub no_heal_point_count: u32,
    pub next_heal_allowed_ms: u64,
    pub play_error_count: u32,
    pub next_play_heal_allowed_ms: u64,
    /// Play failures caused by seeking to the same point over and over.
    pub play_stuck_count: u32,
    pub heal_point_repeat_count: u32,
    pub last_heal_point: Option<HealPointKey>,

    pub reset_pending: bool,
    pub dead_until_ms: Option<u64>,
}

impl MonitorState {
    pub fn new(now_ms: u64, position: f64) -> Self {
        Self {
            state: PlaybackState::Playing,
            state_since_ms: now_ms,
            monitored_since_ms: now_ms,
            last_position: position,
            last_sample_ms: None,
            last_progress_ms: None,
            progress_streak_ms: 0,
            progress_eligible: false,
            last_regression_ms: None,
            stall_started_ms: None,
            last_stall_event_ms: None,
            last_stall_log_ms: None,
            buffer_starved_since_ms: None,
            heal_in_flight: false,
            heal_finished_ms: None,
            no_heal_point_count: 0,
            next_heal_allowed_ms: 0,
            play_error_count: 0,
            next_play_heal_allowed_ms: 0,
            play_stuck_count: 0,
            heal_point_repeat_count: 0,
            last_heal_point: None,
            reset_pending: false,
            dead_until_ms: None,
        }
    }

    /// True once the streak since the last discontinuity reached the minimum.
    pub fn progress_eligible(&self) -> bool {
        self.progress_eligible
    }

    /// Moves to `next`, returning the previous state when it changed.
    pub fn transition(&mut self, next: PlaybackState, now_ms: u64) -> Option<PlaybackState> {
        if self.state == next {
            return None;
        }
        let previous = self.state;
        self.state = next;
        self.state_since_ms = now_ms;
        Some(previous)
    }

    /// Folds one playhead observation into the progress streak.
    pub fn observe_position(
        &mut self,
        position: f64,
        paused: bool,
        now_ms: u64,
        config: &ProgressConfig,
    ) -> ProgressSample {
        let previous_sample = self.last_sample_ms.replace(now_ms);
        let delta = position - self.last_position;
        self.last_position = position;

        let Some(previous_sample) = previous_sample else {
            return ProgressSample::Idle;
        };
        let wall_s = now_ms.saturating_sub(previous_sample) as f64 / 1000.0;

        if delta < -config.epsilon_s {
            self.last_regression_ms = Some(now_ms);
            self.reset_streak();
            return ProgressSample::Regressed;
        }

        if delta > config.epsilon_s && !paused {
            self.last_progress_ms = Some(now_ms);
            if delta > wall_s + config.jump_tolerance_s {
                self.reset_streak();
                return ProgressSample::Jumped;
            }
            let elapsed = now_ms.saturating_sub(previous_sample);
            if elapsed > config.streak_break_ms {
                self.reset_streak();
            } else {
                self.set_streak(self.progress_streak_ms.saturating_add(elapsed), config);
            }
            return ProgressSample::Advanced;
        }

        let idle_for = self
            .last_progress_ms
            .map(|last| now_ms.saturating_sub(last))
            .unwrap_or(u64::MAX);
        if paused || idle_for > config.streak_break_ms {
            self.reset_streak();
        }
        ProgressSample::Idle
    }

    /// Re-anchors sampling at a playhead the engine moved itself.
    ///
    /// The next sample measures from `position`, so the seek is never read
    /// as playback progress.
    pub fn rebase(&mut self, position: f64, now_ms: u64) {
        self.reset_streak();
        self.last_position = position;
        self.last_sample_ms = Some(now_ms);
    }

    /// Explicit discontinuity (seek, source change).
    pub fn reset_streak(&mut self) {
        self.progress_streak_ms = 0;
        self.progress_eligible = false;
    }

    fn set_streak(&mut self, streak_ms: u64, config: &ProgressConfig) {
        self.progress_streak_ms = streak_ms;
        self.progress_eligible = streak_ms >= config.min_progress_ms;
    }

    /// Milliseconds since progress was last seen, measured from monitoring start
    /// when the candidate never progressed.
    pub fn no_progress_for(&self, now_ms: u64) -> u64 {
        let since = self.last_progress_ms.unwrap_or(self.monitored_since_ms);
        now_ms.saturating_sub(since)
    }

    /// Duration of the current stall, zero when not stalled.
    pub fn stall_duration(&self, now_ms: u64) -> u64 {
        self.stall_started_ms
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    pub fn is_dead(&self, now_ms: u64) -> bool {
        self.dead_until_ms.is_some_and(|until| now_ms < until)
    }

    pub fn recently_regressed(&self, now_ms: u64, window_ms: u64) -> bool {
        self.last_regression_ms
            .is_some_and(|at| now_ms.saturating_sub(at) < window_ms)
    }

    pub fn progressed_within(&self, now_ms: u64, window_ms: u64) -> bool {
        self.last_progress_ms
            .is_some_and(|at| now_ms.saturating_sub(at) <= window_ms)
    }

    /// Clears every backoff counter after a verified success.
    pub fn reset_backoff(&mut self) {
        self.no_heal_point_count = 0;
        self.next_heal_allowed_ms = 0;
        self.play_error_count = 0;
        self.next_play_heal_allowed_ms = 0;
        self.play_stuck_count = 0;
    }

    /// True when any backoff counter is non-zero.
    pub fn in_backoff(&self) -> bool {
        self.no_heal_point_count > 0 || self.play_error_count > 0 || self.play_stuck_count > 0
    }

    /// Records a seek target and returns the repeat count for that signature.
    pub fn record_heal_point(&mut self, key: HealPointKey) -> u32 {
        if self.last_heal_point == Some(key) {
            self.heal_point_repeat_count = self.heal_point_repeat_count.saturating_add(1);
        } else {
            self.last_heal_point = Some(key);
            self.heal_point_repeat_count = 0;
        }
        self.heal_point_repeat_count
    }

    pub fn clear_heal_point_history(&mut self) {
        self.last_heal_point = None;
        self.heal_point_repeat_count = 0;
    }
}
