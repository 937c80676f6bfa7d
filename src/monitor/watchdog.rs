//! Playback watchdog.
//!
//! Samples a candidate periodically and drives its state machine:
//!
//! * `PLAYING` → `STALLED` after no progress for the confirm window (shorter
//!   when the buffer is exhausted).
//! * `PLAYING`/`STALLED` → `PAUSED` on a user pause; a pause right after a
//!   stall or with an empty buffer is treated as part of the stall.
//! * `HEALING` → `PLAYING` when the playhead moves again, back to `STALLED`
//!   when a finished heal is not followed by progress.
//! * `ENDED`, `ERROR` and `RESET` mirror what the surface reports.
//!
//! While a candidate stays stalled a [`StallEvent`] is produced on every tick
//! so the stall handler can retry once backoff allows; only the log line and
//! the diagnostic fact are rate-limited.
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::candidate::CandidateId;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::events::DiagnosticEvent;
use crate::monitor::{MonitorState, PlaybackState};
use crate::surface::SurfaceSnapshot;

/// Whether a paused surface was paused by the user or by the stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseAttribution {
    NotPaused,
    User,
    StallInduced,
}

/// Confirmed stall of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallEvent {
    pub candidate: CandidateId,
    pub stall_duration_ms: u64,
    pub buffer_exhausted: bool,
    pub pause: PauseAttribution,
    /// First event of this stall episode.
    pub first: bool,
}

/// Signals the watchdog hands to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    Stall(StallEvent),
    /// A stalled or healing candidate advanced on its own.
    Recovered(CandidateId),
    /// The surface left the page.
    Detached(CandidateId),
}

impl WatchdogEvent {
    pub fn candidate(&self) -> CandidateId {
        match self {
            WatchdogEvent::Stall(stall) => stall.candidate,
            WatchdogEvent::Recovered(id) | WatchdogEvent::Detached(id) => *id,
        }
    }
}

/// Signal produced by one pure step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSignal {
    Stall {
        stall_duration_ms: u64,
        buffer_exhausted: bool,
        pause: PauseAttribution,
        first: bool,
    },
    Recovered,
    Detached,
}

/// Result of folding one snapshot into a monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepOutcome {
    pub transition: Option<(PlaybackState, PlaybackState)>,
    pub signal: Option<StepSignal>,
}

/// Advances the state machine of one candidate by one sample.
pub fn step(
    monitor: &mut MonitorState,
    snapshot: &SurfaceSnapshot,
    now_ms: u64,
    config: &EngineConfig,
) -> StepOutcome {
    let mut outcome = StepOutcome::default();
    if !snapshot.attached {
        outcome.signal = Some(StepSignal::Detached);
        return outcome;
    }

    let sample = monitor.observe_position(
        snapshot.current_time,
        snapshot.paused,
        now_ms,
        &config.progress,
    );
    let buffer_exhausted = snapshot.buffer_ahead() < config.watchdog.exhausted_ahead_s;
    if buffer_exhausted {
        monitor.buffer_starved_since_ms.get_or_insert(now_ms);
    } else {
        monitor.buffer_starved_since_ms = None;
    }
    if snapshot.has_source() {
        monitor.reset_pending = false;
    }

    let mut change = |monitor: &mut MonitorState, next: PlaybackState| {
        if let Some(previous) = monitor.transition(next, now_ms) {
            let from = outcome.transition.map_or(previous, |(from, _)| from);
            outcome.transition = Some((from, next));
        }
    };

    if snapshot.ended {
        monitor.stall_started_ms = None;
        change(monitor, PlaybackState::Ended);
        return outcome;
    }
    if snapshot.error.is_some() {
        monitor.stall_started_ms = None;
        change(monitor, PlaybackState::Error);
        return outcome;
    }
    if snapshot.is_reset() {
        monitor.reset_pending = true;
        monitor.stall_started_ms = None;
        change(monitor, PlaybackState::Reset);
        return outcome;
    }

    if sample.moved_forward() && !snapshot.paused {
        let was = monitor.state;
        monitor.stall_started_ms = None;
        change(monitor, PlaybackState::Playing);
        if monitor.progress_eligible() {
            monitor.clear_heal_point_history();
        }
        if matches!(was, PlaybackState::Stalled | PlaybackState::Healing) {
            outcome.signal = Some(StepSignal::Recovered);
        }
        return outcome;
    }

    let mut pause = PauseAttribution::NotPaused;
    if snapshot.paused {
        let recently_stalled = matches!(
            monitor.state,
            PlaybackState::Stalled | PlaybackState::Healing
        ) || monitor.last_stall_event_ms.is_some_and(|at| {
            now_ms.saturating_sub(at) <= config.watchdog.pause_after_stall_window_ms
        }) || buffer_exhausted;
        if !recently_stalled {
            monitor.stall_started_ms = None;
            change(monitor, PlaybackState::Paused);
            return outcome;
        }
        pause = PauseAttribution::StallInduced;
    }

    match monitor.state {
        PlaybackState::Healing => {
            if monitor.heal_in_flight {
                return outcome;
            }
            let verified_failed = monitor
                .heal_finished_ms
                .map_or(true, |at| now_ms.saturating_sub(at) >= config.watchdog.heal_verify_ms);
            if !verified_failed {
                return outcome;
            }
        }
        PlaybackState::Paused
        | PlaybackState::Reset
        | PlaybackState::Error
        | PlaybackState::Ended => {
            // Resumed from a non-playing state: the stall clock starts now.
            monitor.stall_started_ms = Some(now_ms);
            change(monitor, PlaybackState::Playing);
        }
        PlaybackState::Playing | PlaybackState::Stalled => {}
    }

    let started = *monitor
        .stall_started_ms
        .get_or_insert(monitor.last_progress_ms.unwrap_or(monitor.monitored_since_ms));
    let stall_duration_ms = now_ms.saturating_sub(started);
    let confirm_ms = if buffer_exhausted {
        config.watchdog.exhausted_confirm_ms
    } else {
        config.watchdog.stall_confirm_ms
    };
    if monitor.state != PlaybackState::Stalled && stall_duration_ms < confirm_ms {
        return outcome;
    }

    let first = monitor.state != PlaybackState::Stalled;
    change(monitor, PlaybackState::Stalled);
    monitor.last_stall_event_ms = Some(now_ms);
    outcome.signal = Some(StepSignal::Stall {
        stall_duration_ms,
        buffer_exhausted,
        pause,
        first,
    });
    outcome
}

/// Periodic evaluator bound to the engine context.
pub struct Watchdog {
    ctx: Arc<EngineContext>,
}

impl Watchdog {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Samples one candidate and returns the signal for the engine, if any.
    pub fn tick(&self, id: CandidateId) -> Option<WatchdogEvent> {
        let surface = self.ctx.surface(id)?;
        let snapshot = SurfaceSnapshot::capture(surface.as_ref());
        let now = self.ctx.now();
        let config = &self.ctx.config;

        let (outcome, log_due) = {
            let mut registry = self.ctx.registry.lock();
            let monitor = registry.monitor_mut(id)?;
            let outcome = step(monitor, &snapshot, now, config);
            let log_due = match outcome.signal {
                Some(StepSignal::Stall { first, .. }) => {
                    let due = first
                        || monitor.last_stall_log_ms.map_or(true, |at| {
                            now.saturating_sub(at) >= config.watchdog.stall_log_interval_ms
                        });
                    if due {
                        monitor.last_stall_log_ms = Some(now);
                    }
                    due
                }
                _ => false,
            };
            (outcome, log_due)
        };

        if let Some((from, to)) = outcome.transition {
            debug!(candidate = %id, from = from.as_str(), to = to.as_str(), "state changed");
            self.ctx.emit(DiagnosticEvent::StateChanged {
                candidate: id,
                from,
                to,
            });
        }

        match outcome.signal? {
            StepSignal::Detached => Some(WatchdogEvent::Detached(id)),
            StepSignal::Recovered => {
                debug!(candidate = %id, "candidate recovered on its own");
                self.ctx
                    .emit(DiagnosticEvent::CandidateRecovered { candidate: id });
                Some(WatchdogEvent::Recovered(id))
            }
            StepSignal::Stall {
                stall_duration_ms,
                buffer_exhausted,
                pause,
                first,
            } => {
                if log_due {
                    warn!(
                        candidate = %id,
                        stall_ms = stall_duration_ms,
                        buffer_exhausted,
                        pause = ?pause,
                        "playback stall detected"
                    );
                    self.ctx.emit(DiagnosticEvent::StallDetected {
                        candidate: id,
                        stall_duration_ms,
                        buffer_exhausted,
                        pause,
                    });
                }
                Some(WatchdogEvent::Stall(StallEvent {
                    candidate: id,
                    stall_duration_ms,
                    buffer_exhausted,
                    pause,
                    first,
                }))
            }
        }
    }

    /// Ticks `id` until cancelled or the candidate disappears, forwarding signals.
    pub async fn run(
        self: Arc<Self>,
        id: CandidateId,
        token: CancellationToken,
        events: mpsc::UnboundedSender<WatchdogEvent>,
    ) {
        let period = Duration::from_millis(self.ctx.config.watchdog.tick_interval_ms);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.ctx.registry.lock().contains(id) {
                break;
            }
            if let Some(event) = self.tick(id) {
                let detached = matches!(event, WatchdogEvent::Detached(_));
                if events.send(event).is_err() || detached {
                    break;
                }
            }
        }
        debug!(candidate = %id, "watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{NetworkState, ReadyState, TimeRange};

    struct Harness {
        monitor: MonitorState,
        snapshot: SurfaceSnapshot,
        now: u64,
        config: EngineConfig,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                monitor: MonitorState::new(0, 0.0),
                snapshot: SurfaceSnapshot {
                    current_time: 0.0,
                    paused: false,
                    ended: false,
                    ready_state: ReadyState::HaveEnoughData,
                    network_state: NetworkState::Loading,
                    buffered: vec![TimeRange::new(0.0, 60.0)],
                    current_src: "https://cdn.example/a.m3u8".into(),
                    attached: true,
                    error: None,
                },
                now: 0,
                config: EngineConfig::default(),
            }
        }

        fn tick(&mut self, advance_s: f64) -> StepOutcome {
            self.now += 500;
            self.snapshot.current_time += advance_s;
            step(&mut self.monitor, &self.snapshot, self.now, &self.config)
        }
    }

    fn stall_signal(outcome: &StepOutcome) -> Option<(u64, bool, PauseAttribution, bool)> {
        match outcome.signal {
            Some(StepSignal::Stall {
                stall_duration_ms,
                buffer_exhausted,
                pause,
                first,
            }) => Some((stall_duration_ms, buffer_exhausted, pause, first)),
            _ => None,
        }
    }

    #[test]
    fn stall_confirmed_after_window() {
        let mut h = Harness::new();
        for _ in 0..4 {
            h.tick(0.5);
        }
        assert_eq!(h.monitor.state, PlaybackState::Playing);
        let mut confirmed_at = None;
        for i in 0..10 {
            let outcome = h.tick(0.0);
            if stall_signal(&outcome).is_some() {
                confirmed_at = Some(i);
                let (duration, exhausted, pause, first) = stall_signal(&outcome).unwrap();
                assert!(duration >= h.config.watchdog.stall_confirm_ms);
                assert!(!exhausted);
                assert_eq!(pause, PauseAttribution::NotPaused);
                assert!(first);
                break;
            }
        }
        assert_eq!(confirmed_at, Some(4));
        assert_eq!(h.monitor.state, PlaybackState::Stalled);

        let again = h.tick(0.0);
        let (_, _, _, first) = stall_signal(&again).unwrap();
        assert!(!first);
    }

    #[test]
    fn exhausted_buffer_confirms_sooner() {
        let mut h = Harness::new();
        h.snapshot.buffered = vec![TimeRange::new(0.0, 2.0)];
        for _ in 0..4 {
            h.tick(0.5);
        }
        let mut ticks = 0;
        loop {
            ticks += 1;
            let outcome = h.tick(0.0);
            if let Some((_, exhausted, _, _)) = stall_signal(&outcome) {
                assert!(exhausted);
                break;
            }
            assert!(ticks < 10);
        }
        assert_eq!(ticks, 3);
        assert!(h.monitor.buffer_starved_since_ms.is_some());
    }

    #[test]
    fn user_pause_is_not_a_stall() {
        let mut h = Harness::new();
        for _ in 0..4 {
            h.tick(0.5);
        }
        h.snapshot.paused = true;
        for _ in 0..20 {
            let outcome = h.tick(0.0);
            assert!(outcome.signal.is_none());
        }
        assert_eq!(h.monitor.state, PlaybackState::Paused);

        h.snapshot.paused = false;
        let outcome = h.tick(0.0);
        assert_eq!(h.monitor.state, PlaybackState::Playing);
        assert!(outcome.signal.is_none());
        h.tick(0.5);
        assert_eq!(h.monitor.state, PlaybackState::Playing);
    }

    #[test]
    fn pause_after_stall_stays_stalled() {
        let mut h = Harness::new();
        h.tick(0.5);
        for _ in 0..6 {
            h.tick(0.0);
        }
        assert_eq!(h.monitor.state, PlaybackState::Stalled);
        h.snapshot.paused = true;
        let outcome = h.tick(0.0);
        let (_, _, pause, _) = stall_signal(&outcome).unwrap();
        assert_eq!(pause, PauseAttribution::StallInduced);
        assert_eq!(h.monitor.state, PlaybackState::Stalled);
    }

    #[test]
    fn progress_recovers_stalled_candidate() {
        let mut h = Harness::new();
        h.tick(0.5);
        for _ in 0..6 {
            h.tick(0.0);
        }
        let outcome = h.tick(0.5);
        assert_eq!(outcome.signal, Some(StepSignal::Recovered));
        assert_eq!(
            outcome.transition,
            Some((PlaybackState::Stalled, PlaybackState::Playing))
        );
        assert_eq!(h.monitor.stall_started_ms, None);
    }

    #[test]
    fn healing_waits_for_verification() {
        let mut h = Harness::new();
        h.tick(0.5);
        h.monitor.transition(PlaybackState::Healing, h.now);
        h.monitor.heal_in_flight = true;
        for _ in 0..10 {
            assert!(h.tick(0.0).signal.is_none());
        }
        h.monitor.heal_in_flight = false;
        h.monitor.heal_finished_ms = Some(h.now);
        for _ in 0..3 {
            assert!(h.tick(0.0).signal.is_none());
            assert_eq!(h.monitor.state, PlaybackState::Healing);
        }
        let outcome = h.tick(0.0);
        assert!(stall_signal(&outcome).is_some());
        assert_eq!(h.monitor.state, PlaybackState::Stalled);
    }

    #[test]
    fn surface_conditions_map_to_states() {
        let mut h = Harness::new();
        h.snapshot.error = Some("decode".into());
        h.tick(0.0);
        assert_eq!(h.monitor.state, PlaybackState::Error);

        h.snapshot.error = None;
        h.snapshot.current_src.clear();
        h.snapshot.ready_state = ReadyState::HaveNothing;
        h.tick(0.0);
        assert_eq!(h.monitor.state, PlaybackState::Reset);
        assert!(h.monitor.reset_pending);

        h.snapshot.current_src = "https://cdn.example/b.m3u8".into();
        h.snapshot.ready_state = ReadyState::HaveEnoughData;
        h.tick(0.5);
        assert!(!h.monitor.reset_pending);
        assert_eq!(h.monitor.state, PlaybackState::Playing);

        h.snapshot.ended = true;
        h.tick(0.0);
        assert_eq!(h.monitor.state, PlaybackState::Ended);
    }

    #[test]
    fn detached_surface_signals_removal() {
        let mut h = Harness::new();
        h.snapshot.attached = false;
        assert_eq!(h.tick(0.5).signal, Some(StepSignal::Detached));
    }
}
