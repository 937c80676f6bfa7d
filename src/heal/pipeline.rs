//! Heal pipeline: `POLL → REVALIDATE → SEEK`.
//!
//! * POLL asks the gap finder for a heal point until one with enough headroom
//!   appears, the candidate resumes on its own, or the poll times out. A
//!   point that is valid but thin is deferred until `heal.max_defer_ms`.
//! * REVALIDATE recomputes the point right before seeking, since buffered
//!   data moves while polling.
//! * SEEK sets the playhead and requests playback. One abort-class failure
//!   is retried after a short delay with a recomputed point.
//!
//! Only one heal runs per candidate. Every phase entry checks that the
//! candidate is still attached and bails out with `Detached` otherwise.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::{find_heal_point, HeadroomMode, HealPoint};
use crate::candidate::CandidateId;
use crate::context::EngineContext;
use crate::error::HealError;
use crate::events::DiagnosticEvent;
use crate::heal::catch_up::CatchUpScheduler;
use crate::heal::HealOutcome;
use crate::monitor::PlaybackState;
use crate::surface::SurfaceSnapshot;

/// Removes the candidate from the in-flight set when dropped.
struct HealingGuard<'a> {
    healing: &'a Mutex<HashSet<CandidateId>>,
    id: CandidateId,
}

impl Drop for HealingGuard<'_> {
    fn drop(&mut self) {
        self.healing.lock().remove(&self.id);
    }
}

/// Where playback stood when the heal began.
#[derive(Debug, Clone, Copy)]
struct Baseline {
    progress_ms: Option<u64>,
    position: f64,
}

enum Polled {
    Point(HealPoint),
    Recovered,
}

enum Sought {
    Healed(HealPoint),
    Recovered,
}

pub struct HealPipeline {
    ctx: Arc<EngineContext>,
    healing: Mutex<HashSet<CandidateId>>,
    catch_up: CatchUpScheduler,
}

impl HealPipeline {
    pub fn new(ctx: Arc<EngineContext>, catch_up: CatchUpScheduler) -> Self {
        Self {
            ctx,
            healing: Mutex::new(HashSet::new()),
            catch_up,
        }
    }

    pub fn is_healing(&self, id: CandidateId) -> bool {
        self.healing.lock().contains(&id)
    }

    /// Runs one heal attempt for `id`.
    pub async fn heal(&self, id: CandidateId) -> HealOutcome {
        if !self.healing.lock().insert(id) {
            debug!(candidate = %id, "heal already in flight");
            return HealOutcome::AlreadyHealing;
        }
        let _guard = HealingGuard {
            healing: &self.healing,
            id,
        };

        let started = self.ctx.now();
        let Some(surface) = self.ctx.surface(id) else {
            return HealOutcome::Failed(HealError::Detached);
        };
        let position = surface.current_time();
        let marked = self.ctx.with_monitor(id, |m| {
            m.heal_in_flight = true;
            let previous = m.transition(PlaybackState::Healing, started);
            (m.last_progress_ms, previous)
        });
        let Some((progress_ms, previous)) = marked else {
            return HealOutcome::Failed(HealError::Detached);
        };
        if let Some(from) = previous {
            self.ctx.emit(DiagnosticEvent::StateChanged {
                candidate: id,
                from,
                to: PlaybackState::Healing,
            });
        }
        info!(candidate = %id, position, "heal started");
        self.ctx
            .emit(DiagnosticEvent::HealStarted { candidate: id });

        let baseline = Baseline {
            progress_ms,
            position,
        };
        let outcome = match self.run(id, baseline).await {
            Ok(Sought::Healed(point)) => HealOutcome::Healed(point),
            Ok(Sought::Recovered) => HealOutcome::Recovered,
            Err(err) => HealOutcome::Failed(err),
        };

        let finished = self.ctx.now();
        self.ctx.with_monitor(id, |m| {
            m.heal_in_flight = false;
            m.heal_finished_ms = Some(finished);
        });
        let duration_ms = finished.saturating_sub(started);
        match &outcome {
            HealOutcome::Failed(err) => {
                warn!(candidate = %id, error = %err, duration_ms, "heal failed")
            }
            _ => info!(candidate = %id, outcome = ?outcome.kind(), duration_ms, "heal finished"),
        }
        self.ctx.emit(DiagnosticEvent::HealFinished {
            candidate: id,
            outcome: outcome.kind(),
            point: outcome.point(),
            duration_ms,
        });
        if let HealOutcome::Healed(_) = outcome {
            self.catch_up.schedule(id);
        }
        outcome
    }

    async fn run(&self, id: CandidateId, baseline: Baseline) -> Result<Sought, HealError> {
        let point = match self.poll(id, baseline).await? {
            Polled::Recovered => return Ok(Sought::Recovered),
            Polled::Point(point) => point,
        };

        // REVALIDATE
        let snapshot = self.attached_snapshot(id)?;
        if self.self_recovered(id, baseline, &snapshot) {
            return Ok(Sought::Recovered);
        }
        let fresh = self.locate(&snapshot).ok_or(HealError::StaleGone)?;
        if fresh.key() != point.key() {
            debug!(candidate = %id, from = point.start, to = fresh.start, "heal point moved");
        }

        self.seek(id, fresh).await
    }

    async fn poll(&self, id: CandidateId, baseline: Baseline) -> Result<Polled, HealError> {
        let config = &self.ctx.config.heal;
        let deadline = self.ctx.now() + config.poll_timeout_ms;
        let interval = Duration::from_millis(config.poll_interval_ms);
        let mut deferred_since: Option<u64> = None;

        loop {
            let snapshot = self.attached_snapshot(id)?;
            if self.self_recovered(id, baseline, &snapshot) {
                return Ok(Polled::Recovered);
            }
            let now = self.ctx.now();
            if let Some(point) = self.locate(&snapshot) {
                if point.headroom() >= config.defer_headroom_s {
                    return Ok(Polled::Point(point));
                }
                let since = *deferred_since.get_or_insert(now);
                if now.saturating_sub(since) >= config.max_defer_ms {
                    debug!(candidate = %id, headroom = point.headroom(), "deferral ceiling reached");
                    return Err(HealError::NoHealPoint);
                }
            }
            if now >= deadline {
                return Err(HealError::NoHealPoint);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn seek(&self, id: CandidateId, mut point: HealPoint) -> Result<Sought, HealError> {
        let repeat_limit = self.ctx.config.heal.repeat_failover_count;
        let retry_delay = Duration::from_millis(self.ctx.config.heal.abort_retry_delay_ms);
        let mut retried = false;

        loop {
            let surface = self
                .ctx
                .surface(id)
                .filter(|surface| surface.is_attached())
                .ok_or(HealError::Detached)?;
            let now = self.ctx.now();
            let repeats = self
                .ctx
                .with_monitor(id, |m| {
                    m.rebase(point.start, now);
                    m.record_heal_point(point.key())
                })
                .ok_or(HealError::Detached)?;

            debug!(
                candidate = %id,
                target = point.start,
                nudge = point.is_nudge,
                gap = point.gap_size,
                repeats,
                "seeking to heal point"
            );
            surface.set_current_time(point.start);
            match surface.play().await {
                Ok(()) if repeats >= repeat_limit => {
                    return Err(HealError::PlayStuck { repeats });
                }
                Ok(()) => return Ok(Sought::Healed(point)),
                Err(err) if err.is_abort() && !retried => {
                    retried = true;
                    debug!(candidate = %id, error = %err, "seek aborted; retrying once");
                    tokio::time::sleep(retry_delay).await;
                    let snapshot = self.attached_snapshot(id)?;
                    point = self.locate(&snapshot).ok_or(HealError::StaleGone)?;
                }
                Err(err) => return Err(HealError::from(err)),
            }
        }
    }

    fn attached_snapshot(&self, id: CandidateId) -> Result<SurfaceSnapshot, HealError> {
        self.ctx
            .snapshot(id)
            .filter(|snapshot| snapshot.attached)
            .ok_or(HealError::Detached)
    }

    fn locate(&self, snapshot: &SurfaceSnapshot) -> Option<HealPoint> {
        let mode = if snapshot.buffer_ahead() < self.ctx.config.watchdog.exhausted_ahead_s {
            HeadroomMode::Relaxed
        } else {
            HeadroomMode::Strict
        };
        find_heal_point(
            &snapshot.buffered,
            snapshot.current_time,
            &self.ctx.config.gap,
            mode,
        )
    }

    fn self_recovered(&self, id: CandidateId, baseline: Baseline, snapshot: &SurfaceSnapshot) -> bool {
        let progressed = self
            .ctx
            .with_monitor(id, |m| m.last_progress_ms > baseline.progress_ms)
            .unwrap_or(false);
        let moved = !snapshot.paused
            && snapshot.current_time > baseline.position + self.ctx.config.progress.epsilon_s;
        progressed || moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::config::EngineConfig;
    use crate::events::MemorySink;
    use crate::heal::HealOutcomeKind;
    use crate::monitor::{Watchdog, WatchdogEvent};
    use crate::sim::SimulatedSurface;
    use crate::surface::{PlaybackSurface, SurfaceError, TimeRange};
    use tokio_util::sync::CancellationToken;

    fn pipeline(surface: Arc<SimulatedSurface>) -> (HealPipeline, CandidateId, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let ctx = Arc::new(EngineContext::new(
            EngineConfig::default(),
            Arc::new(TokioClock::new()),
            sink.clone(),
        ));
        let (id, _) = ctx.registry.lock().insert(surface, 0);
        ctx.registry.lock().set_active(Some(id));
        let catch_up = CatchUpScheduler::new(ctx.clone(), CancellationToken::new());
        (HealPipeline::new(ctx, catch_up), id, sink)
    }

    fn stuck_at(position: f64, ranges: &[(f64, f64)]) -> Arc<SimulatedSurface> {
        let surface = Arc::new(SimulatedSurface::new("video"));
        surface.set_buffered(ranges.iter().map(|(s, e)| TimeRange::new(*s, *e)).collect());
        surface.place_playhead(position);
        surface.set_paused(true);
        surface
    }

    #[tokio::test(start_paused = true)]
    async fn jumps_gap_and_reports_point() {
        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 40.0)]);
        let (pipeline, id, sink) = pipeline(surface.clone());
        let outcome = pipeline.heal(id).await;
        let HealOutcome::Healed(point) = outcome else {
            panic!("expected heal, got {outcome:?}");
        };
        assert!(!point.is_nudge);
        assert!((point.start - 12.1).abs() < 1e-9);
        assert!((surface.current_time() - 12.1).abs() < 1e-9);
        assert!(!surface.paused());
        assert_eq!(sink.count("heal_started"), 1);
        assert_eq!(sink.count("heal_finished"), 1);
        assert!(!pipeline.is_healing(id));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_point() {
        let surface = stuck_at(9.9, &[(0.0, 10.0)]);
        let (pipeline, id, _sink) = pipeline(surface);
        let started = tokio::time::Instant::now();
        let outcome = pipeline.heal(id).await;
        assert_eq!(outcome, HealOutcome::Failed(HealError::NoHealPoint));
        assert!(started.elapsed() >= Duration::from_millis(15_000));
    }

    #[tokio::test(start_paused = true)]
    async fn thin_point_is_deferred_then_dropped() {
        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 13.5)]);
        let (pipeline, id, _sink) = pipeline(surface);
        let started = tokio::time::Instant::now();
        let outcome = pipeline.heal(id).await;
        assert_eq!(outcome.kind(), HealOutcomeKind::NoHealPoint);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3_000));
        assert!(waited < Duration::from_millis(15_000));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_candidate_aborts() {
        let surface = stuck_at(9.9, &[(0.0, 10.0)]);
        let (pipeline, id, _sink) = pipeline(surface.clone());
        let handle = tokio::spawn(async move { pipeline.heal(id).await });
        tokio::time::sleep(Duration::from_millis(600)).await;
        surface.set_attached(false);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, HealOutcome::Failed(HealError::Detached));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_retried_once() {
        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 40.0)]);
        surface.fail_next_play(SurfaceError::Aborted("interrupted".into()));
        let (pipeline, id, _sink) = pipeline(surface.clone());
        assert!(matches!(pipeline.heal(id).await, HealOutcome::Healed(_)));

        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 40.0)]);
        surface.fail_next_play(SurfaceError::Aborted("interrupted".into()));
        surface.fail_next_play(SurfaceError::Aborted("interrupted again".into()));
        let (pipeline, id, _sink) = self::pipeline(surface);
        assert_eq!(pipeline.heal(id).await.kind(), HealOutcomeKind::AbortError);
    }

    #[tokio::test(start_paused = true)]
    async fn player_error_fails_without_retry() {
        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 40.0)]);
        surface.fail_next_play(SurfaceError::Player("decode".into()));
        let (pipeline, id, _sink) = pipeline(surface);
        assert_eq!(pipeline.heal(id).await.kind(), HealOutcomeKind::PlayFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_seek_to_same_point_is_stuck() {
        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 40.0)]);
        let (pipeline, id, _sink) = pipeline(surface.clone());
        for attempt in 0..3 {
            surface.place_playhead(10.0);
            surface.set_paused(true);
            let outcome = pipeline.heal(id).await;
            assert!(matches!(outcome, HealOutcome::Healed(_)), "attempt {attempt}");
        }
        surface.place_playhead(10.0);
        surface.set_paused(true);
        assert_eq!(
            pipeline.heal(id).await,
            HealOutcome::Failed(HealError::PlayStuck { repeats: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seek_without_playback_is_not_progress() {
        let surface = stuck_at(10.0, &[(0.0, 10.0), (12.0, 40.0)]);
        surface.set_rate(0.0);
        surface.set_paused(false);
        let (pipeline, id, _sink) = pipeline(surface.clone());
        let ctx = pipeline.ctx.clone();
        let watchdog = Watchdog::new(ctx.clone());

        assert!(matches!(pipeline.heal(id).await, HealOutcome::Healed(_)));
        assert!((surface.current_time() - 12.1).abs() < 1e-9);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(watchdog.tick(id), None);
        let (state, last_progress) = ctx
            .with_monitor(id, |m| (m.state, m.last_progress_ms))
            .unwrap();
        assert_eq!(state, PlaybackState::Healing);
        assert_eq!(last_progress, None);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(matches!(watchdog.tick(id), Some(WatchdogEvent::Stall(_))));
        assert_eq!(
            ctx.with_monitor(id, |m| m.state),
            Some(PlaybackState::Stalled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn self_recovery_is_not_a_failure() {
        let surface = stuck_at(9.9, &[(0.0, 10.0)]);
        let (pipeline, id, _sink) = pipeline(surface.clone());
        let handle = tokio::spawn(async move { pipeline.heal(id).await });
        tokio::time::sleep(Duration::from_millis(600)).await;
        surface.place_playhead(10.5);
        surface.set_paused(false);
        assert_eq!(handle.await.unwrap(), HealOutcome::Recovered);
    }
}
