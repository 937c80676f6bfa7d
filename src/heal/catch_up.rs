//! Post-heal catch-up towards the live edge.
//!
//! Heal points are conservative and often leave playback far behind the
//! newest buffered data. Once the healed candidate has played steadily for a
//! while, a single seek brings it back to `target_lag_s` behind the edge.
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::live_edge;
use crate::candidate::CandidateId;
use crate::config::CatchUpConfig;
use crate::context::EngineContext;
use crate::events::DiagnosticEvent;
use crate::monitor::{MonitorState, PlaybackState};
use crate::surface::SurfaceSnapshot;

/// Seek target for a catch-up, if one is warranted right now.
pub fn plan_catch_up(
    snapshot: &SurfaceSnapshot,
    monitor: &MonitorState,
    config: &CatchUpConfig,
) -> Option<f64> {
    if !config.enabled || !snapshot.attached || snapshot.paused {
        return None;
    }
    if monitor.state != PlaybackState::Playing || monitor.progress_streak_ms < config.min_stable_ms {
        return None;
    }
    let edge = live_edge(&snapshot.buffered)?;
    let lag = edge - snapshot.current_time;
    if lag <= config.max_lag_s {
        return None;
    }
    Some(edge - config.target_lag_s)
}

/// Spawns delayed catch-up checks.
pub struct CatchUpScheduler {
    ctx: Arc<EngineContext>,
    shutdown: CancellationToken,
}

impl CatchUpScheduler {
    pub fn new(ctx: Arc<EngineContext>, shutdown: CancellationToken) -> Self {
        Self { ctx, shutdown }
    }

    /// Checks `id` once after `catch_up.delay_ms`.
    pub fn schedule(&self, id: CandidateId) {
        if !self.ctx.config.catch_up.enabled {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown.clone();
        let delay = Duration::from_millis(ctx.config.catch_up.delay_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    apply(&ctx, id);
                }
            }
        });
    }
}

/// Applies a catch-up seek to `id` when it is still the stable active candidate.
pub fn apply(ctx: &EngineContext, id: CandidateId) -> Option<f64> {
    if ctx.active() != Some(id) {
        debug!(candidate = %id, "catch-up skipped; no longer active");
        return None;
    }
    let surface = ctx.surface(id)?;
    let snapshot = SurfaceSnapshot::capture(surface.as_ref());
    let target = ctx.with_monitor(id, |monitor| {
        plan_catch_up(&snapshot, monitor, &ctx.config.catch_up)
    })??;

    surface.set_current_time(target);
    let now = ctx.now();
    ctx.with_monitor(id, |monitor| monitor.rebase(target, now));
    info!(
        candidate = %id,
        from_s = snapshot.current_time,
        to_s = target,
        "caught up towards live edge"
    );
    ctx.emit(DiagnosticEvent::CatchUpApplied {
        candidate: id,
        from_s: snapshot.current_time,
        to_s: target,
    });
    Some(target)
}
