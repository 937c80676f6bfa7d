//! Verified, revertible failover between candidates.
//!
//! A failover switches the active candidate to the best alternative, asks it
//! to play, and gives it `failover.progress_timeout_ms` to prove progress
//! beyond its pre-switch baseline. Without that proof the switch is reverted
//! and the target is excluded from further failovers for a while. While an
//! attempt is in flight the [`FailoverLock`] is held, which freezes normal
//! candidate selection.
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::{CandidateId, CandidateScore, CandidateSelector, ScoreFactor, SwitchKind};
use crate::context::EngineContext;
use crate::events::DiagnosticEvent;
use crate::surface::ReadyState;

/// Shared flag meaning "a failover is being verified".
#[derive(Debug, Clone, Default)]
pub struct FailoverLock(Arc<AtomicBool>);

impl FailoverLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Takes the lock, returning false when it was already held.
    pub fn acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why a failover request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverRefusal {
    InProgress,
    Cooldown,
    NoCandidate,
}

impl FailoverRefusal {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverRefusal::InProgress => "in_progress",
            FailoverRefusal::Cooldown => "cooldown",
            FailoverRefusal::NoCandidate => "no_candidate",
        }
    }
}

/// How a verified attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverResolution {
    Succeeded,
    Reverted,
    /// Origin is gone; the target stays active unverified.
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
struct PendingFailover {
    attempt: u64,
    from: CandidateId,
    to: CandidateId,
    started_ms: u64,
    baseline_progress_ms: Option<u64>,
    baseline_position: f64,
}

#[derive(Debug, Default)]
struct FailoverState {
    pending: Option<PendingFailover>,
    verification: Option<CancellationToken>,
    attempts: u64,
    last_attempt_ms: Option<u64>,
    excluded_until: HashMap<CandidateId, u64>,
    last_probe_ms: HashMap<CandidateId, u64>,
}

pub struct FailoverManager {
    ctx: Arc<EngineContext>,
    selector: Arc<CandidateSelector>,
    lock: FailoverLock,
    shutdown: CancellationToken,
    state: Mutex<FailoverState>,
}

impl FailoverManager {
    pub fn new(
        ctx: Arc<EngineContext>,
        selector: Arc<CandidateSelector>,
        lock: FailoverLock,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            selector,
            lock,
            shutdown,
            state: Mutex::new(FailoverState::default()),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// True while `id` is the origin or target of the attempt being verified.
    pub fn is_involved(&self, id: CandidateId) -> bool {
        self.state
            .lock()
            .pending
            .is_some_and(|pending| pending.from == id || pending.to == id)
    }

    pub fn is_excluded(&self, id: CandidateId) -> bool {
        let now = self.ctx.now();
        self.state
            .lock()
            .excluded_until
            .get(&id)
            .is_some_and(|until| now < *until)
    }

    /// Switches away from `from` to the best alternative and starts verification.
    pub async fn attempt_failover(
        self: &Arc<Self>,
        from: CandidateId,
        reason: &str,
    ) -> Result<CandidateId, FailoverRefusal> {
        let now = self.ctx.now();
        let config = &self.ctx.config.failover;

        let pending = {
            let mut state = self.state.lock();
            let refusal = if state.pending.is_some() || self.lock.is_held() {
                Some(FailoverRefusal::InProgress)
            } else if state
                .last_attempt_ms
                .is_some_and(|last| now.saturating_sub(last) < config.cooldown_ms)
            {
                Some(FailoverRefusal::Cooldown)
            } else {
                None
            };
            if let Some(refusal) = refusal {
                drop(state);
                return Err(self.refuse(from, refusal));
            }

            state.excluded_until.retain(|_, until| now < *until);
            let excluded: Vec<CandidateId> = state.excluded_until.keys().copied().collect();
            let Some(to) = best_alternative(&self.selector.score_all(), from, &excluded) else {
                drop(state);
                return Err(self.refuse(from, FailoverRefusal::NoCandidate));
            };
            if !self.lock.acquire() {
                drop(state);
                return Err(self.refuse(from, FailoverRefusal::InProgress));
            }

            let registry = self.ctx.registry.lock();
            let baseline_progress_ms = registry.monitor(to).and_then(|m| m.last_progress_ms);
            let baseline_position = registry
                .surface(to)
                .map(|surface| surface.current_time())
                .unwrap_or(0.0);
            drop(registry);

            state.attempts += 1;
            let pending = PendingFailover {
                attempt: state.attempts,
                from,
                to,
                started_ms: now,
                baseline_progress_ms,
                baseline_position,
            };
            state.pending = Some(pending);
            state.verification = Some(self.shutdown.child_token());
            state.last_attempt_ms = Some(now);
            pending
        };

        let to = pending.to;
        info!(from = %from, to = %to, reason, "failover started");
        self.ctx.emit(DiagnosticEvent::FailoverStarted {
            from,
            to,
            reason: reason.to_string(),
        });
        self.selector.switch_to(to, SwitchKind::Failover, reason);

        if let Some(surface) = self.ctx.surface(to) {
            if let Err(err) = surface.play().await {
                warn!(candidate = %to, error = %err, "failover target refused to play");
            }
        }

        let Some(verification) = self.state.lock().verification.clone() else {
            // Cleared while the target was starting.
            return Ok(to);
        };
        let manager = Arc::clone(self);
        let timeout = Duration::from_millis(config.progress_timeout_ms);
        let attempt = pending.attempt;
        tokio::spawn(async move {
            tokio::select! {
                _ = verification.cancelled() => {
                    manager.abandon(attempt);
                }
                _ = tokio::time::sleep(timeout) => {
                    manager.resolve_attempt(attempt).await;
                }
            }
        });
        Ok(to)
    }

    fn refuse(&self, from: CandidateId, refusal: FailoverRefusal) -> FailoverRefusal {
        debug!(from = %from, refusal = refusal.as_str(), "failover refused");
        self.ctx
            .emit(DiagnosticEvent::FailoverRefused { from, refusal });
        refusal
    }

    /// Clears `attempt` if it is still the pending one.
    fn abandon(&self, attempt: u64) -> Option<PendingFailover> {
        let mut state = self.state.lock();
        let pending = state.pending.filter(|pending| pending.attempt == attempt)?;
        state.pending = None;
        if let Some(token) = state.verification.take() {
            token.cancel();
        }
        drop(state);
        self.lock.release();
        Some(pending)
    }

    async fn resolve_attempt(&self, attempt: u64) -> Option<FailoverResolution> {
        let current = self.state.lock().pending.map(|pending| pending.attempt);
        if current != Some(attempt) {
            return None;
        }
        self.resolve().await
    }

    /// Judges the pending attempt against its baseline.
    pub async fn resolve(&self) -> Option<FailoverResolution> {
        let pending = self.state.lock().pending?;
        let (from, to) = (pending.from, pending.to);
        let now = self.ctx.now();
        let epsilon = self.ctx.config.progress.epsilon_s;

        let (advanced, from_tracked) = {
            let registry = self.ctx.registry.lock();
            let progressed = registry
                .monitor(to)
                .and_then(|monitor| monitor.last_progress_ms)
                .is_some_and(|last| Some(last) > pending.baseline_progress_ms);
            let moved = registry.surface(to).is_some_and(|surface| {
                surface.is_attached()
                    && !surface.paused()
                    && surface.current_time() > pending.baseline_position + epsilon
            });
            (progressed || moved, registry.contains(from))
        };

        let resolution = if advanced {
            let dead_until = now + self.ctx.config.selection.dead_candidate_ms;
            {
                let mut registry = self.ctx.registry.lock();
                if let Some(monitor) = registry.monitor_mut(to) {
                    monitor.reset_backoff();
                }
                if let Some(monitor) = registry.monitor_mut(from) {
                    monitor.dead_until_ms = Some(dead_until);
                }
                registry.set_last_good(to);
            }
            info!(
                from = %from,
                to = %to,
                elapsed_ms = now.saturating_sub(pending.started_ms),
                "failover verified"
            );
            self.ctx.emit(DiagnosticEvent::FailoverSucceeded { from, to });
            self.ctx
                .emit(DiagnosticEvent::BackoffReset { candidate: to });
            if from_tracked {
                self.ctx.emit(DiagnosticEvent::CandidateMarkedDead {
                    candidate: from,
                    until_ms: dead_until,
                });
            }
            FailoverResolution::Succeeded
        } else if from_tracked {
            let exclusion_ms = self.ctx.config.failover.exclusion_ms;
            self.state
                .lock()
                .excluded_until
                .insert(to, now + exclusion_ms);
            warn!(from = %from, to = %to, "failover target did not progress; reverting");
            self.selector
                .switch_to(from, SwitchKind::FailoverRevert, "failover_unverified");
            self.ctx.emit(DiagnosticEvent::FailoverReverted { from, to });
            FailoverResolution::Reverted
        } else {
            warn!(from = %from, to = %to, "failover origin gone; keeping target");
            FailoverResolution::Abandoned
        };

        self.abandon(pending.attempt);

        if resolution == FailoverResolution::Reverted {
            if let Some(surface) = self.ctx.surface(from) {
                if let Err(err) = surface.play().await {
                    debug!(candidate = %from, error = %err, "origin play after revert failed");
                }
            }
        }
        Some(resolution)
    }

    /// Forgets bookkeeping for a removed candidate.
    ///
    /// A pending attempt involving `id` is cleared. When the target vanished
    /// the origin is made active again and returned so the caller can resume
    /// it; when the origin vanished the target stays active unverified.
    pub fn on_candidate_removed(&self, id: CandidateId) -> Option<CandidateId> {
        let pending = {
            let mut state = self.state.lock();
            state.excluded_until.remove(&id);
            state.last_probe_ms.remove(&id);
            let involved = state
                .pending
                .filter(|pending| pending.from == id || pending.to == id);
            involved
        }?;
        self.abandon(pending.attempt)?;

        if pending.to == id {
            warn!(from = %pending.from, to = %id, "failover target removed; restoring origin");
            self.selector
                .switch_to(pending.from, SwitchKind::FailoverRevert, "failover_target_removed");
            let restored = self.ctx.registry.lock().contains(pending.from);
            restored.then_some(pending.from)
        } else {
            warn!(from = %id, to = %pending.to, "failover origin removed; keeping target");
            None
        }
    }

    /// Asks a dormant candidate to play so it can build a progress streak.
    ///
    /// Cooldown-gated per candidate; never touches the active candidate.
    pub async fn probe_candidate(&self, id: CandidateId) -> bool {
        let now = self.ctx.now();
        if self.ctx.active() == Some(id) {
            return false;
        }
        {
            let mut state = self.state.lock();
            let cooldown = self.ctx.config.failover.probe_cooldown_ms;
            if state
                .last_probe_ms
                .get(&id)
                .is_some_and(|last| now.saturating_sub(*last) < cooldown)
            {
                return false;
            }
            state.last_probe_ms.insert(id, now);
        }
        let Some(surface) = self.ctx.surface(id) else {
            return false;
        };
        if !surface.is_attached() {
            return false;
        }

        debug!(candidate = %id, "probing dormant candidate");
        self.ctx
            .emit(DiagnosticEvent::CandidateProbed { candidate: id });
        if surface.ready_state() == ReadyState::HaveNothing {
            if let Err(err) = surface.load().await {
                debug!(candidate = %id, error = %err, "probe load failed");
                return false;
            }
        }
        match surface.play().await {
            Ok(()) => true,
            Err(err) => {
                debug!(candidate = %id, error = %err, "probe play failed");
                false
            }
        }
    }

    /// Probes every non-active candidate that has not proven progress.
    pub async fn probe_dormant(&self, except: CandidateId) -> usize {
        let dormant: Vec<CandidateId> = self
            .selector
            .score_all()
            .into_iter()
            .filter(|score| score.id != except && !score.progress_eligible)
            .filter(|score| !score.has_factor(ScoreFactor::Detached))
            .map(|score| score.id)
            .collect();
        let mut probed = 0;
        for id in dormant {
            if self.probe_candidate(id).await {
                probed += 1;
            }
        }
        probed
    }
}

/// Best failover target: proven and trusted first, then by score.
pub fn best_alternative(
    scores: &[CandidateScore],
    from: CandidateId,
    excluded: &[CandidateId],
) -> Option<CandidateId> {
    scores
        .iter()
        .filter(|score| score.id != from && !excluded.contains(&score.id) && !score.dead)
        .filter(|score| {
            !score.has_factor(ScoreFactor::Detached)
                && !score.has_factor(ScoreFactor::FallbackSource)
                && !score.has_factor(ScoreFactor::EndedOrErrored)
        })
        .max_by_key(|score| {
            (
                score.trusted && score.progress_eligible,
                score.score,
                Reverse(score.id),
            )
        })
        .map(|score| score.id)
}
