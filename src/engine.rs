//! Engine façade wiring the components together.
//!
//! [`StreamEngine`] owns one [`EngineContext`] and the component objects
//! built on it (selector, failover manager, recovery policy, heal pipeline,
//! stall handler, watchdog). With background tasks enabled it runs one
//! watchdog loop per candidate, a signal dispatcher and a periodic selection
//! pass; without them, tests drive the same code through [`StreamEngine::tick_all`].
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::candidate::{CandidateId, CandidateSelector, SelectionOutcome};
use crate::clock::{Clock, TokioClock};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::events::{DiagnosticEvent, EventSink, RemovalReason, TracingSink};
use crate::failover::{FailoverLock, FailoverManager};
use crate::heal::{CatchUpScheduler, HealPipeline};
use crate::monitor::{StallEvent, Watchdog, WatchdogEvent};
use crate::recovery::{LogRefresher, RecoveryPolicy, RefreshRequester};
use crate::stall::{StallHandler, StallResolution};
use crate::surface::PlaybackSurface;

const STALL_CHANNEL_CAPACITY: usize = 64;

/// Surface lifecycle facts from the host page.
pub enum DiscoveryEvent {
    Discovered(Arc<dyn PlaybackSurface>),
    /// Surface with this key left the page.
    Removed(String),
}

impl std::fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryEvent::Discovered(surface) => {
                f.debug_tuple("Discovered").field(&surface.key()).finish()
            }
            DiscoveryEvent::Removed(key) => f.debug_tuple("Removed").field(key).finish(),
        }
    }
}

/// Builder for [`StreamEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn EventSink>>,
    refresher: Option<Arc<dyn RefreshRequester>>,
    background: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: None,
            sink: None,
            refresher: None,
            background: true,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn RefreshRequester>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Disables the watchdog, dispatcher and selection loops.
    pub fn manual(mut self) -> Self {
        self.background = false;
        self
    }

    /// Validates the configuration and starts the engine.
    ///
    /// # Errors
    /// Returns `EngineError::Config` when the configuration is inconsistent.
    ///
    /// Must be called inside a tokio runtime unless [`EngineBuilder::manual`] was used.
    pub fn build(self) -> Result<StreamEngine, EngineError> {
        self.config.validate()?;
        let fingerprint = self.config.fingerprint();
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let refresher = self.refresher.unwrap_or_else(|| Arc::new(LogRefresher));

        let ctx = Arc::new(EngineContext::new(self.config, clock, sink));
        let shutdown = CancellationToken::new();
        let lock = FailoverLock::new();
        let selector = Arc::new(CandidateSelector::new(ctx.clone(), lock.clone()));
        let failover = Arc::new(FailoverManager::new(
            ctx.clone(),
            selector.clone(),
            lock,
            shutdown.child_token(),
        ));
        let policy = Arc::new(RecoveryPolicy::new(
            ctx.clone(),
            selector.clone(),
            failover.clone(),
            refresher,
        ));
        let pipeline = Arc::new(HealPipeline::new(
            ctx.clone(),
            CatchUpScheduler::new(ctx.clone(), shutdown.child_token()),
        ));
        let stalls = Arc::new(StallHandler::new(
            ctx.clone(),
            selector.clone(),
            failover.clone(),
            policy.clone(),
            pipeline.clone(),
        ));
        let watchdog = Arc::new(Watchdog::new(ctx.clone()));
        let (stall_tx, _) = broadcast::channel(STALL_CHANNEL_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        info!(
            session = %ctx.events.session_id(),
            fingerprint = %fingerprint,
            background = self.background,
            "stream engine started"
        );

        let inner = Arc::new(EngineInner {
            ctx,
            selector,
            failover,
            policy,
            pipeline,
            stalls,
            watchdog,
            stall_tx,
            signal_tx,
            shutdown,
            watchdogs: Mutex::new(HashMap::new()),
            background: self.background,
        });
        if inner.background {
            tokio::spawn(dispatch_signals(inner.clone(), signal_rx));
            tokio::spawn(evaluate_periodically(inner.clone()));
        }
        Ok(StreamEngine { inner })
    }
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    selector: Arc<CandidateSelector>,
    failover: Arc<FailoverManager>,
    policy: Arc<RecoveryPolicy>,
    pipeline: Arc<HealPipeline>,
    stalls: Arc<StallHandler>,
    watchdog: Arc<Watchdog>,
    stall_tx: broadcast::Sender<StallEvent>,
    signal_tx: mpsc::UnboundedSender<WatchdogEvent>,
    shutdown: CancellationToken,
    watchdogs: Mutex<HashMap<CandidateId, CancellationToken>>,
    background: bool,
}

impl EngineInner {
    fn register(&self, surface: Arc<dyn PlaybackSurface>) -> Result<CandidateId, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        let src = surface.current_src();
        let (id, added) = self.ctx.registry.lock().insert(surface, self.ctx.now());
        if !added {
            debug!(candidate = %id, "surface already monitored");
            return Ok(id);
        }
        info!(candidate = %id, src = %src, "monitoring candidate");
        self.ctx
            .emit(DiagnosticEvent::CandidateAdded { candidate: id, src });

        if self.background {
            let token = self.shutdown.child_token();
            self.watchdogs.lock().insert(id, token.clone());
            tokio::spawn(
                self.watchdog
                    .clone()
                    .run(id, token, self.signal_tx.clone()),
            );
        }

        // Active candidates are never pruned, so no origin is restored here.
        for pruned in self.selector.prune(&[id]) {
            self.forget(pruned);
        }
        self.selector.evaluate("candidate_added");
        Ok(id)
    }

    /// Drops per-candidate bookkeeping outside the registry.
    ///
    /// Returns the failover origin restored because `id` was its target.
    fn forget(&self, id: CandidateId) -> Option<CandidateId> {
        if let Some(token) = self.watchdogs.lock().remove(&id) {
            token.cancel();
        }
        self.failover.on_candidate_removed(id)
    }

    async fn remove(&self, id: CandidateId, reason: RemovalReason) -> Result<(), EngineError> {
        let was_active = {
            let mut registry = self.ctx.registry.lock();
            let was_active = registry.active() == Some(id);
            registry
                .remove(id)
                .ok_or(EngineError::UnknownCandidate(id))?;
            was_active
        };
        let restored = self.forget(id);
        info!(candidate = %id, reason = ?reason, "candidate removed");
        self.ctx
            .emit(DiagnosticEvent::CandidateRemoved { candidate: id, reason });
        if let Some(origin) = restored {
            if let Some(surface) = self.ctx.surface(origin) {
                if let Err(err) = surface.play().await {
                    debug!(candidate = %origin, error = %err, "origin play after target removal failed");
                }
            }
        } else if was_active {
            let outcome = self.selector.evaluate("active_removed");
            self.activate(&outcome).await;
        }
        Ok(())
    }

    /// Starts playback on a newly chosen active candidate.
    async fn activate(&self, outcome: &SelectionOutcome) {
        if !outcome.changed() {
            return;
        }
        let Some(active) = outcome.active else {
            return;
        };
        if let Some(surface) = self.ctx.surface(active) {
            if let Err(err) = surface.play().await {
                debug!(candidate = %active, error = %err, "play after selection failed");
            }
        }
    }

    async fn handle_signal(self: &Arc<Self>, event: WatchdogEvent) {
        match event {
            WatchdogEvent::Stall(stall) => {
                if stall.first {
                    // No subscribers is fine.
                    let _ = self.stall_tx.send(stall);
                }
                if self.background {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        inner.stalls.handle(stall).await;
                    });
                } else {
                    self.stalls.handle(stall).await;
                }
            }
            WatchdogEvent::Recovered(id) => self.stalls.on_recovered(id),
            WatchdogEvent::Detached(id) => {
                if let Err(err) = self.remove(id, RemovalReason::Detached).await {
                    debug!(candidate = %id, error = %err, "detached candidate already gone");
                }
            }
        }
    }
}

async fn dispatch_signals(inner: Arc<EngineInner>, mut signals: mpsc::UnboundedReceiver<WatchdogEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = signals.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        inner.handle_signal(event).await;
    }
    debug!("signal dispatcher stopped");
}

async fn evaluate_periodically(inner: Arc<EngineInner>) {
    let period = Duration::from_millis(inner.ctx.config.selection.evaluate_interval_ms);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let outcome = inner.selector.evaluate("periodic");
        inner.activate(&outcome).await;
    }
}

/// Multi-candidate stream health and recovery engine.
///
/// # Guarantees
/// * At most one candidate per surface key; ids are never reused.
/// * Selection never runs while a failover is being verified.
/// * At most one heal runs per candidate.
/// * Dropping the engine cancels every background task it started.
pub struct StreamEngine {
    inner: Arc<EngineInner>,
}

impl StreamEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Starts monitoring a surface and returns its candidate id.
    ///
    /// Registering the same surface key twice returns the existing id.
    ///
    /// # Errors
    /// Returns `EngineError::ShutDown` after [`StreamEngine::shutdown`].
    pub fn monitor(&self, surface: Arc<dyn PlaybackSurface>) -> Result<CandidateId, EngineError> {
        self.inner.register(surface)
    }

    /// Stops monitoring a candidate.
    ///
    /// # Errors
    /// Returns `EngineError::UnknownCandidate` when the id is not tracked.
    pub async fn stop_monitoring(&self, id: CandidateId) -> Result<(), EngineError> {
        self.inner.remove(id, RemovalReason::Deregistered).await
    }

    /// Stops monitoring the candidate that wraps the surface with `key`.
    pub async fn stop_monitoring_key(&self, key: &str) -> Result<(), EngineError> {
        let id = self
            .inner
            .ctx
            .registry
            .lock()
            .find_by_key(key)
            .ok_or_else(|| EngineError::UnknownKey(key.to_string()))?;
        self.stop_monitoring(id).await
    }

    /// Consumes discovery events until the channel closes or the engine shuts down.
    pub fn attach_discovery(&self, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(DiscoveryEvent::Discovered(surface)) => {
                        if let Err(err) = inner.register(surface) {
                            debug!(error = %err, "discovered surface not monitored");
                        }
                    }
                    Some(DiscoveryEvent::Removed(key)) => {
                        let found = inner.ctx.registry.lock().find_by_key(&key);
                        if let Some(id) = found {
                            if let Err(err) = inner.remove(id, RemovalReason::Detached).await {
                                debug!(key = %key, error = %err, "removal raced");
                            }
                        }
                    }
                    None => break,
                }
            }
            debug!("discovery stream closed");
        })
    }

    /// Confirmed stalls, one event per stall episode.
    pub fn subscribe_stalls(&self) -> broadcast::Receiver<StallEvent> {
        self.inner.stall_tx.subscribe()
    }

    /// Runs one watchdog pass over every candidate and dispatches its signals.
    pub async fn tick_all(&self) -> Vec<WatchdogEvent> {
        let ids = self.inner.ctx.registry.lock().ids();
        let mut events = Vec::new();
        for id in ids {
            if let Some(event) = self.inner.watchdog.tick(id) {
                events.push(event);
            }
        }
        for event in &events {
            self.inner.handle_signal(*event).await;
        }
        events
    }

    /// Handles one stall event directly.
    pub async fn handle_stall(&self, event: StallEvent) -> StallResolution {
        self.inner.stalls.handle(event).await
    }

    /// Runs one selection pass and starts playback on a newly chosen candidate.
    pub async fn evaluate(&self) -> SelectionOutcome {
        let outcome = self.inner.selector.evaluate("manual");
        self.inner.activate(&outcome).await;
        outcome
    }

    pub fn active(&self) -> Option<CandidateId> {
        self.inner.ctx.active()
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.ctx.events.session_id()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.inner.ctx
    }

    pub fn selector(&self) -> &Arc<CandidateSelector> {
        &self.inner.selector
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.inner.failover
    }

    pub fn policy(&self) -> &Arc<RecoveryPolicy> {
        &self.inner.policy
    }

    pub fn pipeline(&self) -> &Arc<HealPipeline> {
        &self.inner.pipeline
    }

    /// Cancels every background task.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("stream engine shutting down");
        }
        self.inner.shutdown.cancel();
        self.inner.watchdogs.lock().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
