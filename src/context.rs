//! Dependencies shared by the engine components.
//!
//! Each component is an explicit object holding an `Arc<EngineContext>`; the
//! context carries the injected configuration, clock and event sink together
//! with the candidate registry they all act on.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::candidate::{CandidateId, CandidateRegistry};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::events::{DiagnosticEvent, EventBus, EventSink};
use crate::monitor::MonitorState;
use crate::surface::{PlaybackSurface, SurfaceSnapshot};

pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub registry: Mutex<CandidateRegistry>,
}

impl EngineContext {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config: Arc::new(config),
            clock,
            events: EventBus::new(sink),
            registry: Mutex::new(CandidateRegistry::new()),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        self.events.emit(self.now(), event);
    }

    pub fn active(&self) -> Option<CandidateId> {
        self.registry.lock().active()
    }

    pub fn candidate_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn surface(&self, id: CandidateId) -> Option<Arc<dyn PlaybackSurface>> {
        self.registry.lock().surface(id)
    }

    /// Snapshot of a candidate's surface, taken outside the registry lock.
    pub fn snapshot(&self, id: CandidateId) -> Option<SurfaceSnapshot> {
        let surface = self.surface(id)?;
        Some(SurfaceSnapshot::capture(surface.as_ref()))
    }

    /// Runs `f` against a candidate's monitor state.
    pub fn with_monitor<R>(&self, id: CandidateId, f: impl FnOnce(&mut MonitorState) -> R) -> Option<R> {
        let mut registry = self.registry.lock();
        registry.monitor_mut(id).map(f)
    }

    /// Whether the candidate is still tracked and its surface attached.
    pub fn is_attached(&self, id: CandidateId) -> bool {
        self.surface(id).is_some_and(|surface| surface.is_attached())
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("events", &self.events)
            .field("candidates", &self.registry.lock().len())
            .finish()
    }
}
