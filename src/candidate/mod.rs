//! Candidates and the registry that owns them.
//!
//! A candidate pairs one playback surface with its monitor state. The registry
//! also records which candidate is active and which one was last known good;
//! both are plain ids so removal never leaves a dangling reference.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::monitor::MonitorState;
use crate::surface::{PlaybackSurface, SurfaceSnapshot};

pub mod scorer;
pub mod selector;

pub use scorer::{score_candidate, CandidateScore, ScoreFactor};
pub use selector::{CandidateSelector, SelectionOutcome, SuppressionCause, SwitchKind};

/// Stable candidate identity, unique for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CandidateId(u64);

impl CandidateId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate-{}", self.0)
    }
}

/// Tracked media source.
pub struct Candidate {
    pub id: CandidateId,
    pub surface: Arc<dyn PlaybackSurface>,
    pub monitor: MonitorState,
}

impl Candidate {
    pub fn snapshot(&self) -> SurfaceSnapshot {
        SurfaceSnapshot::capture(self.surface.as_ref())
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.id)
            .field("surface", &self.surface.key())
            .field("state", &self.monitor.state)
            .finish()
    }
}

/// Owner of all candidates plus the active/last-good pointers.
#[derive(Debug, Default)]
pub struct CandidateRegistry {
    candidates: BTreeMap<CandidateId, Candidate>,
    active: Option<CandidateId>,
    last_good: Option<CandidateId>,
    next_id: u64,
}

impl CandidateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a surface, returning the existing id when its key is already tracked.
    pub fn insert(&mut self, surface: Arc<dyn PlaybackSurface>, now_ms: u64) -> (CandidateId, bool) {
        if let Some(existing) = self.find_by_key(surface.key()) {
            return (existing, false);
        }
        self.next_id += 1;
        let id = CandidateId(self.next_id);
        let monitor = MonitorState::new(now_ms, surface.current_time());
        self.candidates.insert(
            id,
            Candidate {
                id,
                surface,
                monitor,
            },
        );
        (id, true)
    }

    /// Removes a candidate and clears the pointers that referenced it.
    pub fn remove(&mut self, id: CandidateId) -> Option<Candidate> {
        let removed = self.candidates.remove(&id)?;
        if self.active == Some(id) {
            self.active = None;
        }
        if self.last_good == Some(id) {
            self.last_good = None;
        }
        Some(removed)
    }

    pub fn find_by_key(&self, key: &str) -> Option<CandidateId> {
        self.candidates
            .values()
            .find(|candidate| candidate.surface.key() == key)
            .map(|candidate| candidate.id)
    }

    pub fn get(&self, id: CandidateId) -> Option<&Candidate> {
        self.candidates.get(&id)
    }

    pub fn get_mut(&mut self, id: CandidateId) -> Option<&mut Candidate> {
        self.candidates.get_mut(&id)
    }

    pub fn contains(&self, id: CandidateId) -> bool {
        self.candidates.contains_key(&id)
    }

    pub fn surface(&self, id: CandidateId) -> Option<Arc<dyn PlaybackSurface>> {
        self.candidates.get(&id).map(|c| c.surface.clone())
    }

    pub fn monitor(&self, id: CandidateId) -> Option<&MonitorState> {
        self.candidates.get(&id).map(|c| &c.monitor)
    }

    pub fn monitor_mut(&mut self, id: CandidateId) -> Option<&mut MonitorState> {
        self.candidates.get_mut(&id).map(|c| &mut c.monitor)
    }

    pub fn ids(&self) -> Vec<CandidateId> {
        self.candidates.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Active id, only while it still refers to a tracked candidate.
    pub fn active(&self) -> Option<CandidateId> {
        self.active.filter(|id| self.candidates.contains_key(id))
    }

    pub fn set_active(&mut self, id: Option<CandidateId>) -> Option<CandidateId> {
        std::mem::replace(&mut self.active, id)
    }

    pub fn last_good(&self) -> Option<CandidateId> {
        self.last_good.filter(|id| self.candidates.contains_key(id))
    }

    pub fn set_last_good(&mut self, id: CandidateId) {
        if self.candidates.contains_key(&id) {
            self.last_good = Some(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedSurface;

    #[test]
    fn one_candidate_per_surface_key() {
        let mut registry = CandidateRegistry::new();
        let surface = Arc::new(SimulatedSurface::new("video-a"));
        let (first, added) = registry.insert(surface.clone(), 0);
        assert!(added);
        let (second, added_again) = registry.insert(surface, 10);
        assert!(!added_again);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_clears_pointers() {
        let mut registry = CandidateRegistry::new();
        let (a, _) = registry.insert(Arc::new(SimulatedSurface::new("a")), 0);
        let (b, _) = registry.insert(Arc::new(SimulatedSurface::new("b")), 0);
        registry.set_active(Some(a));
        registry.set_last_good(a);
        assert!(registry.remove(a).is_some());
        assert_eq!(registry.active(), None);
        assert_eq!(registry.last_good(), None);
        assert_eq!(registry.ids(), vec![b]);
        assert!(registry.remove(a).is_none());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut registry = CandidateRegistry::new();
        let (a, _) = registry.insert(Arc::new(SimulatedSurface::new("a")), 0);
        registry.remove(a);
        let (b, _) = registry.insert(Arc::new(SimulatedSurface::new("a")), 0);
        assert_ne!(a, b);
        assert_eq!(b.to_string(), "candidate-2");
    }
}
