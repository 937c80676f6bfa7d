//! Scriptable in-memory playback surface.
//!
//! The playhead advances with tokio time while unpaused and stops at the end
//! of the contiguous buffered data it sits in, which is exactly how a real
//! player stalls on an empty buffer. Readiness is derived from the buffer
//! unless overridden. `play()`/`load()` failures can be queued in advance.
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::surface::{NetworkState, PlaybackSurface, ReadyState, SurfaceError, TimeRange};

const EDGE_TOLERANCE_S: f64 = 0.001;

#[derive(Debug)]
struct SimState {
    anchor_position: f64,
    anchor_at: Instant,
    paused: bool,
    ended: bool,
    rate: f64,
    buffered: Vec<TimeRange>,
    src: String,
    attached: bool,
    error: Option<String>,
    ready_override: Option<ReadyState>,
    play_failures: VecDeque<SurfaceError>,
    load_failures: VecDeque<SurfaceError>,
    play_calls: u32,
    load_calls: u32,
}

impl SimState {
    fn position(&self) -> f64 {
        if self.paused || self.ended || !self.attached {
            return self.anchor_position;
        }
        let Some(end) = contiguous_end(&self.buffered, self.anchor_position) else {
            return self.anchor_position;
        };
        let elapsed = Instant::now()
            .saturating_duration_since(self.anchor_at)
            .as_secs_f64();
        (self.anchor_position + elapsed * self.rate)
            .min(end)
            .max(self.anchor_position)
    }

    /// Freezes the current position as the new anchor.
    fn reanchor(&mut self) {
        self.anchor_position = self.position();
        self.anchor_at = Instant::now();
    }
}

/// End of the contiguous buffered span holding `position`.
fn contiguous_end(ranges: &[TimeRange], position: f64) -> Option<f64> {
    let mut end: Option<f64> = None;
    for range in ranges {
        let reach = end.unwrap_or(position);
        if range.start <= reach + EDGE_TOLERANCE_S && range.end >= reach - EDGE_TOLERANCE_S {
            end = Some(range.end.max(reach));
        }
    }
    end
}

#[derive(Debug)]
pub struct SimulatedSurface {
    key: String,
    state: Mutex<SimState>,
}

impl SimulatedSurface {
    /// Paused surface with a source but no buffered data.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let src = format!("https://sim.example/{key}.m3u8");
        Self {
            key,
            state: Mutex::new(SimState {
                anchor_position: 0.0,
                anchor_at: Instant::now(),
                paused: true,
                ended: false,
                rate: 1.0,
                buffered: Vec::new(),
                src,
                attached: true,
                error: None,
                ready_override: None,
                play_failures: VecDeque::new(),
                load_failures: VecDeque::new(),
                play_calls: 0,
                load_calls: 0,
            }),
        }
    }

    /// Unpaused surface at `position` with data buffered from 0 to `buffered_end`.
    pub fn playing(key: impl Into<String>, position: f64, buffered_end: f64) -> Self {
        let surface = Self::new(key);
        surface.set_buffered(vec![TimeRange::new(0.0, buffered_end)]);
        surface.place_playhead(position);
        surface.set_paused(false);
        surface
    }

    pub fn set_buffered(&self, ranges: Vec<TimeRange>) {
        let mut state = self.state.lock();
        state.reanchor();
        state.buffered = ranges;
    }

    /// Moves the end of the last buffered range to `end` (live feed growth).
    pub fn extend_buffer(&self, end: f64) {
        let mut state = self.state.lock();
        state.reanchor();
        match state.buffered.last_mut() {
            Some(last) if last.end < end => last.end = end,
            Some(_) => {}
            None => state.buffered.push(TimeRange::new(0.0, end)),
        }
    }

    /// Places the playhead without the side effects of a player seek.
    pub fn place_playhead(&self, position: f64) {
        let mut state = self.state.lock();
        state.anchor_position = position;
        state.anchor_at = Instant::now();
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.reanchor();
        state.paused = paused;
    }

    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        state.reanchor();
        state.rate = rate;
    }

    pub fn set_ended(&self, ended: bool) {
        let mut state = self.state.lock();
        state.reanchor();
        state.ended = ended;
    }

    pub fn set_src(&self, src: impl Into<String>) {
        self.state.lock().src = src.into();
    }

    pub fn set_attached(&self, attached: bool) {
        let mut state = self.state.lock();
        state.reanchor();
        state.attached = attached;
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.lock().error = error;
    }

    /// Pins the reported ready state instead of deriving it from the buffer.
    pub fn set_ready_state(&self, ready: Option<ReadyState>) {
        self.state.lock().ready_override = ready;
    }

    pub fn fail_next_play(&self, error: SurfaceError) {
        self.state.lock().play_failures.push_back(error);
    }

    pub fn fail_next_load(&self, error: SurfaceError) {
        self.state.lock().load_failures.push_back(error);
    }

    pub fn play_calls(&self) -> u32 {
        self.state.lock().play_calls
    }

    pub fn load_calls(&self) -> u32 {
        self.state.lock().load_calls
    }
}

#[async_trait]
impl PlaybackSurface for SimulatedSurface {
    fn key(&self) -> &str {
        &self.key
    }

    fn current_time(&self) -> f64 {
        self.state.lock().position()
    }

    fn set_current_time(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.anchor_position = seconds;
        state.anchor_at = Instant::now();
        state.ended = false;
    }

    fn paused(&self) -> bool {
        self.state.lock().paused
    }

    fn ended(&self) -> bool {
        self.state.lock().ended
    }

    fn ready_state(&self) -> ReadyState {
        let state = self.state.lock();
        if let Some(ready) = state.ready_override {
            return ready;
        }
        if state.src.is_empty() {
            return ReadyState::HaveNothing;
        }
        let position = state.position();
        match contiguous_end(&state.buffered, position) {
            Some(end) if end - position >= 2.0 => ReadyState::HaveEnoughData,
            Some(end) if end - position > 0.1 => ReadyState::HaveFutureData,
            Some(_) => ReadyState::HaveCurrentData,
            None => ReadyState::HaveMetadata,
        }
    }

    fn network_state(&self) -> NetworkState {
        let state = self.state.lock();
        if state.src.is_empty() {
            NetworkState::Empty
        } else {
            NetworkState::Loading
        }
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.state.lock().buffered.clone()
    }

    fn current_src(&self) -> String {
        self.state.lock().src.clone()
    }

    fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    async fn play(&self) -> Result<(), SurfaceError> {
        let mut state = self.state.lock();
        state.play_calls += 1;
        if !state.attached {
            return Err(SurfaceError::Detached);
        }
        if let Some(error) = state.play_failures.pop_front() {
            return Err(error);
        }
        state.reanchor();
        state.paused = false;
        Ok(())
    }

    async fn load(&self) -> Result<(), SurfaceError> {
        let mut state = self.state.lock();
        state.load_calls += 1;
        if !state.attached {
            return Err(SurfaceError::Detached);
        }
        if let Some(error) = state.load_failures.pop_front() {
            return Err(error);
        }
        state.error = None;
        state.ended = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn playhead_advances_and_stalls_at_buffer_end() {
        let surface = SimulatedSurface::playing("a", 0.0, 3.0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!((surface.current_time() - 2.0).abs() < 1e-6);
        assert_eq!(surface.ready_state(), ReadyState::HaveFutureData);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((surface.current_time() - 3.0).abs() < 1e-6);
        assert_eq!(surface.ready_state(), ReadyState::HaveCurrentData);

        surface.extend_buffer(10.0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((surface.current_time() - 4.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_surface_holds_position() {
        let surface = SimulatedSurface::playing("a", 1.0, 30.0);
        surface.set_paused(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!((surface.current_time() - 1.0).abs() < 1e-6);
        surface.play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!((surface.current_time() - 4.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_failures_are_consumed_in_order() {
        let surface = SimulatedSurface::new("a");
        surface.fail_next_play(SurfaceError::Aborted("first".into()));
        assert_eq!(
            surface.play().await,
            Err(SurfaceError::Aborted("first".into()))
        );
        assert!(surface.paused());
        assert_eq!(surface.play().await, Ok(()));
        assert_eq!(surface.play_calls(), 2);

        surface.set_attached(false);
        assert_eq!(surface.play().await, Err(SurfaceError::Detached));
    }

    #[test]
    fn readiness_follows_source_and_buffer() {
        let surface = SimulatedSurface::new("a");
        assert_eq!(surface.ready_state(), ReadyState::HaveMetadata);
        surface.set_src("");
        assert_eq!(surface.ready_state(), ReadyState::HaveNothing);
        assert_eq!(surface.network_state(), NetworkState::Empty);
        surface.set_ready_state(Some(ReadyState::HaveEnoughData));
        assert_eq!(surface.ready_state(), ReadyState::HaveEnoughData);
    }

    #[test]
    fn adjacent_ranges_are_contiguous() {
        let ranges = vec![TimeRange::new(0.0, 5.0), TimeRange::new(5.0, 9.0)];
        assert_eq!(contiguous_end(&ranges, 2.0), Some(9.0));
        let gapped = vec![TimeRange::new(0.0, 5.0), TimeRange::new(6.0, 9.0)];
        assert_eq!(contiguous_end(&gapped, 2.0), Some(5.0));
        assert_eq!(contiguous_end(&gapped, 5.5), None);
    }
}
