//! Buffer gap finder.
//!
//! Pure analysis of buffered ranges: given the playhead, find where playback can
//! safely resume. A nudge stays inside the contiguous range under the playhead;
//! a gap point jumps to the next range that can actually play. Nothing here
//! touches a surface, so it is cheap enough to run on every poll.
use serde::Serialize;

use crate::config::GapConfig;
use crate::surface::TimeRange;

/// Positions closer than this to a range edge count as inside the range.
const EDGE_TOLERANCE_S: f64 = 0.001;

/// Target interval to seek into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealPoint {
    /// Seek target.
    pub start: f64,
    /// End of the buffered data the target lands in.
    pub end: f64,
    /// True for a small forward step inside contiguous buffer.
    pub is_nudge: bool,
    /// Distance skipped from the playhead to the target range; zero for nudges.
    pub gap_size: f64,
    /// Index of the buffered range the target lands in.
    pub range_index: usize,
}

impl HealPoint {
    /// Buffered seconds available after the seek target.
    pub fn headroom(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Signature used to detect repeated seeks to the same place.
    pub fn key(&self) -> HealPointKey {
        HealPointKey {
            start_ds: (self.start * 10.0).round() as i64,
            end_ds: (self.end * 10.0).round() as i64,
        }
    }
}

/// Heal point signature quantized to tenths of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HealPointKey {
    start_ds: i64,
    end_ds: i64,
}

/// Floors the finder applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadroomMode {
    /// Normal floor (`gap.min_headroom_s`).
    #[default]
    Strict,
    /// Relaxed floor for real gaps or exhausted buffers (`gap.relaxed_headroom_s`).
    Relaxed,
}

impl HeadroomMode {
    fn floor(self, config: &GapConfig) -> f64 {
        match self {
            HeadroomMode::Strict => config.min_headroom_s,
            HeadroomMode::Relaxed => config.relaxed_headroom_s,
        }
    }
}

/// Returns the best heal point for `position`, or `None` when no range offers
/// enough headroom.
pub fn find_heal_point(
    ranges: &[TimeRange],
    position: f64,
    config: &GapConfig,
    mode: HeadroomMode,
) -> Option<HealPoint> {
    let floor = mode.floor(config);
    let containing = containing_range(ranges, position);

    if let Some(index) = containing {
        let range = ranges[index];
        let ahead = range.end - position;
        if ahead > floor {
            let offset = config.nudge_offset_s.min(ahead / 2.0);
            return Some(HealPoint {
                start: position + offset,
                end: range.end,
                is_nudge: true,
                gap_size: 0.0,
                range_index: index,
            });
        }
    }

    let scan_from = containing.map(|index| index + 1).unwrap_or(0);
    ranges
        .iter()
        .enumerate()
        .skip(scan_from)
        .filter(|(_, range)| range.start > position + EDGE_TOLERANCE_S)
        .find_map(|(index, range)| {
            let start = (range.start + config.gap_landing_offset_s).min(range.end);
            if range.end - start < floor {
                return None;
            }
            Some(HealPoint {
                start,
                end: range.end,
                is_nudge: false,
                gap_size: range.start - position,
                range_index: index,
            })
        })
}

/// Index of the range holding `position`, tolerant of edge rounding.
pub fn containing_range(ranges: &[TimeRange], position: f64) -> Option<usize> {
    ranges.iter().position(|range| {
        position >= range.start - EDGE_TOLERANCE_S && position <= range.end + EDGE_TOLERANCE_S
    })
}

/// Contiguous seconds buffered ahead of `position`.
pub fn buffer_ahead(ranges: &[TimeRange], position: f64) -> f64 {
    containing_range(ranges, position)
        .map(|index| (ranges[index].end - position).max(0.0))
        .unwrap_or(0.0)
}

/// Furthest buffered position, used as the live edge estimate.
pub fn live_edge(ranges: &[TimeRange]) -> Option<f64> {
    ranges.iter().map(|range| range.end).reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(spans: &[(f64, f64)]) -> Vec<TimeRange> {
        spans.iter().map(|&(s, e)| TimeRange::new(s, e)).collect()
    }

    #[test]
    fn nudge_inside_contiguous_buffer() {
        let config = GapConfig::default();
        let point = find_heal_point(
            &ranges(&[(0.0, 10.0), (20.0, 30.0)]),
            5.0,
            &config,
            HeadroomMode::Strict,
        )
        .unwrap();
        assert!(point.is_nudge);
        assert_eq!(point.start, 5.5);
        assert_eq!(point.end, 10.0);
        assert_eq!(point.range_index, 0);
        assert_eq!(point.gap_size, 0.0);
    }

    #[test]
    fn no_point_at_buffer_tail() {
        let config = GapConfig::default();
        let buffered = ranges(&[(0.0, 10.0)]);
        assert!(find_heal_point(&buffered, 9.9, &config, HeadroomMode::Strict).is_none());
        assert!(find_heal_point(&buffered, 9.9, &config, HeadroomMode::Relaxed).is_none());
    }

    #[test]
    fn jumps_real_gap() {
        let config = GapConfig::default();
        let point = find_heal_point(
            &ranges(&[(0.0, 10.0), (12.0, 30.0)]),
            9.9,
            &config,
            HeadroomMode::Strict,
        )
        .unwrap();
        assert!(!point.is_nudge);
        assert!((point.start - 12.1).abs() < 1e-9);
        assert_eq!(point.end, 30.0);
        assert!((point.gap_size - 2.1).abs() < 1e-9);
        assert_eq!(point.range_index, 1);
    }

    #[test]
    fn skips_thin_ranges_unless_relaxed() {
        let config = GapConfig::default();
        let buffered = ranges(&[(0.0, 10.0), (11.0, 11.6), (15.0, 15.4)]);
        assert!(find_heal_point(&buffered, 9.95, &config, HeadroomMode::Strict).is_none());
        let relaxed = find_heal_point(&buffered, 9.95, &config, HeadroomMode::Relaxed).unwrap();
        assert_eq!(relaxed.range_index, 1);
    }

    #[test]
    fn playhead_before_first_range() {
        let config = GapConfig::default();
        let point =
            find_heal_point(&ranges(&[(3.0, 9.0)]), 0.0, &config, HeadroomMode::Strict).unwrap();
        assert!(!point.is_nudge);
        assert_eq!(point.range_index, 0);
        assert!((point.gap_size - 3.0).abs() < 1e-9);
    }

    #[test]
    fn playhead_past_all_ranges() {
        let config = GapConfig::default();
        assert!(
            find_heal_point(&ranges(&[(0.0, 4.0)]), 6.0, &config, HeadroomMode::Relaxed).is_none()
        );
        assert!(find_heal_point(&[], 1.0, &config, HeadroomMode::Relaxed).is_none());
    }

    #[test]
    fn relaxed_nudge_stays_inside_range() {
        let config = GapConfig::default();
        let point =
            find_heal_point(&ranges(&[(0.0, 10.0)]), 9.6, &config, HeadroomMode::Relaxed).unwrap();
        assert!(point.is_nudge);
        assert!(point.start < point.end);
        assert!((point.start - 9.8).abs() < 1e-9);
    }

    #[test]
    fn heal_point_key_quantizes() {
        let a = HealPoint {
            start: 5.51,
            end: 10.02,
            is_nudge: true,
            gap_size: 0.0,
            range_index: 0,
        };
        let b = HealPoint {
            start: 5.49,
            end: 9.98,
            ..a
        };
        assert_eq!(a.key(), b.key());
        let c = HealPoint { end: 12.0, ..a };
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn buffer_ahead_and_live_edge() {
        let buffered = ranges(&[(0.0, 10.0), (20.0, 30.0)]);
        assert_eq!(buffer_ahead(&buffered, 4.0), 6.0);
        assert_eq!(buffer_ahead(&buffered, 15.0), 0.0);
        assert_eq!(live_edge(&buffered), Some(30.0));
        assert_eq!(live_edge(&[]), None);
    }
}
