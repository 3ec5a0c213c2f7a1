// SPDX-License-Identifier: GPL-2.0
//
// ratune: window statistics to model features.

use std::fmt;
use std::time::Duration;

use crate::window::WindowStats;
use crate::NUM_FEATURES;

/// Below this request rate the average I/O size is reported as zero
/// instead of dividing bandwidth by a vanishing denominator.
const MIN_IOPS: f32 = 1e-3;

/// The fixed 5-feature summary of one window, in the order the model
/// was trained on. The field order here, the wire order in `proto` and
/// the normalization artifact are all index-aligned; never reorder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVec {
    /// Mean |Δposition| between consecutive requests, bytes.
    pub avg_distance_bytes: f32,
    /// Fraction of requests that landed beyond the jump threshold.
    pub jump_ratio: f32,
    /// Bandwidth divided by request rate, bytes. Derived rather than
    /// averaged from raw sizes so it matches the scaler calibration.
    pub avg_io_size_bytes: f32,
    /// 1 - jump_ratio, clamped to [0, 1].
    pub seq_ratio: f32,
    /// Requests per second over the window.
    pub iops: f32,
}

impl FeatureVec {
    pub const ZERO: FeatureVec = FeatureVec {
        avg_distance_bytes: 0.0,
        jump_ratio: 0.0,
        avg_io_size_bytes: 0.0,
        seq_ratio: 0.0,
        iops: 0.0,
    };

    /// Derive features from one completed window.
    ///
    /// An empty window is defined data, not an error: every feature is
    /// zero and the vector still flows through the normal pipeline.
    pub fn from_window(stats: &WindowStats, window: Duration) -> Self {
        if stats.request_count == 0 {
            return Self::ZERO;
        }

        let secs = window.as_secs_f32();
        let reqs = stats.request_count as f32;

        let avg_distance_bytes = if stats.request_count >= 2 {
            stats.distance_sum as f32 / (stats.request_count - 1) as f32
        } else {
            0.0
        };

        let jump_ratio = stats.large_jump_count as f32 / reqs;
        let seq_ratio = (1.0 - jump_ratio).clamp(0.0, 1.0);

        let iops = reqs / secs;
        let bandwidth = stats.total_bytes as f32 / secs;
        let avg_io_size_bytes = if iops > MIN_IOPS { bandwidth / iops } else { 0.0 };

        Self {
            avg_distance_bytes,
            jump_ratio,
            avg_io_size_bytes,
            seq_ratio,
            iops,
        }
    }

    /// Model/wire order: [distance, jump_ratio, io_size, seq_ratio, iops].
    pub fn as_array(&self) -> [f32; NUM_FEATURES] {
        [
            self.avg_distance_bytes,
            self.jump_ratio,
            self.avg_io_size_bytes,
            self.seq_ratio,
            self.iops,
        ]
    }

    pub fn from_array(a: [f32; NUM_FEATURES]) -> Self {
        Self {
            avg_distance_bytes: a[0],
            jump_ratio: a[1],
            avg_io_size_bytes: a[2],
            seq_ratio: a[3],
            iops: a[4],
        }
    }
}

impl fmt::Display for FeatureVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dist={:.0} jump={:.3} size={:.0} seq={:.3} iops={:.1}",
            self.avg_distance_bytes,
            self.jump_ratio,
            self.avg_io_size_bytes,
            self.seq_ratio,
            self.iops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, RawEvent};

    const WINDOW: Duration = Duration::from_millis(2500);

    fn ev(position: u64, bytes: u32) -> RawEvent {
        RawEvent {
            position,
            bytes,
            direction: Direction::Read,
            timestamp_ns: 0,
        }
    }

    #[test]
    fn empty_window_is_all_zero() {
        let stats = WindowStats::new(1_000_000);
        let fv = FeatureVec::from_window(&stats, WINDOW);
        assert_eq!(fv.as_array(), [0.0; 5]);
    }

    #[test]
    fn single_event_has_no_distance() {
        let mut stats = WindowStats::new(1_000_000);
        stats.ingest(&ev(123_456, 4096));
        let fv = FeatureVec::from_window(&stats, WINDOW);

        assert_eq!(fv.avg_distance_bytes, 0.0);
        assert_eq!(fv.jump_ratio, 0.0);
        assert_eq!(fv.seq_ratio, 1.0);
        assert!((fv.iops - 0.4).abs() < 1e-6);
        // bandwidth/iops collapses back to the single request size
        assert!((fv.avg_io_size_bytes - 4096.0).abs() < 1e-3);
    }

    #[test]
    fn sequential_workload_ratios() {
        let mut stats = WindowStats::new(1_000_000);
        for i in 0..100u64 {
            stats.ingest(&ev(i * 4096, 4096));
        }
        let fv = FeatureVec::from_window(&stats, WINDOW);

        assert_eq!(fv.jump_ratio, 0.0);
        assert_eq!(fv.seq_ratio, 1.0);
        assert!((fv.avg_distance_bytes - 4096.0).abs() < 1e-3);
        assert!((fv.iops - 40.0).abs() < 1e-3);
        assert!((fv.avg_io_size_bytes - 4096.0).abs() < 1e-3);
    }

    #[test]
    fn random_workload_ratios() {
        let mut stats = WindowStats::new(1_000_000);
        // Every stride is > 1MB, so all but the first request jump.
        for i in 0..50u64 {
            stats.ingest(&ev(i * 2_000_000, 4096));
        }
        let fv = FeatureVec::from_window(&stats, WINDOW);

        assert!((fv.jump_ratio - 49.0 / 50.0).abs() < 1e-6);
        assert!((fv.seq_ratio - 1.0 / 50.0).abs() < 1e-6);
        assert!((fv.avg_distance_bytes - 2_000_000.0).abs() < 1.0);
    }

    #[test]
    fn ratios_sum_to_one() {
        let mut stats = WindowStats::new(1_000_000);
        for i in 0..30u64 {
            // Alternate small and huge strides for a mixed window.
            let pos = if i % 2 == 0 { i * 4096 } else { i * 50_000_000 };
            stats.ingest(&ev(pos, 8192));
        }
        let fv = FeatureVec::from_window(&stats, WINDOW);
        assert!((fv.jump_ratio + fv.seq_ratio - 1.0).abs() < 1e-6);
        for v in fv.as_array() {
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn array_round_trip_preserves_order() {
        let fv = FeatureVec {
            avg_distance_bytes: 1.0,
            jump_ratio: 2.0,
            avg_io_size_bytes: 3.0,
            seq_ratio: 4.0,
            iops: 5.0,
        };
        assert_eq!(fv.as_array(), [1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(FeatureVec::from_array(fv.as_array()), fv);
    }
}
