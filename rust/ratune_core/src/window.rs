// SPDX-License-Identifier: GPL-2.0
//
// ratune: per-window aggregation of block I/O events.

use crate::event::RawEvent;
use crate::DEFAULT_JUMP_THRESHOLD_BYTES;

/// Running aggregates for one observation window.
///
/// Every counter is updated in O(1) per event; the position history is
/// folded into `distance_sum` as it arrives instead of being buffered,
/// so memory stays flat no matter how hot the device is. `reset()` runs
/// exactly once at each window boundary.
#[derive(Debug, Clone)]
pub struct WindowStats {
    pub total_bytes: u64,
    pub request_count: u64,
    pub large_jump_count: u64,
    /// Sum of |Δposition| over consecutive requests, in bytes.
    pub distance_sum: u64,
    pub last_position: Option<u64>,
    jump_threshold: u64,
}

impl WindowStats {
    pub fn new(jump_threshold: u64) -> Self {
        Self {
            total_bytes: 0,
            request_count: 0,
            large_jump_count: 0,
            distance_sum: 0,
            last_position: None,
            jump_threshold,
        }
    }

    /// Fold one event into the window.
    pub fn ingest(&mut self, ev: &RawEvent) {
        self.request_count += 1;
        self.total_bytes += u64::from(ev.bytes);

        if let Some(last) = self.last_position {
            let distance = ev.position.abs_diff(last);
            self.distance_sum += distance;
            if distance > self.jump_threshold {
                self.large_jump_count += 1;
            }
        }
        self.last_position = Some(ev.position);
    }

    /// Clear all counters for the next window. The jump threshold is
    /// configuration, not window state, and survives.
    pub fn reset(&mut self) {
        self.total_bytes = 0;
        self.request_count = 0;
        self.large_jump_count = 0;
        self.distance_sum = 0;
        self.last_position = None;
    }
}

impl Default for WindowStats {
    fn default() -> Self {
        Self::new(DEFAULT_JUMP_THRESHOLD_BYTES)
    }
}
