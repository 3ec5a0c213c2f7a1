// SPDX-License-Identifier: GPL-2.0
//
// ratune_trace: the per-window control cycle.
//
// Collect events for one window, derive features, ask the predictor,
// write the readahead decision. Collection and prediction are strictly
// sequential inside a window, so the aggregator needs no locking; any
// predictor or sysfs failure is confined to the window it happened in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{info, warn};

use ratune_core::event::EventSource;
use ratune_core::{FeatureVec, PredictorClient, WindowStats};

use crate::actuator::ReadaheadActuator;

/// Upper bound on any single blocking wait inside the loop, so a
/// shutdown request is honored within this interval.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct Controller<S: EventSource> {
    source: S,
    stats: WindowStats,
    window: Duration,
    client: PredictorClient,
    actuator: ReadaheadActuator,
    windows: u64,
    skipped: u64,
}

impl<S: EventSource> Controller<S> {
    pub fn new(
        source: S,
        jump_threshold: u64,
        window: Duration,
        client: PredictorClient,
        actuator: ReadaheadActuator,
    ) -> Self {
        Self {
            source,
            stats: WindowStats::new(jump_threshold),
            window,
            client,
            actuator,
            windows: 0,
            skipped: 0,
        }
    }

    /// Run window cycles until shutdown.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(
            "control loop started: window={}ms predictor={}",
            self.window.as_millis(),
            self.client.socket_path().display()
        );

        while !shutdown.load(Ordering::Relaxed) {
            self.run_window(shutdown)?;
        }

        info!(
            "control loop stopped: {} windows, {} skipped",
            self.windows, self.skipped
        );
        Ok(())
    }

    /// One full collect→extract→predict→actuate cycle. Errors returned
    /// from here are unrecoverable (the event source died); everything
    /// window-scoped is logged and absorbed.
    fn run_window(&mut self, shutdown: &AtomicBool) -> Result<()> {
        self.stats.reset();
        let deadline = Instant::now() + self.window;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let timeout = SHUTDOWN_POLL.min(deadline - now);
            if let Some(ev) = self.source.next_event(timeout)? {
                self.stats.ingest(&ev);
            }
        }

        self.windows += 1;
        let features = FeatureVec::from_window(&self.stats, self.window);

        let class = match self.client.predict(&features.as_array()) {
            Ok(class) => class,
            Err(e) => {
                // No retry inside the window: readahead stays at its
                // last applied value and the loop moves on.
                self.skipped += 1;
                warn!("window {}: prediction unavailable, skipping: {e:#}", self.windows);
                return Ok(());
            }
        };

        match self.actuator.apply(class) {
            Ok(kb) => info!(
                "window {}: [{}] pred={} read_ahead_kb={}",
                self.windows, features, class, kb
            ),
            Err(e) => warn!("window {}: actuation failed: {e:#}", self.windows),
        }

        Ok(())
    }

    #[cfg(test)]
    fn cycle_once(&mut self, shutdown: &AtomicBool) -> Result<()> {
        self.run_window(shutdown)
    }
}
