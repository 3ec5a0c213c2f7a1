// SPDX-License-Identifier: GPL-2.0
//
// ratune: raw block I/O events and the source abstraction.
//
// The collector never talks to a tracing subsystem directly. Whatever
// produces events (tracefs reader, synthetic generator, test replay)
// runs on its own thread and hands events over a bounded channel; the
// controller only sees the EventSource trait.

use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Transfer direction of one block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One block I/O request as reported by the event source.
///
/// `position` is in bytes, not sectors; sources reporting sectors
/// convert at the boundary so every consumer shares one unit.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub position: u64,
    pub bytes: u32,
    pub direction: Direction,
    pub timestamp_ns: u64,
}

/// Blocking event supplier with a bounded wait.
///
/// `next_event` returns `Ok(None)` when the timeout elapses without an
/// event, which is how the collector keeps its shutdown polling prompt
/// during quiet windows.
pub trait EventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>>;
}

/// Capacity of the producer→controller channel. Sized for the burst a
/// fast NVMe device can issue inside one 100ms poll slice; producers
/// drop (and count) events beyond it rather than block.
pub const EVENT_QUEUE_DEPTH: usize = 65_536;

/// Create the channel pair connecting a producer thread to a
/// [`ChannelSource`].
pub fn event_channel() -> (Sender<RawEvent>, ChannelSource) {
    let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
    (tx, ChannelSource { rx })
}

/// EventSource backed by a crossbeam channel.
pub struct ChannelSource {
    rx: Receiver<RawEvent>,
}

impl EventSource for ChannelSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            // The producer thread is gone; the collector cannot make
            // progress without it.
            Err(RecvTimeoutError::Disconnected) => bail!("event producer disconnected"),
        }
    }
}
