// SPDX-License-Identifier: GPL-2.0
//
// ratune_trace: synthetic workload generator.
//
// Drives the full collect/predict/actuate loop without root or a live
// tracing subsystem, producing the same event stream shapes the
// classifier was trained to separate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, TrySendError};
use log::debug;
use rand::Rng;

use ratune_core::event::{Direction, RawEvent};

/// Synthetic span to scatter random I/O across (1 TiB).
const SPAN_BYTES: u64 = 1 << 40;

const BLOCK: u64 = 4096;

/// Events are emitted in small batches on a short tick so shutdown
/// stays prompt and the channel sees a steady stream, not one burst.
const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Pattern {
    /// Strictly increasing adjacent positions.
    Seq,
    /// Uniformly scattered positions, virtually every stride a jump.
    Random,
    /// Alternating runs of sequential and scattered access.
    Mixed,
}

struct Generator {
    pattern: Pattern,
    cursor: u64,
}

impl Generator {
    fn next_event(&mut self, rng: &mut impl Rng, now_ns: u64) -> RawEvent {
        let position = match self.pattern {
            Pattern::Seq => {
                self.cursor += BLOCK;
                self.cursor
            }
            Pattern::Random => rng.gen_range(0..SPAN_BYTES / BLOCK) * BLOCK,
            Pattern::Mixed => {
                if rng.gen_bool(0.5) {
                    self.cursor += BLOCK;
                } else {
                    self.cursor = rng.gen_range(0..SPAN_BYTES / BLOCK) * BLOCK;
                }
                self.cursor
            }
        };

        RawEvent {
            position,
            bytes: BLOCK as u32,
            direction: if rng.gen_bool(0.7) {
                Direction::Read
            } else {
                Direction::Write
            },
            timestamp_ns: now_ns,
        }
    }
}

/// Spawn a generator emitting roughly `rate` events per second.
pub fn spawn(
    pattern: Pattern,
    rate: u64,
    tx: Sender<RawEvent>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("synth-workload".into())
        .spawn(move || {
            let mut rng = rand::thread_rng();
            let mut gen = Generator {
                pattern,
                cursor: 0,
            };
            let start = Instant::now();
            let per_tick = ((rate as f64) * TICK.as_secs_f64()).max(1.0) as u64;
            let mut dropped: u64 = 0;

            'ticks: loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let now_ns = start.elapsed().as_nanos() as u64;
                for _ in 0..per_tick {
                    // Shed on a full queue like the live tracer does;
                    // the generator must never block behind a slow
                    // consumer.
                    match tx.try_send(gen.next_event(&mut rng, now_ns)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => dropped += 1,
                        Err(TrySendError::Disconnected(_)) => {
                            debug!("synthetic generator: collector gone, exiting");
                            break 'ticks;
                        }
                    }
                }
                std::thread::sleep(TICK);
            }

            if dropped > 0 {
                debug!("synthetic generator: dropped {dropped} events on a full queue");
            }
        })
        .expect("spawning synth-workload thread")
}
