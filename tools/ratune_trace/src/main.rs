// SPDX-License-Identifier: GPL-2.0
//
// ratune_trace: block I/O collector and readahead control loop.
//
// Observes block_rq_issue events for one device, aggregates them over
// fixed windows, asks the ratune_predictor daemon which access pattern
// dominates, and writes the matching read_ahead_kb value to sysfs.
// Runs until interrupted; a missing or restarting predictor only costs
// the affected windows.

mod actuator;
mod controller;
mod synth;
mod tracer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use ratune_core::event::event_channel;
use ratune_core::{
    PredictorClient, DEFAULT_JUMP_THRESHOLD_BYTES, DEFAULT_SOCK_PATH, DEFAULT_WINDOW_MS,
};

use crate::actuator::ReadaheadActuator;
use crate::controller::Controller;
use crate::synth::Pattern;

#[derive(Debug, Parser)]
#[command(
    name = "ratune_trace",
    version,
    about = "Adapts a block device's readahead to the observed I/O pattern."
)]
struct Opts {
    /// Block device to observe and tune.
    #[clap(short = 'd', long, default_value = "nvme0n1")]
    device: String,

    /// Aggregation window in milliseconds.
    #[clap(short = 'w', long, default_value_t = DEFAULT_WINDOW_MS)]
    window_ms: u64,

    /// Unix socket path of the predictor daemon.
    #[clap(short = 's', long, default_value = DEFAULT_SOCK_PATH)]
    sock: PathBuf,

    /// Consecutive-position distance (bytes) counting as a large jump.
    #[clap(long, default_value_t = DEFAULT_JUMP_THRESHOLD_BYTES)]
    jump_threshold: u64,

    /// Predictor request timeout in milliseconds.
    #[clap(long, default_value = "1000")]
    predict_timeout_ms: u64,

    /// Replace the live tracer with a synthetic workload generator.
    /// Useful for exercising the loop without root.
    #[clap(long, value_enum)]
    synthetic: Option<Pattern>,

    /// Event rate of the synthetic generator, events per second.
    #[clap(long, default_value = "2000")]
    synth_rate: u64,

    /// Override the readahead control file (default:
    /// /sys/block/<device>/queue/read_ahead_kb).
    #[clap(long)]
    readahead_path: Option<PathBuf>,

    /// Enable verbose logging.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let (tx, source) = event_channel();
    match opts.synthetic {
        Some(pattern) => {
            info!("synthetic {pattern:?} workload at {} events/s", opts.synth_rate);
            let _ = synth::spawn(pattern, opts.synth_rate, tx, shutdown.clone());
        }
        None => {
            tracer::require_root()?;
            // The tracer thread is not joined on exit: a quiet device
            // can keep it blocked in trace_pipe past shutdown.
            let _ = tracer::spawn(&opts.device, tx, shutdown.clone())?;
        }
    }

    let actuator = match &opts.readahead_path {
        Some(path) => ReadaheadActuator::with_path(path),
        None => ReadaheadActuator::for_device(&opts.device),
    };
    info!("actuating {}", actuator.path().display());

    let client = PredictorClient::new(&opts.sock, Duration::from_millis(opts.predict_timeout_ms));

    let mut ctrl = Controller::new(
        source,
        opts.jump_threshold,
        Duration::from_millis(opts.window_ms),
        client,
        actuator,
    );
    ctrl.run(&shutdown)
}
