// SPDX-License-Identifier: GPL-2.0
//
// ratune_predictor: inference daemon for adaptive readahead tuning.
//
// Loads a pretrained access-pattern classifier plus its normalization
// constants, then serves one-shot predictions over a Unix socket for
// the lifetime of the process. The collector (ratune_trace) is the only
// intended client, but the protocol is open to anything that can write
// 20 bytes.

mod service;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use ratune_core::model::{MlpClassifier, NormParams};
use ratune_core::DEFAULT_SOCK_PATH;

use crate::service::PredictorService;

#[derive(Debug, Parser)]
#[command(
    name = "ratune_predictor",
    version,
    about = "Serves I/O access-pattern predictions from a pretrained model over a Unix socket."
)]
struct Opts {
    /// Path to the model artifact (JSON, fixed 5-32-16-3 topology).
    #[clap(short = 'm', long)]
    model: PathBuf,

    /// Path to the normalization-parameter artifact (JSON, 5 means and
    /// 5 standard deviations).
    #[clap(short = 'p', long)]
    params: PathBuf,

    /// Unix socket path to listen on.
    #[clap(short = 's', long, default_value = DEFAULT_SOCK_PATH)]
    sock: PathBuf,

    /// Enable verbose (per-request) logging.
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

    // Both artifacts load before the socket binds: a daemon with a bad
    // model must exit non-zero, not accept and fail per-request.
    let classifier = MlpClassifier::load(&opts.model)
        .with_context(|| format!("loading model {}", opts.model.display()))?;
    let params = NormParams::load(&opts.params)
        .with_context(|| format!("loading normalization params {}", opts.params.display()))?;
    info!("model loaded from {}", opts.model.display());

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut service = PredictorService::bind(&opts.sock, Box::new(classifier), params)?;
    service.serve(&shutdown)?;

    info!("total predictions served: {}", service.predictions());
    Ok(())
}
