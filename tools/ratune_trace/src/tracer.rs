// SPDX-License-Identifier: GPL-2.0
//
// ratune_trace: block I/O event capture via tracefs.
//
// Reads the block_rq_issue tracepoint from the kernel's trace_pipe and
// feeds matching events into the collector channel. This is the same
// tracepoint the project's original eBPF program attached to; going
// through tracefs keeps the capture path free of a BPF toolchain while
// the EventSource trait leaves room for one later.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{Sender, TrySendError};
use log::{debug, info, warn};

use ratune_core::event::{Direction, RawEvent};

const SECTOR_SIZE: u64 = 512;

/// tracefs mount points, preferred order.
const TRACEFS_ROOTS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

fn tracefs_root() -> Result<&'static Path> {
    TRACEFS_ROOTS
        .iter()
        .map(Path::new)
        .find(|p| p.join("trace_pipe").exists())
        .context("tracefs not mounted (need /sys/kernel/tracing)")
}

/// Resolve a block device name to the "major,minor" string the
/// tracepoint prints, e.g. nvme0n1 -> "259,0".
fn device_id(device: &str) -> Result<String> {
    let path = format!("/sys/block/{device}/dev");
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("unknown block device {device} ({path})"))?;
    Ok(raw.trim().replace(':', ","))
}

/// Enables the block_rq_issue trace event for the lifetime of the
/// collector and restores it on drop.
struct TraceEventGuard {
    enable_path: PathBuf,
}

impl TraceEventGuard {
    fn enable(root: &Path) -> Result<Self> {
        let enable_path = root.join("events/block/block_rq_issue/enable");
        fs::write(&enable_path, "1")
            .with_context(|| format!("enabling {}", enable_path.display()))?;
        Ok(Self { enable_path })
    }
}

impl Drop for TraceEventGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::write(&self.enable_path, "0") {
            warn!("failed to disable block_rq_issue tracing: {e}");
        }
    }
}

/// Parse one trace_pipe line into an event, filtering on the device id.
///
/// Expected shape after the tracepoint name:
///   `259,0 R 4096 () 7864320 + 8 [fio]`
/// i.e. dev rwbs bytes (cmd) sector + nr_sectors [comm].
fn parse_line(line: &str, dev_id: &str) -> Option<RawEvent> {
    let (head, rest) = line.split_once("block_rq_issue: ")?;

    let mut fields = rest.split_whitespace();
    if fields.next()? != dev_id {
        return None;
    }

    let rwbs = fields.next()?;
    // Flush/discard/sync-only requests carry no position worth
    // aggregating; keep reads and writes of actual data.
    if !rwbs.contains('R') && !rwbs.contains('W') {
        return None;
    }
    let direction = if rwbs.contains('W') {
        Direction::Write
    } else {
        Direction::Read
    };

    let bytes: u64 = fields.next()?.parse().ok()?;

    // Skip the command field, which is "()" or "(...)" tokens.
    let mut tok = fields.next()?;
    while !tok.ends_with(')') {
        tok = fields.next()?;
    }

    let sector: u64 = fields.next()?.parse().ok()?;
    if fields.next()? != "+" {
        return None;
    }
    let nr_sectors: u64 = fields.next()?.parse().ok()?;

    let bytes = if bytes > 0 { bytes } else { nr_sectors * SECTOR_SIZE };

    // Event timestamp is the "  1234.567890:" column right before the
    // tracepoint name.
    let timestamp_ns = head
        .trim_end()
        .rsplit(' ')
        .next()
        .and_then(|t| t.strip_suffix(':'))
        .and_then(|t| t.parse::<f64>().ok())
        .map(|secs| (secs * 1e9) as u64)
        .unwrap_or(0);

    Some(RawEvent {
        position: sector * SECTOR_SIZE,
        bytes: bytes.min(u64::from(u32::MAX)) as u32,
        direction,
        timestamp_ns,
    })
}

/// Spawn the trace_pipe reader thread for `device`.
///
/// The thread exits when the shutdown flag rises or the receiving side
/// of the channel goes away. A blocking trace_pipe read only returns
/// when the kernel emits a line, so on a fully idle device the thread
/// can outlive shutdown until the next event; the process does not join
/// it on exit.
pub fn spawn(
    device: &str,
    tx: Sender<RawEvent>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let root = tracefs_root()?;
    let dev_id = device_id(device)?;
    let guard = TraceEventGuard::enable(root)?;

    let pipe = fs::File::open(root.join("trace_pipe"))
        .with_context(|| format!("opening {}/trace_pipe", root.display()))?;

    info!("tracing block_rq_issue for {device} ({dev_id})");

    let handle = std::thread::Builder::new()
        .name("block-tracer".into())
        .spawn(move || {
            let _guard = guard;
            let reader = BufReader::new(pipe);
            let mut dropped: u64 = 0;

            for line in reader.lines() {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("trace_pipe read failed: {e}");
                        break;
                    }
                };
                let Some(ev) = parse_line(&line, &dev_id) else {
                    continue;
                };
                match tx.try_send(ev) {
                    Ok(()) => {}
                    // Queue full: shed the event rather than stall the
                    // pipe; the aggregate features degrade gracefully.
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped % 10_000 == 1 {
                            warn!("event queue full, {dropped} events dropped so far");
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            debug!("block tracer exiting ({dropped} events dropped)");
        })?;

    Ok(handle)
}

pub fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("tracing block I/O requires root; rerun with sudo or use --synthetic");
    }
    Ok(())
}
