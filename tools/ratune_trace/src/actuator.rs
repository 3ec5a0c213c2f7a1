// SPDX-License-Identifier: GPL-2.0
//
// ratune_trace: readahead actuation via sysfs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use ratune_core::model::IoClass;

/// Writes the class-mapped readahead depth to the kernel control file.
///
/// The kernel treats rewriting the current value as a no-op, so the
/// actuator skips the write when the decision hasn't changed. A failed
/// write is reported to the caller but leaves `last_kb` untouched; the
/// kernel keeps its previous value until a later window succeeds.
pub struct ReadaheadActuator {
    path: PathBuf,
    last_kb: Option<u32>,
}

impl ReadaheadActuator {
    /// Standard control file for a block device.
    pub fn for_device(device: &str) -> Self {
        Self::with_path(format!("/sys/block/{device}/queue/read_ahead_kb"))
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_kb: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply one window's decision. Returns the readahead value in KB.
    pub fn apply(&mut self, class: IoClass) -> Result<u32> {
        let kb = class.readahead_kb();
        if self.last_kb == Some(kb) {
            debug!("read_ahead_kb already {kb}, skipping write");
            return Ok(kb);
        }

        fs::write(&self.path, kb.to_string())
            .with_context(|| format!("writing {} to {}", kb, self.path.display()))?;
        self.last_kb = Some(kb);
        Ok(kb)
    }
}
