// SPDX-License-Identifier: GPL-2.0
//
// ratune: access-pattern classifier and feature normalization.
//
// The model is trained offline and shipped as a JSON artifact together
// with the scaler constants. At runtime both are loaded once, validated
// against the fixed topology, and never modified: inference is a plain
// read-only forward pass, so the daemon needs no locking around it.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{NUM_CLASSES, NUM_FEATURES};

/// Hidden layer widths of the fixed 5→32→16→3 topology.
const HIDDEN1: usize = 32;
const HIDDEN2: usize = 16;

/// Standard deviations below this are treated as degenerate and the
/// corresponding feature normalizes to zero instead of blowing up.
const MIN_STD: f32 = 1e-4;

/// Dominant access pattern over one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum IoClass {
    Sequential = 0,
    Random = 1,
    Mixed = 2,
}

impl IoClass {
    pub fn from_index(idx: i32) -> Option<Self> {
        match idx {
            0 => Some(IoClass::Sequential),
            1 => Some(IoClass::Random),
            2 => Some(IoClass::Mixed),
            _ => None,
        }
    }

    pub fn index(self) -> i32 {
        self as i32
    }

    /// Readahead depth the kernel should use for this pattern, in KB.
    /// These three values are the only ones the actuator ever writes.
    pub fn readahead_kb(self) -> u32 {
        match self {
            IoClass::Sequential => 256,
            IoClass::Random => 16,
            IoClass::Mixed => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IoClass::Sequential => "sequential",
            IoClass::Random => "random",
            IoClass::Mixed => "mixed",
        }
    }
}

impl fmt::Display for IoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classifier output: the winning class plus the raw score vector for
/// diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub class: IoClass,
    pub scores: [f32; NUM_CLASSES],
}

/// The one capability the controller needs from a model backend.
/// Keeps the concrete inference engine swappable without touching the
/// serving loop. `Send + Sync` because the daemon owns its backend
/// behind a `Box<dyn Classifier>` on a serving thread.
pub trait Classifier: Send + Sync {
    fn classify(&self, features: &[f32; NUM_FEATURES]) -> Result<Prediction>;
}

/// Per-feature affine scaler constants, index-aligned with
/// [`crate::FeatureVec`]. Loaded once at startup; a length mismatch is
/// a configuration error and fails the process before it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormParams {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl NormParams {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading normalization params {}", path.display()))?;
        let params: NormParams = serde_json::from_str(&content)
            .with_context(|| format!("parsing normalization params {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mean.len() != NUM_FEATURES || self.std.len() != NUM_FEATURES {
            bail!(
                "normalization params must carry {} means and stds, got {}/{}",
                NUM_FEATURES,
                self.mean.len(),
                self.std.len()
            );
        }
        Ok(())
    }

    pub fn normalize(&self, raw: &[f32; NUM_FEATURES]) -> [f32; NUM_FEATURES] {
        let mut out = [0.0f32; NUM_FEATURES];
        for i in 0..NUM_FEATURES {
            if self.std[i] >= MIN_STD {
                out[i] = (raw[i] - self.mean[i]) / self.std[i];
            }
        }
        out
    }
}

/// One dense layer as stored in the model artifact: row-major weights,
/// one row per output neuron.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl DenseLayer {
    fn check_shape(&self, name: &str, inputs: usize, outputs: usize) -> Result<()> {
        if self.weights.len() != outputs || self.bias.len() != outputs {
            bail!(
                "{name}: expected {outputs} output rows, got {} weights / {} bias",
                self.weights.len(),
                self.bias.len()
            );
        }
        for (i, row) in self.weights.iter().enumerate() {
            if row.len() != inputs {
                bail!("{name}: row {i} has {} inputs, expected {inputs}", row.len());
            }
        }
        Ok(())
    }

    fn forward(&self, input: &[f32], relu: bool) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| {
                let z = row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b;
                if relu {
                    z.max(0.0)
                } else {
                    z
                }
            })
            .collect()
    }
}

/// On-disk model artifact: the three dense layers of the network, in
/// input-to-output order. Dropout exists only during training and has
/// no representation here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub layers: Vec<DenseLayer>,
}

/// Feed-forward 5→32→16→3 classifier over normalized features.
pub struct MlpClassifier {
    layers: Vec<DenseLayer>,
}

impl MlpClassifier {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading model artifact {}", path.display()))?;
        let artifact: ModelArtifact = serde_json::from_str(&content)
            .with_context(|| format!("parsing model artifact {}", path.display()))?;
        Self::from_artifact(artifact)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        if artifact.layers.len() != 3 {
            bail!("model must have 3 dense layers, got {}", artifact.layers.len());
        }
        artifact.layers[0].check_shape("layer 0", NUM_FEATURES, HIDDEN1)?;
        artifact.layers[1].check_shape("layer 1", HIDDEN1, HIDDEN2)?;
        artifact.layers[2].check_shape("layer 2", HIDDEN2, NUM_CLASSES)?;
        Ok(Self {
            layers: artifact.layers,
        })
    }
}

impl Classifier for MlpClassifier {
    fn classify(&self, features: &[f32; NUM_FEATURES]) -> Result<Prediction> {
        let h1 = self.layers[0].forward(features, true);
        let h2 = self.layers[1].forward(&h1, true);
        let logits = self.layers[2].forward(&h2, false);

        // Argmax with ties broken by lowest index: only a strictly
        // greater score displaces the current winner.
        let mut best = 0usize;
        for (i, &score) in logits.iter().enumerate() {
            if score > logits[best] {
                best = i;
            }
        }

        let mut scores = [0.0f32; NUM_CLASSES];
        scores.copy_from_slice(&logits);

        let class = IoClass::from_index(best as i32)
            .context("argmax produced an out-of-range class")?;
        Ok(Prediction { class, scores })
    }
}
