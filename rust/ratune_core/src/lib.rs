// SPDX-License-Identifier: GPL-2.0
//
// ratune: adaptive readahead tuning for block devices.
//
// Shared pieces of the two ratune daemons: the windowed I/O feature
// pipeline used by the collector (ratune_trace) and the classifier plus
// wire protocol served by the inference daemon (ratune_predictor).

pub mod event;
pub mod features;
pub mod model;
pub mod proto;
pub mod window;

pub use event::{Direction, EventSource, RawEvent};
pub use features::FeatureVec;
pub use model::{Classifier, IoClass, MlpClassifier, NormParams, Prediction};
pub use proto::PredictorClient;
pub use window::WindowStats;

/// Number of features derived per window. The wire protocol, the
/// normalization artifact and the classifier input layer all share it.
pub const NUM_FEATURES: usize = 5;

/// Number of access-pattern classes the model distinguishes.
pub const NUM_CLASSES: usize = 3;

/// Consecutive-position distance above which a request counts as a
/// large jump. Empirically chosen alongside the training data; both
/// daemons accept an override.
pub const DEFAULT_JUMP_THRESHOLD_BYTES: u64 = 1_000_000;

/// Default aggregation window.
pub const DEFAULT_WINDOW_MS: u64 = 2500;

/// Well-known socket path the inference daemon binds to.
pub const DEFAULT_SOCK_PATH: &str = "/tmp/ratune_predictor.sock";
