//! motorsense - motor-symptom screening signals from typing and drawing.
//!
//! This library turns a typing session into a fixed-schema feature vector
//! for a tabular classifier, scores voice measurements and drawings, takes a
//! majority vote across those results, and renders the internal
//! convolutional activations of a drawing classifier as grayscale mosaics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          motorsense                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────┐       │
//! │  │ Keystroke  │──▶│  Features  │──▶│ LinearClassifier│       │
//! │  │    log     │   │ (27 + cat) │   │                 │       │
//! │  └────────────┘   └────────────┘   └─────────────────┘       │
//! │                                                              │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────┐       │
//! │  │  Drawing   │──▶│ Activation │──▶│     Mosaics     │       │
//! │  │   image    │   │    tap     │   │   (PNG, b64)    │       │
//! │  └────────────┘   └────────────┘   └─────────────────┘       │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌────────────┐                    ┌─────────────────┐       │
//! │  │    ONNX    │                    │    Usage log    │       │
//! │  │  network   │                    │                 │       │
//! │  └────────────┘                    └─────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use motorsense::core::{FeatureExtractor, GenderEncoding};
//! use motorsense::keystroke::{parse_log, Gender};
//!
//! let log = parse_log(r#"[{"key":"a","hand":"L","holdTime":95}]"#).unwrap();
//! let features = FeatureExtractor::new(GenderEncoding::Label).extract(&log, Gender::Female).unwrap();
//! assert_eq!(features.len(), 28);
//! ```

pub mod classifier;
pub mod combine;
pub mod config;
pub mod core;
pub mod explain;
pub mod keystroke;
pub mod pipeline;
pub mod usage;
pub mod voice;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use classifier::{classify, Classifier, ClassifierError, LinearClassifier, Prediction};
pub use combine::{combine, CombinedPrediction, VoteStatus};
pub use config::{Config, ConfigError, ModelPaths};
pub use core::{FeatureExtractor, FeatureVector, GenderEncoding};
pub use explain::{
    explain, ActivationTap, DrawingModel, ExplainError, Explanation, LayerExplanation,
    MosaicConfig, OnnxNetwork, TapCache,
};
pub use keystroke::{Gender, KeystrokeEvent, KeystrokeRecorder};
pub use pipeline::{CombinedInputs, CombinedReport, DrawingKind, Models, Pipeline, PipelineError};
pub use usage::{SharedUsageLog, UsageLog, UsageStats};
pub use voice::{VoiceClassifier, VoiceInput};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
