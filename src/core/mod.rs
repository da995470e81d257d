//! Core feature engineering.
//!
//! This module contains the keystroke feature extractor that turns a typing
//! session into the fixed-order vector consumed by the typing classifier.

pub mod features;

// Re-export commonly used types
pub use features::{
    Feature, FeatureExtractor, FeatureValue, FeatureVector, GenderEncoding, GroupStats,
    SchemaMismatch, KURT_MIN_SAMPLES, NUMERICAL_FEATURES, SKEW_MIN_SAMPLES,
};
