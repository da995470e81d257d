//! Interfaces to convolutional networks used for activation taps.

use crate::classifier::Classifier;
use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Static description of one network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMeta {
    /// Layer name, unique within its network
    pub name: String,
    /// Layer type tag (e.g. "Conv2D")
    pub layer_type: String,
    /// Output shape; `None` marks the unbound batch dimension
    pub output_shape: Vec<Option<usize>>,
}

impl LayerMeta {
    pub fn new(
        name: impl Into<String>,
        layer_type: impl Into<String>,
        output_shape: Vec<Option<usize>>,
    ) -> Self {
        Self {
            name: name.into(),
            layer_type: layer_type.into(),
            output_shape,
        }
    }

    pub fn rank(&self) -> usize {
        self.output_shape.len()
    }

    /// Whether the output is a (batch, height, width, channels) feature map.
    pub fn is_feature_map(&self) -> bool {
        self.rank() == 4
    }
}

/// A loaded convolutional network that can expose its intermediate outputs.
pub trait ConvNetwork: Send + Sync {
    fn name(&self) -> &str;

    /// All layers in forward order.
    fn layers(&self) -> Vec<LayerMeta>;

    /// Derive a model returning the outputs of `layer_names`, in that order.
    fn tap(&self, layer_names: &[String]) -> Result<Box<dyn TapModel>, NetworkError>;
}

/// A multi-output model derived from a [`ConvNetwork`].
pub trait TapModel: Send + Sync {
    /// Run one forward pass; one output per tapped layer.
    fn run(&self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>, NetworkError>;
}

/// A drawing classifier whose intermediate layers can also be tapped.
pub trait DrawingModel: ConvNetwork + Classifier<Array4<f32>> {
    fn as_network(&self) -> &dyn ConvNetwork;
}

impl<T: ConvNetwork + Classifier<Array4<f32>>> DrawingModel for T {
    fn as_network(&self) -> &dyn ConvNetwork {
        self
    }
}

/// Network errors.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// Model file could not be read or has an unusable signature
    Load(String),
    /// A requested layer does not exist
    UnknownLayer(String),
    /// Input tensor has the wrong shape
    InputShape { expected: Vec<usize>, found: Vec<usize> },
    /// Forward pass failed
    Inference(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Load(e) => write!(f, "Failed to load network: {e}"),
            NetworkError::UnknownLayer(name) => write!(f, "Unknown layer '{name}'"),
            NetworkError::InputShape { expected, found } => {
                write!(f, "Input shape {found:?} does not match {expected:?}")
            }
            NetworkError::Inference(e) => write!(f, "Inference failed: {e}"),
        }
    }
}

impl std::error::Error for NetworkError {}
