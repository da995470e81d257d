//! Activation visualization for drawing classifiers.
//!
//! An [`ActivationTap`] is built once over the first candidate network with
//! convolutional feature maps. Each [`explain`] call runs a single forward
//! pass and renders every tapped layer as a tiled grayscale mosaic. A layer
//! that cannot be rendered is reported in its entry and never aborts the
//! whole explanation.

pub mod image_io;
pub mod mosaic;
pub mod network;
pub mod onnx;
pub mod tap;

pub use image_io::{
    decode_grayscale, encode_png, preview_image, to_data_url, EncodeError, ImageInputError,
    INPUT_SIZE,
};
pub use mosaic::{normalize_channel, to_mosaic, MosaicConfig, MosaicError};
pub use network::{ConvNetwork, DrawingModel, LayerMeta, NetworkError, TapModel};
pub use onnx::OnnxNetwork;
pub use tap::{build_tap, ActivationTap, TapCache};

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors that fail an explanation as a whole.
#[derive(Debug)]
pub enum ExplainError {
    /// None of the candidate networks has a feature-map layer
    NoCompatibleLayers { candidates: Vec<String> },
    Network(NetworkError),
    Input(ImageInputError),
    Encode(EncodeError),
    Inference(String),
}

impl fmt::Display for ExplainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExplainError::NoCompatibleLayers { candidates } => write!(
                f,
                "No convolutional layers with 4D outputs found in any of: {}",
                candidates.join(", ")
            ),
            ExplainError::Network(e) => write!(f, "{e}"),
            ExplainError::Input(e) => write!(f, "{e}"),
            ExplainError::Encode(e) => write!(f, "{e}"),
            ExplainError::Inference(e) => write!(f, "Explanation failed: {e}"),
        }
    }
}

impl std::error::Error for ExplainError {}

impl From<NetworkError> for ExplainError {
    fn from(e: NetworkError) -> Self {
        ExplainError::Network(e)
    }
}

impl From<ImageInputError> for ExplainError {
    fn from(e: ImageInputError) -> Self {
        ExplainError::Input(e)
    }
}

impl From<EncodeError> for ExplainError {
    fn from(e: EncodeError) -> Self {
        ExplainError::Encode(e)
    }
}

/// Rendering of one tapped layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerExplanation {
    pub name: String,
    pub layer_type: String,
    pub output_shape: Vec<Option<usize>>,
    /// Channels in the activation
    pub channels: usize,
    /// Channels placed in the mosaic
    pub channels_shown: usize,
    /// PNG data URL; absent when the layer failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mosaic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one explanation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    /// Network the layers came from
    pub source: String,
    /// PNG data URL of the image the network saw
    pub preview: String,
    pub layers: Vec<LayerExplanation>,
}

impl Explanation {
    /// Layers that rendered successfully.
    pub fn rendered(&self) -> usize {
        self.layers.iter().filter(|l| l.mosaic.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.layers.len() - self.rendered()
    }
}

/// Run one forward pass through `tap` and render every tapped layer.
pub fn explain(
    tap: &ActivationTap,
    input: &Array4<f32>,
    config: &MosaicConfig,
) -> Result<Explanation, ExplainError> {
    let preview = to_data_url(&preview_image(input)?)?;
    let outputs = tap.model().run(input)?;

    let mut activations = outputs.into_iter();
    let layers = tap
        .layers()
        .iter()
        .map(|meta| {
            let activation = activations.next();
            let channels = activation
                .as_ref()
                .and_then(|a| a.shape().last().copied())
                .unwrap_or(0);

            let rendered = activation
                .ok_or(MosaicError::MissingActivation)
                .and_then(|a| to_mosaic(&a, config))
                .and_then(|img| to_data_url(&img).map_err(|e| MosaicError::Encode(e.to_string())));

            let (mosaic, error, channels_shown) = match rendered {
                Ok(url) => (Some(url), None, channels.min(config.max_channels)),
                Err(e) => {
                    tracing::warn!(layer = %meta.name, error = %e, "layer could not be rendered");
                    (None, Some(e.to_string()), 0)
                }
            };

            LayerExplanation {
                name: meta.name.clone(),
                layer_type: meta.layer_type.clone(),
                output_shape: meta.output_shape.clone(),
                channels,
                channels_shown,
                mosaic,
                error,
            }
        })
        .collect();

    Ok(Explanation {
        source: tap.source().to_string(),
        preview,
        layers,
    })
}
