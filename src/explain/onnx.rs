//! ONNX Runtime backed drawing network.
//!
//! The model is expected to be exported with its intermediate layer outputs
//! as extra graph outputs. Output 0 is the classifier head (a probability
//! per batch item); outputs 1.. are the intermediate layers in forward order.
//! A tap selects some of those outputs by name and reads them from a single
//! `Session::run`.

use crate::classifier::{Classifier, ClassifierError};
use crate::explain::network::{ConvNetwork, LayerMeta, NetworkError, TapModel};
use ndarray::{Array4, ArrayD, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Index of the classifier head among the session outputs.
const PREDICTION_OUTPUT: usize = 0;

static ORT_ENV: OnceLock<Result<Arc<Environment>, String>> = OnceLock::new();

fn init_env() -> Result<Arc<Environment>, NetworkError> {
    ORT_ENV
        .get_or_init(|| {
            Environment::builder()
                .with_name("motorsense")
                .build()
                .map(Environment::into_arc)
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(NetworkError::Load)
}

/// Session plus the metadata read from it at load time.
struct Graph {
    session: Session,
    input_dims: Vec<Option<usize>>,
    /// One entry per session output, in session order
    outputs: Vec<LayerMeta>,
}

impl Graph {
    /// Run the session once and copy out the outputs at `indices`.
    fn run(&self, input: &Array4<f32>, indices: &[usize]) -> Result<Vec<ArrayD<f32>>, NetworkError> {
        check_input(&self.input_dims, input.shape())?;

        let array = CowArray::from(input.view().into_dyn());
        let value = Value::from_array(self.session.allocator(), &array)
            .map_err(|e| NetworkError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(vec![value])
            .map_err(|e| NetworkError::Inference(e.to_string()))?;

        indices
            .iter()
            .map(|&i| {
                let output = outputs.get(i).ok_or_else(|| {
                    NetworkError::Inference(format!("session returned no output {i}"))
                })?;
                let tensor = output
                    .try_extract::<f32>()
                    .map_err(|e| NetworkError::Inference(e.to_string()))?;
                let array = tensor.view().to_owned();
                Ok(array)
            })
            .collect()
    }
}

/// A drawing classifier loaded from an ONNX file.
#[derive(Clone)]
pub struct OnnxNetwork {
    name: String,
    graph: Arc<Graph>,
}

impl OnnxNetwork {
    /// Load `path` under the given network name.
    pub fn load(path: &Path, name: impl Into<String>) -> Result<Self, NetworkError> {
        let name = name.into();
        if !path.exists() {
            return Err(NetworkError::Load(format!(
                "model file {} not found",
                path.display()
            )));
        }

        let env = init_env()?;
        let session = SessionBuilder::new(&env)
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_model_from_file(path))
            .map_err(|e| NetworkError::Load(e.to_string()))?;

        let input_dims = session
            .inputs
            .first()
            .map(|input| dims(&input.dimensions))
            .ok_or_else(|| NetworkError::Load("model has no inputs".to_string()))?;
        if session.inputs.len() != 1 {
            return Err(NetworkError::Load(format!(
                "expected one image input, model has {}",
                session.inputs.len()
            )));
        }
        if session.outputs.is_empty() {
            return Err(NetworkError::Load("model has no outputs".to_string()));
        }
        let outputs = session
            .outputs
            .iter()
            .map(|output| layer_meta(&output.name, &output.dimensions))
            .collect();

        tracing::info!(
            network = %name,
            path = %path.display(),
            outputs = session.outputs.len(),
            "onnx network loaded"
        );

        Ok(Self {
            name,
            graph: Arc::new(Graph {
                session,
                input_dims,
                outputs,
            }),
        })
    }
}

impl ConvNetwork for OnnxNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn layers(&self) -> Vec<LayerMeta> {
        forward_order(&self.graph.outputs)
    }

    fn tap(&self, layer_names: &[String]) -> Result<Box<dyn TapModel>, NetworkError> {
        let indices = output_indices(&self.graph.outputs, layer_names)?;
        Ok(Box::new(OnnxTap {
            graph: Arc::clone(&self.graph),
            indices,
        }))
    }
}

impl Classifier<Array4<f32>> for OnnxNetwork {
    fn predict_probability(&self, input: &Array4<f32>) -> Result<f64, ClassifierError> {
        let outputs = self
            .graph
            .run(input, &[PREDICTION_OUTPUT])
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;
        let head = outputs
            .first()
            .ok_or_else(|| ClassifierError::Inference("no prediction output".to_string()))?;
        probability_from(head)
    }
}

struct OnnxTap {
    graph: Arc<Graph>,
    indices: Vec<usize>,
}

impl TapModel for OnnxTap {
    fn run(&self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>, NetworkError> {
        self.graph.run(input, &self.indices)
    }
}

/// Symbolic or negative dimensions become `None`.
fn dims(dimensions: &[Option<u32>]) -> Vec<Option<usize>> {
    dimensions
        .iter()
        .map(|d| d.filter(|n| *n > 0).map(|n| n as usize))
        .collect()
}

fn layer_meta(name: &str, dimensions: &[Option<u32>]) -> LayerMeta {
    let shape = dims(dimensions);
    let layer_type = layer_type_for(name, shape.len());
    LayerMeta::new(name, layer_type, shape)
}

/// Keras layer type guessed from an exported output name such as
/// `sequential/conv2d_1/Relu:0`.
fn layer_type_for(name: &str, rank: usize) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.contains("conv") {
        "Conv2D"
    } else if lower.contains("pool") {
        "MaxPooling2D"
    } else if lower.contains("flatten") {
        "Flatten"
    } else if lower.contains("dropout") {
        "Dropout"
    } else if lower.contains("dense") || lower.contains("gemm") || lower.contains("matmul") {
        "Dense"
    } else if rank == 4 {
        "FeatureMap"
    } else {
        "Tensor"
    }
}

/// Intermediate outputs first, the classifier head last.
fn forward_order(outputs: &[LayerMeta]) -> Vec<LayerMeta> {
    let mut layers: Vec<LayerMeta> = outputs
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != PREDICTION_OUTPUT)
        .map(|(_, meta)| meta.clone())
        .collect();
    if let Some(head) = outputs.get(PREDICTION_OUTPUT) {
        layers.push(head.clone());
    }
    layers
}

fn output_indices(outputs: &[LayerMeta], names: &[String]) -> Result<Vec<usize>, NetworkError> {
    names
        .iter()
        .map(|name| {
            outputs
                .iter()
                .position(|meta| &meta.name == name)
                .ok_or_else(|| NetworkError::UnknownLayer(name.clone()))
        })
        .collect()
}

fn check_input(expected: &[Option<usize>], found: &[usize]) -> Result<(), NetworkError> {
    let fits = expected.len() == found.len()
        && expected
            .iter()
            .zip(found)
            .all(|(e, f)| e.map_or(true, |e| e == *f));
    if fits {
        Ok(())
    } else {
        Err(NetworkError::InputShape {
            expected: expected.iter().map(|d| d.unwrap_or(0)).collect(),
            found: found.to_vec(),
        })
    }
}

/// First value of the classifier head, i.e. the first batch item's probability.
fn probability_from(head: &ArrayD<f32>) -> Result<f64, ClassifierError> {
    let value = head
        .iter()
        .next()
        .copied()
        .ok_or_else(|| ClassifierError::InvalidModel("prediction output is empty".to_string()))?;
    if !value.is_finite() {
        return Err(ClassifierError::Inference(format!(
            "prediction output is {value}"
        )));
    }
    Ok(f64::from(value).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn exported_outputs() -> Vec<LayerMeta> {
        vec![
            layer_meta("dense_1", &[None, Some(1)]),
            layer_meta("sequential/conv2d/Relu:0", &[None, Some(126), Some(126), Some(32)]),
            layer_meta(
                "sequential/max_pooling2d/MaxPool:0",
                &[None, Some(63), Some(63), Some(32)],
            ),
            layer_meta("sequential/flatten/Reshape:0", &[None, Some(127008)]),
        ]
    }

    #[test]
    fn test_layer_metadata_from_outputs() {
        let outputs = exported_outputs();
        assert_eq!(outputs[0].layer_type, "Dense");
        assert_eq!(outputs[1].layer_type, "Conv2D");
        assert_eq!(outputs[1].output_shape, vec![None, Some(126), Some(126), Some(32)]);
        assert!(outputs[1].is_feature_map());
        assert_eq!(outputs[2].layer_type, "MaxPooling2D");
        assert_eq!(outputs[3].layer_type, "Flatten");
        assert_eq!(layer_type_for("unet_block", 4), "FeatureMap");
        assert_eq!(layer_type_for("logits", 2), "Tensor");
    }

    #[test]
    fn test_dynamic_dims_are_unbound() {
        assert_eq!(dims(&[None, Some(0), Some(8)]), vec![None, None, Some(8)]);
    }

    #[test]
    fn test_head_listed_last() {
        let names: Vec<String> = forward_order(&exported_outputs())
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "sequential/conv2d/Relu:0",
                "sequential/max_pooling2d/MaxPool:0",
                "sequential/flatten/Reshape:0",
                "dense_1",
            ]
        );
    }

    #[test]
    fn test_tap_selects_outputs_by_name() {
        let outputs = exported_outputs();
        let names = vec![
            "sequential/max_pooling2d/MaxPool:0".to_string(),
            "sequential/conv2d/Relu:0".to_string(),
        ];
        assert_eq!(output_indices(&outputs, &names).unwrap(), vec![2, 1]);
        assert_eq!(
            output_indices(&outputs, &["conv9".to_string()]),
            Err(NetworkError::UnknownLayer("conv9".to_string()))
        );
    }

    #[test]
    fn test_input_shape_check() {
        let expected = vec![None, Some(128), Some(128), Some(1)];
        assert!(check_input(&expected, &[1, 128, 128, 1]).is_ok());
        assert!(check_input(&expected, &[4, 128, 128, 1]).is_ok());
        assert!(matches!(
            check_input(&expected, &[1, 64, 64, 1]),
            Err(NetworkError::InputShape { .. })
        ));
        assert!(check_input(&expected, &[128, 128]).is_err());
    }

    #[test]
    fn test_probability_from_head() {
        let head = ArrayD::from_shape_vec(IxDyn(&[1, 1]), vec![0.75f32]).unwrap();
        assert!((probability_from(&head).unwrap() - 0.75).abs() < 1e-6);

        let empty = ArrayD::<f32>::zeros(IxDyn(&[1, 0]));
        assert!(matches!(
            probability_from(&empty),
            Err(ClassifierError::InvalidModel(_))
        ));

        let nan = ArrayD::from_elem(IxDyn(&[1, 1]), f32::NAN);
        assert!(matches!(
            probability_from(&nan),
            Err(ClassifierError::Inference(_))
        ));
    }

    #[test]
    fn test_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxNetwork::load(&dir.path().join("spiral.onnx"), "spiral")
            .err()
            .unwrap();
        assert!(matches!(err, NetworkError::Load(_)));
    }
}
