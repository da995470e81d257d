//! Request-level orchestration shared by the CLI and the HTTP server.
//!
//! A [`Pipeline`] owns the loaded models, the activation tap cache and the
//! usage counters. Models are optional: a missing model only fails the
//! requests that need it.

use crate::classifier::{classify, ClassifierError, LinearClassifier, Prediction};
use crate::combine::{combine, CombinedPrediction};
use crate::config::{Config, ModelPaths};
use crate::core::features::{FeatureExtractor, FeatureVector, SchemaMismatch};
use crate::explain::{
    self, decode_grayscale, ConvNetwork, DrawingModel, ExplainError, Explanation,
    ImageInputError, OnnxNetwork, TapCache,
};
use crate::keystroke::{Gender, InputError, KeystrokeEvent};
use crate::usage::{create_shared_log, SharedUsageLog};
use crate::voice::{VoiceClassifier, VoiceInput};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which drawing test an image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawingKind {
    Spiral,
    Wave,
}

impl DrawingKind {
    pub const ALL: [DrawingKind; 2] = [DrawingKind::Spiral, DrawingKind::Wave];

    pub fn as_str(&self) -> &'static str {
        match self {
            DrawingKind::Spiral => "spiral",
            DrawingKind::Wave => "wave",
        }
    }
}

impl FromStr for DrawingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "spiral" => Ok(DrawingKind::Spiral),
            "wave" => Ok(DrawingKind::Wave),
            other => Err(format!("unknown drawing kind '{other}' (expected spiral or wave)")),
        }
    }
}

impl fmt::Display for DrawingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a single request.
#[derive(Debug)]
pub enum PipelineError {
    Input(InputError),
    Image(ImageInputError),
    Classifier(ClassifierError),
    Explain(ExplainError),
    /// Extracted features did not match the configured schema
    Features(SchemaMismatch),
    /// The model a request needs was not loaded
    ModelUnavailable(String),
}

impl PipelineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Input(InputError::EmptyLog) => "EMPTY_LOG",
            PipelineError::Input(InputError::UnknownGender(_)) => "INVALID_GENDER",
            PipelineError::Input(InputError::MalformedLog(_)) => "INVALID_LOG",
            PipelineError::Input(InputError::MalformedMeasurements(_)) => "INVALID_MEASUREMENTS",
            PipelineError::Image(_) | PipelineError::Explain(ExplainError::Input(_)) => {
                "INVALID_IMAGE"
            }
            PipelineError::Explain(ExplainError::NoCompatibleLayers { .. }) => {
                "NO_COMPATIBLE_LAYERS"
            }
            PipelineError::Classifier(_) | PipelineError::Explain(_) => "INFERENCE_ERROR",
            PipelineError::Features(_) => "FEATURE_SCHEMA",
            PipelineError::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
        }
    }

    /// Whether the caller sent something unusable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Input(_)
                | PipelineError::Image(_)
                | PipelineError::Explain(ExplainError::Input(_))
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Input(e) => write!(f, "{e}"),
            PipelineError::Image(e) => write!(f, "{e}"),
            PipelineError::Classifier(e) => write!(f, "{e}"),
            PipelineError::Explain(e) => write!(f, "{e}"),
            PipelineError::Features(e) => write!(f, "Feature schema mismatch: {e}"),
            PipelineError::ModelUnavailable(name) => write!(f, "Model '{name}' is not loaded"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<InputError> for PipelineError {
    fn from(e: InputError) -> Self {
        PipelineError::Input(e)
    }
}

impl From<ImageInputError> for PipelineError {
    fn from(e: ImageInputError) -> Self {
        PipelineError::Image(e)
    }
}

impl From<ClassifierError> for PipelineError {
    fn from(e: ClassifierError) -> Self {
        PipelineError::Classifier(e)
    }
}

impl From<ExplainError> for PipelineError {
    fn from(e: ExplainError) -> Self {
        PipelineError::Explain(e)
    }
}

impl From<SchemaMismatch> for PipelineError {
    fn from(e: SchemaMismatch) -> Self {
        PipelineError::Features(e)
    }
}

/// The models a pipeline can serve; any of them may be absent.
#[derive(Default)]
pub struct Models {
    pub typing: Option<LinearClassifier>,
    pub voice: Option<VoiceClassifier>,
    pub spiral: Option<Box<dyn DrawingModel>>,
    pub wave: Option<Box<dyn DrawingModel>>,
}

impl Models {
    /// Load every model in `paths`, warning about and skipping the failures.
    pub fn load(paths: &ModelPaths) -> Self {
        let typing = LinearClassifier::load(&paths.typing)
            .map_err(|e| {
                tracing::warn!(path = %paths.typing.display(), error = %e, "typing model not loaded");
            })
            .ok();
        let voice = VoiceClassifier::load(&paths.voice)
            .map_err(|e| {
                tracing::warn!(path = %paths.voice.display(), error = %e, "voice model not loaded");
            })
            .ok();
        let load_network = |kind: DrawingKind| -> Option<Box<dyn DrawingModel>> {
            let path = paths.network(kind);
            match OnnxNetwork::load(path, kind.as_str()) {
                Ok(network) => Some(Box::new(network)),
                Err(e) => {
                    tracing::warn!(network = %kind, path = %path.display(), error = %e, "network not loaded");
                    None
                }
            }
        };

        Self {
            typing,
            voice,
            spiral: load_network(DrawingKind::Spiral),
            wave: load_network(DrawingKind::Wave),
        }
    }
}

/// Inputs for a combined prediction; absent inputs are not run.
#[derive(Debug, Default)]
pub struct CombinedInputs {
    /// Keystroke log and gender
    pub typing: Option<(Vec<KeystrokeEvent>, String)>,
    pub spiral: Option<Vec<u8>>,
    pub wave: Option<Vec<u8>>,
    pub voice: Option<VoiceInput>,
}

/// Result of one model within a combined prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityOutcome {
    pub modality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Per-model outcomes and the vote over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedReport {
    pub outcomes: Vec<ModalityOutcome>,
    pub combined: CombinedPrediction,
}

/// Loaded models plus per-process state.
pub struct Pipeline {
    config: Config,
    extractor: FeatureExtractor,
    models: Models,
    taps: TapCache,
    usage: SharedUsageLog,
}

impl Pipeline {
    /// Build a pipeline from already-loaded models.
    pub fn new(config: Config, models: Models) -> Self {
        Self {
            extractor: FeatureExtractor::new(config.gender_encoding),
            config,
            models,
            taps: TapCache::new(),
            usage: create_shared_log(),
        }
    }

    /// Load every model named in `config`, skipping those that fail.
    pub fn from_config(config: Config) -> Self {
        let models = Models::load(&config.models);
        Self::new(config, models)
    }

    /// Replace the usage log, e.g. with a persisted one.
    pub fn with_usage_log(mut self, usage: SharedUsageLog) -> Self {
        self.usage = usage;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn usage(&self) -> &SharedUsageLog {
        &self.usage
    }

    pub fn network(&self, kind: DrawingKind) -> Option<&dyn DrawingModel> {
        match kind {
            DrawingKind::Spiral => self.models.spiral.as_deref(),
            DrawingKind::Wave => self.models.wave.as_deref(),
        }
    }

    /// Names of the loaded models.
    pub fn loaded_models(&self) -> Vec<&'static str> {
        let mut loaded = Vec::new();
        if self.models.typing.is_some() {
            loaded.push("typing");
        }
        if self.models.voice.is_some() {
            loaded.push("voice");
        }
        for kind in DrawingKind::ALL {
            if self.network(kind).is_some() {
                loaded.push(kind.as_str());
            }
        }
        loaded
    }

    /// Extract the typing feature vector, writing the debug dump if configured.
    pub fn features(
        &self,
        log: &[KeystrokeEvent],
        gender: Gender,
    ) -> Result<FeatureVector, PipelineError> {
        let vector = self.extractor.extract(log, gender)?;
        if let Some(path) = &self.config.debug_dump {
            if let Err(e) = vector.write_csv(path) {
                tracing::warn!(path = %path.display(), error = %e, "feature dump failed");
            }
        }
        Ok(vector)
    }

    /// Classify a typing session. An empty log is rejected.
    pub fn predict_typing(
        &self,
        log: &[KeystrokeEvent],
        gender: &str,
    ) -> Result<Prediction, PipelineError> {
        if log.is_empty() {
            return Err(InputError::EmptyLog.into());
        }
        let gender: Gender = gender.parse()?;
        let model = self
            .models
            .typing
            .as_ref()
            .ok_or_else(|| PipelineError::ModelUnavailable("typing".to_string()))?;

        let vector = self.features(log, gender)?;
        let prediction = classify(model, &vector)?;
        self.usage.record_typing_prediction();
        tracing::debug!(
            events = log.len(),
            probability = prediction.probability,
            "typing prediction"
        );
        Ok(prediction)
    }

    /// Classify an uploaded drawing.
    pub fn predict_image(
        &self,
        kind: DrawingKind,
        bytes: &[u8],
    ) -> Result<Prediction, PipelineError> {
        let network = self
            .network(kind)
            .ok_or_else(|| PipelineError::ModelUnavailable(kind.to_string()))?;
        let input = decode_grayscale(bytes, self.config.image_size)?;
        let prediction = classify(network, &input)?;
        self.usage.record_image_prediction();
        tracing::debug!(network = %kind, probability = prediction.probability, "image prediction");
        Ok(prediction)
    }

    /// Classify a set of voice measurements.
    pub fn predict_voice(&self, input: &VoiceInput) -> Result<Prediction, PipelineError> {
        input.validate()?;
        let model = self
            .models
            .voice
            .as_ref()
            .ok_or_else(|| PipelineError::ModelUnavailable("voice".to_string()))?;
        let prediction = classify(model, input)?;
        self.usage.record_voice_prediction();
        tracing::debug!(probability = prediction.probability, "voice prediction");
        Ok(prediction)
    }

    /// Run every supplied input through its model and take a majority vote.
    ///
    /// A failed model is reported in its outcome and does not vote.
    pub fn predict_combined(&self, inputs: &CombinedInputs) -> CombinedReport {
        let mut outcomes = Vec::new();
        let mut record = |modality: &str, result: Result<Prediction, PipelineError>| {
            let outcome = match result {
                Ok(prediction) => ModalityOutcome {
                    modality: modality.to_string(),
                    result: Some(prediction),
                    error: None,
                    code: None,
                },
                Err(e) => {
                    tracing::warn!(modality, code = e.code(), error = %e, "model left out of the vote");
                    ModalityOutcome {
                        modality: modality.to_string(),
                        result: None,
                        error: Some(e.to_string()),
                        code: Some(e.code().to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        };

        if let Some((log, gender)) = &inputs.typing {
            record("typing", self.predict_typing(log, gender));
        }
        if let Some(bytes) = &inputs.spiral {
            record("spiral", self.predict_image(DrawingKind::Spiral, bytes));
        }
        if let Some(bytes) = &inputs.wave {
            record("wave", self.predict_image(DrawingKind::Wave, bytes));
        }
        if let Some(voice) = &inputs.voice {
            record("voice", self.predict_voice(voice));
        }

        let votes: Vec<Option<Prediction>> = outcomes.iter().map(|o| o.result).collect();
        let combined = combine(&votes);
        self.usage.record_combined_prediction();
        tracing::debug!(status = ?combined.status, votes = combined.votes, "combined prediction");
        CombinedReport { outcomes, combined }
    }

    /// Render activation mosaics for an uploaded drawing.
    pub fn explain(&self, bytes: &[u8]) -> Result<Explanation, PipelineError> {
        let input = decode_grayscale(bytes, self.config.image_size)?;

        let candidates: Vec<&dyn ConvNetwork> = self
            .config
            .explain_candidates
            .iter()
            .filter_map(|name| name.parse::<DrawingKind>().ok())
            .filter_map(|kind| self.network(kind))
            .map(|model| model.as_network())
            .collect();
        if candidates.is_empty() {
            return Err(PipelineError::ModelUnavailable(
                self.config.explain_candidates.join(", "),
            ));
        }
        let tap = self.taps.get_or_build(&candidates)?;

        let explanation = explain::explain(&tap, &input, &self.config.mosaic)?;
        self.usage
            .record_explanation(explanation.rendered() as u64, explanation.failed() as u64);
        Ok(explanation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::GenderEncoding;
    use crate::explain::{encode_png, LayerMeta, NetworkError, TapModel};
    use crate::keystroke::Hand;
    use crate::voice::VOICE_FEATURES;
    use image::GrayImage;
    use ndarray::Array4;
    use std::collections::HashMap;

    fn bias_model(bias: f64) -> LinearClassifier {
        let encoding = GenderEncoding::Label;
        let columns: Vec<String> = encoding.column_order().iter().map(|s| s.to_string()).collect();
        let n = columns.len();
        LinearClassifier {
            encoding,
            columns,
            means: vec![0.0; n],
            scales: vec![1.0; n],
            weights: vec![0.0; n],
            bias,
            categories: HashMap::from([("Male".to_string(), 1.0), ("Female".to_string(), 0.0)]),
        }
    }

    fn voice_model(bias: f64) -> VoiceClassifier {
        VoiceClassifier {
            columns: VOICE_FEATURES.iter().map(|s| s.to_string()).collect(),
            means: vec![0.0; 21],
            scales: vec![1.0; 21],
            weights: vec![0.0; 21],
            bias,
        }
    }

    fn voice_input() -> VoiceInput {
        let value: serde_json::Value = VOICE_FEATURES
            .iter()
            .map(|name| (name.to_string(), serde_json::json!(0.5)))
            .collect::<serde_json::Map<_, _>>()
            .into();
        VoiceInput::from_value(value).unwrap()
    }

    /// Drawing classifier with a fixed output and no feature maps.
    struct FixedDrawingModel(f64);

    impl ConvNetwork for FixedDrawingModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn layers(&self) -> Vec<LayerMeta> {
            vec![LayerMeta::new("output", "Dense", vec![None, Some(1)])]
        }

        fn tap(&self, layer_names: &[String]) -> Result<Box<dyn TapModel>, NetworkError> {
            Err(NetworkError::UnknownLayer(layer_names.join(",")))
        }
    }

    impl crate::classifier::Classifier<Array4<f32>> for FixedDrawingModel {
        fn predict_probability(&self, _input: &Array4<f32>) -> Result<f64, ClassifierError> {
            Ok(self.0)
        }
    }

    fn drawing() -> Vec<u8> {
        encode_png(&GrayImage::new(4, 4)).unwrap()
    }

    fn log() -> Vec<KeystrokeEvent> {
        vec![KeystrokeEvent::new("a", Hand::L).with_hold_time(90.0)]
    }

    fn typing_only(bias: f64) -> Models {
        Models {
            typing: Some(bias_model(bias)),
            ..Models::default()
        }
    }

    #[test]
    fn test_predict_typing() {
        let pipeline = Pipeline::new(Config::default(), typing_only(2.0));
        let p = pipeline.predict_typing(&log(), "Female").unwrap();
        assert_eq!(p.prediction, 1);
        assert_eq!(pipeline.usage().stats().typing_predictions, 1);
    }

    #[test]
    fn test_empty_log_and_bad_gender_codes() {
        let pipeline = Pipeline::new(Config::default(), typing_only(0.0));

        let empty = pipeline.predict_typing(&[], "Male").unwrap_err();
        assert_eq!(empty.code(), "EMPTY_LOG");
        assert!(empty.is_client_error());

        let gender = pipeline.predict_typing(&log(), "male").unwrap_err();
        assert_eq!(gender.code(), "INVALID_GENDER");
        assert_eq!(pipeline.usage().stats().typing_predictions, 0);
    }

    #[test]
    fn test_missing_models() {
        let pipeline = Pipeline::new(Config::default(), Models::default());
        assert_eq!(
            pipeline.predict_typing(&log(), "Male").unwrap_err().code(),
            "MODEL_UNAVAILABLE"
        );
        assert_eq!(
            pipeline.predict_image(DrawingKind::Wave, b"").unwrap_err().code(),
            "MODEL_UNAVAILABLE"
        );
        assert_eq!(
            pipeline.predict_voice(&voice_input()).unwrap_err().code(),
            "MODEL_UNAVAILABLE"
        );
        assert!(pipeline.loaded_models().is_empty());
    }

    #[test]
    fn test_missing_model_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let models = Models::load(&ModelPaths::in_dir(dir.path()));
        assert!(models.typing.is_none());
        assert!(models.voice.is_none());
        assert!(models.spiral.is_none());
        assert!(models.wave.is_none());
    }

    #[test]
    fn test_predict_voice() {
        let models = Models {
            voice: Some(voice_model(-1.0)),
            ..Models::default()
        };
        let pipeline = Pipeline::new(Config::default(), models);
        let p = pipeline.predict_voice(&voice_input()).unwrap();
        assert_eq!(p.prediction, 0);
        assert_eq!(pipeline.usage().stats().voice_predictions, 1);
        assert_eq!(pipeline.loaded_models(), vec!["voice"]);

        let mut bad = voice_input();
        bad.nhr = f64::NAN;
        let err = pipeline.predict_voice(&bad).unwrap_err();
        assert_eq!(err.code(), "INVALID_MEASUREMENTS");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_combined_vote_skips_failed_models() {
        let config = Config {
            image_size: 4,
            ..Config::default()
        };
        let models = Models {
            typing: Some(bias_model(2.0)),
            voice: Some(voice_model(3.0)),
            spiral: Some(Box::new(FixedDrawingModel(0.2))),
            wave: None,
        };
        let pipeline = Pipeline::new(config, models);
        let inputs = CombinedInputs {
            typing: Some((log(), "Male".to_string())),
            spiral: Some(drawing()),
            wave: Some(drawing()),
            voice: Some(voice_input()),
        };
        let report = pipeline.predict_combined(&inputs);

        let modalities: Vec<&str> = report.outcomes.iter().map(|o| o.modality.as_str()).collect();
        assert_eq!(modalities, vec!["typing", "spiral", "wave", "voice"]);
        assert_eq!(report.outcomes[2].code.as_deref(), Some("MODEL_UNAVAILABLE"));
        assert_eq!(report.combined.votes, 3);
        assert_eq!(report.combined.prediction, Some(1));

        let stats = pipeline.usage().stats();
        assert_eq!(stats.combined_predictions, 1);
        assert_eq!(stats.image_predictions, 1);
    }

    #[test]
    fn test_combined_with_one_input_is_inconclusive() {
        let pipeline = Pipeline::new(Config::default(), typing_only(2.0));
        let inputs = CombinedInputs {
            typing: Some((log(), "Male".to_string())),
            ..CombinedInputs::default()
        };
        let report = pipeline.predict_combined(&inputs);
        assert_eq!(report.combined.status, crate::combine::VoteStatus::Inconclusive);
    }

    #[test]
    fn test_debug_dump_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let config = Config {
            debug_dump: Some(path.clone()),
            ..Config::default()
        };
        let pipeline = Pipeline::new(config, typing_only(0.0));
        pipeline.predict_typing(&log(), "Male").unwrap();

        let csv = std::fs::read_to_string(&path).unwrap();
        assert!(csv.starts_with("L_HoldTime_mean,"));
        assert!(csv.contains("Male"));
    }

    #[test]
    fn test_drawing_kind_parsing() {
        assert_eq!("Wave".parse::<DrawingKind>().unwrap(), DrawingKind::Wave);
        assert!("typing".parse::<DrawingKind>().is_err());
    }

    #[test]
    fn test_mixed_case_candidate_used_for_explanation() {
        let config = Config {
            image_size: 4,
            explain_candidates: vec!["Spiral".to_string()],
            ..Config::default()
        };
        let models = Models {
            spiral: Some(Box::new(FixedDrawingModel(0.5))),
            ..Models::default()
        };
        let pipeline = Pipeline::new(config, models);
        // the candidate resolves to the loaded spiral model, which has no feature maps
        let err = pipeline.explain(&drawing()).unwrap_err();
        assert_eq!(err.code(), "NO_COMPATIBLE_LAYERS");
    }
}
