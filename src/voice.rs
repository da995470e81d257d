//! Sustained-phonation voice measurements and their classifier.
//!
//! A [`VoiceInput`] carries the 21 dysphonia measurements the voice model
//! was trained on, keyed by the column names of the training set.

use crate::classifier::{check_parameters, sigmoid, standardized_logit, Classifier, ClassifierError};
use crate::keystroke::types::{coerce_f64, InputError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;

/// Measurement columns in model order.
pub const VOICE_FEATURES: [&str; 21] = [
    "MDVP_Fhi_Hz_",
    "MDVP_Flo_Hz_",
    "MDVP_Jitter_",
    "MDVP_Jitter_Abs_",
    "MDVP_RAP",
    "MDVP_PPQ",
    "Jitter_DDP",
    "MDVP_Shimmer",
    "MDVP_Shimmer_dB_",
    "Shimmer_APQ3",
    "Shimmer_APQ5",
    "MDVP_APQ",
    "Shimmer_DDA",
    "NHR",
    "HNR",
    "RPDE",
    "DFA",
    "spread1",
    "spread2",
    "D2",
    "PPE",
];

/// One set of voice measurements.
///
/// Numbers may also arrive as numeric strings; every field is required.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceInput {
    /// Maximum vocal fundamental frequency (Hz)
    #[serde(rename = "MDVP_Fhi_Hz_", deserialize_with = "measurement")]
    pub fhi_hz: f64,
    /// Minimum vocal fundamental frequency (Hz)
    #[serde(rename = "MDVP_Flo_Hz_", deserialize_with = "measurement")]
    pub flo_hz: f64,
    #[serde(rename = "MDVP_Jitter_", deserialize_with = "measurement")]
    pub jitter_percent: f64,
    #[serde(rename = "MDVP_Jitter_Abs_", deserialize_with = "measurement")]
    pub jitter_abs: f64,
    #[serde(rename = "MDVP_RAP", deserialize_with = "measurement")]
    pub rap: f64,
    #[serde(rename = "MDVP_PPQ", deserialize_with = "measurement")]
    pub ppq: f64,
    #[serde(rename = "Jitter_DDP", deserialize_with = "measurement")]
    pub jitter_ddp: f64,
    #[serde(rename = "MDVP_Shimmer", deserialize_with = "measurement")]
    pub shimmer: f64,
    #[serde(rename = "MDVP_Shimmer_dB_", deserialize_with = "measurement")]
    pub shimmer_db: f64,
    #[serde(rename = "Shimmer_APQ3", deserialize_with = "measurement")]
    pub shimmer_apq3: f64,
    #[serde(rename = "Shimmer_APQ5", deserialize_with = "measurement")]
    pub shimmer_apq5: f64,
    #[serde(rename = "MDVP_APQ", deserialize_with = "measurement")]
    pub apq: f64,
    #[serde(rename = "Shimmer_DDA", deserialize_with = "measurement")]
    pub shimmer_dda: f64,
    /// Noise-to-harmonics ratio
    #[serde(rename = "NHR", deserialize_with = "measurement")]
    pub nhr: f64,
    /// Harmonics-to-noise ratio
    #[serde(rename = "HNR", deserialize_with = "measurement")]
    pub hnr: f64,
    /// Recurrence period density entropy
    #[serde(rename = "RPDE", deserialize_with = "measurement")]
    pub rpde: f64,
    /// Detrended fluctuation analysis
    #[serde(rename = "DFA", deserialize_with = "measurement")]
    pub dfa: f64,
    #[serde(rename = "spread1", deserialize_with = "measurement")]
    pub spread1: f64,
    #[serde(rename = "spread2", deserialize_with = "measurement")]
    pub spread2: f64,
    /// Correlation dimension
    #[serde(rename = "D2", deserialize_with = "measurement")]
    pub d2: f64,
    /// Pitch period entropy
    #[serde(rename = "PPE", deserialize_with = "measurement")]
    pub ppe: f64,
}

impl VoiceInput {
    /// Parse a JSON object of measurements. Unknown keys are ignored.
    pub fn from_json(json: &str) -> Result<Self, InputError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| InputError::MalformedMeasurements(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, InputError> {
        let input: VoiceInput = serde_json::from_value(value)
            .map_err(|e| InputError::MalformedMeasurements(e.to_string()))?;
        input.validate()?;
        Ok(input)
    }

    /// Values in [`VOICE_FEATURES`] order.
    pub fn values(&self) -> [f64; 21] {
        [
            self.fhi_hz,
            self.flo_hz,
            self.jitter_percent,
            self.jitter_abs,
            self.rap,
            self.ppq,
            self.jitter_ddp,
            self.shimmer,
            self.shimmer_db,
            self.shimmer_apq3,
            self.shimmer_apq5,
            self.apq,
            self.shimmer_dda,
            self.nhr,
            self.hnr,
            self.rpde,
            self.dfa,
            self.spread1,
            self.spread2,
            self.d2,
            self.ppe,
        ]
    }

    /// Reject non-finite values, naming the first offending column.
    pub fn validate(&self) -> Result<(), InputError> {
        match self.values().iter().position(|v| !v.is_finite()) {
            Some(i) => Err(InputError::MalformedMeasurements(format!(
                "'{}' is not a finite number",
                VOICE_FEATURES[i]
            ))),
            None => Ok(()),
        }
    }
}

fn measurement<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    coerce_f64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {value}")))
}

/// Standardize-then-logistic model over voice measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceClassifier {
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl VoiceClassifier {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ClassifierError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let model: VoiceClassifier =
            serde_json::from_str(json).map_err(|e| ClassifierError::InvalidModel(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), ClassifierError> {
        check_parameters(
            &self.columns,
            &VOICE_FEATURES,
            &self.means,
            &self.scales,
            &self.weights,
        )
    }
}

impl Classifier<VoiceInput> for VoiceClassifier {
    fn predict_probability(&self, input: &VoiceInput) -> Result<f64, ClassifierError> {
        let z = standardized_logit(
            &input.values(),
            &self.means,
            &self.scales,
            &self.weights,
            self.bias,
        );
        Ok(sigmoid(z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "MDVP_Fhi_Hz_": 157.302, "MDVP_Flo_Hz_": 74.997, "MDVP_Jitter_": 0.00784,
            "MDVP_Jitter_Abs_": 0.00007, "MDVP_RAP": 0.0037, "MDVP_PPQ": 0.00554,
            "Jitter_DDP": 0.01109, "MDVP_Shimmer": 0.04374, "MDVP_Shimmer_dB_": 0.426,
            "Shimmer_APQ3": 0.02182, "Shimmer_APQ5": 0.0313, "MDVP_APQ": 0.02971,
            "Shimmer_DDA": 0.06545, "NHR": 0.02211, "HNR": 21.033, "RPDE": 0.414783,
            "DFA": 0.815285, "spread1": -4.813031, "spread2": 0.266482, "D2": 2.301442,
            "PPE": 0.284654
        })
    }

    fn model(weights: Vec<f64>, bias: f64) -> VoiceClassifier {
        VoiceClassifier {
            columns: VOICE_FEATURES.iter().map(|s| s.to_string()).collect(),
            means: vec![0.0; 21],
            scales: vec![1.0; 21],
            weights,
            bias,
        }
    }

    #[test]
    fn test_values_follow_column_order() {
        let input = VoiceInput::from_value(sample()).unwrap();
        let values = input.values();
        assert_eq!(values[0], 157.302);
        assert_eq!(values[14], 21.033);
        assert_eq!(values[20], 0.284654);
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let mut value = sample();
        value["HNR"] = json!("21.5");
        value["extra"] = json!("ignored");
        let input = VoiceInput::from_value(value).unwrap();
        assert_eq!(input.hnr, 21.5);
    }

    #[test]
    fn test_missing_or_bad_field_rejected() {
        let mut missing = sample();
        missing.as_object_mut().unwrap().remove("PPE");
        assert!(matches!(
            VoiceInput::from_value(missing),
            Err(InputError::MalformedMeasurements(_))
        ));

        let mut text = sample();
        text["D2"] = json!("high");
        assert!(matches!(
            VoiceInput::from_value(text),
            Err(InputError::MalformedMeasurements(_))
        ));

        assert!(VoiceInput::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let mut input = VoiceInput::from_value(sample()).unwrap();
        input.rpde = f64::INFINITY;
        let err = input.validate().unwrap_err();
        assert!(err.to_string().contains("RPDE"));
    }

    #[test]
    fn test_spread1_drives_prediction() {
        let mut weights = vec![0.0; 21];
        weights[17] = 1.0; // spread1
        let m = model(weights, 5.0);
        let input = VoiceInput::from_value(sample()).unwrap();
        let p = classify(&m, &input).unwrap();
        assert!((p.probability - sigmoid(5.0 - 4.813031)).abs() < 1e-12);
        assert_eq!(p.prediction, 1);
    }

    #[test]
    fn test_model_validation() {
        let m = model(vec![0.0; 21], 0.0);
        let json = serde_json::to_string(&m).unwrap();
        assert!(VoiceClassifier::from_json(&json).is_ok());

        let mut renamed = m.clone();
        renamed.columns[0] = "Fhi".to_string();
        assert!(renamed.validate().is_err());

        let mut short = m;
        short.means.pop();
        assert!(matches!(
            short.validate(),
            Err(ClassifierError::InvalidModel(_))
        ));
    }
}
