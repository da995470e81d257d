//! Classifier collaborators.
//!
//! Anything that maps an input to a positive-class probability can serve as
//! a classifier. [`LinearClassifier`] is the JSON-described logistic model
//! used for typing features.

use crate::core::features::{FeatureVector, GenderEncoding, SchemaMismatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Probability above which the positive label is predicted.
pub const DECISION_THRESHOLD: f64 = 0.5;

/// Label and probability for one input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: u8,
    pub probability: f64,
}

/// A binary classifier over inputs of type `I`.
pub trait Classifier<I: ?Sized>: Send + Sync {
    /// Probability of the positive class.
    fn predict_probability(&self, input: &I) -> Result<f64, ClassifierError>;

    /// Predicted label (1 for the positive class).
    fn predict(&self, input: &I) -> Result<u8, ClassifierError> {
        Ok(u8::from(self.predict_probability(input)? > DECISION_THRESHOLD))
    }
}

/// Run a classifier and collect label and probability.
pub fn classify<I, C>(classifier: &C, input: &I) -> Result<Prediction, ClassifierError>
where
    I: ?Sized,
    C: Classifier<I> + ?Sized,
{
    Ok(Prediction {
        prediction: classifier.predict(input)?,
        probability: classifier.predict_probability(input)?,
    })
}

/// Classifier errors.
#[derive(Debug)]
pub enum ClassifierError {
    /// Input columns differ from what the model was trained on
    SchemaMismatch(SchemaMismatch),
    /// Textual value with no numeric mapping in the model
    UnknownCategory { column: String, value: String },
    /// Model description is inconsistent
    InvalidModel(String),
    /// Model file could not be read
    Io(String),
    /// Forward pass failed
    Inference(String),
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifierError::SchemaMismatch(e) => write!(f, "Feature schema mismatch: {e}"),
            ClassifierError::UnknownCategory { column, value } => {
                write!(f, "Unknown category '{value}' for column '{column}'")
            }
            ClassifierError::InvalidModel(e) => write!(f, "Invalid model: {e}"),
            ClassifierError::Io(e) => write!(f, "IO error: {e}"),
            ClassifierError::Inference(e) => write!(f, "Inference error: {e}"),
        }
    }
}

impl std::error::Error for ClassifierError {}

impl From<SchemaMismatch> for ClassifierError {
    fn from(e: SchemaMismatch) -> Self {
        ClassifierError::SchemaMismatch(e)
    }
}

/// Standardize-then-logistic model over a typing feature vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearClassifier {
    /// Gender encoding the model was trained with
    pub encoding: GenderEncoding,
    /// Column order the weights refer to
    pub columns: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Numeric codes for textual columns (e.g. "Male" -> 1.0)
    #[serde(default)]
    pub categories: HashMap<String, f64>,
}

impl LinearClassifier {
    /// Load a model description from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ClassifierError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let model: LinearClassifier =
            serde_json::from_str(json).map_err(|e| ClassifierError::InvalidModel(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    /// Check that the parameter vectors agree with the encoding's column order.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        check_parameters(
            &self.columns,
            &self.encoding.column_order(),
            &self.means,
            &self.scales,
            &self.weights,
        )
    }

    fn numeric_row(&self, input: &FeatureVector) -> Result<Vec<f64>, ClassifierError> {
        input
            .features
            .iter()
            .map(|feature| match feature.value.as_f64() {
                Some(n) => Ok(n),
                None => {
                    let text = feature.value.to_string();
                    self.categories.get(&text).copied().ok_or_else(|| {
                        ClassifierError::UnknownCategory {
                            column: feature.name.clone(),
                            value: text,
                        }
                    })
                }
            })
            .collect()
    }
}

impl Classifier<FeatureVector> for LinearClassifier {
    fn predict_probability(&self, input: &FeatureVector) -> Result<f64, ClassifierError> {
        input.check_schema(self.encoding)?;
        let row = self.numeric_row(input)?;

        Ok(sigmoid(standardized_logit(
            &row,
            &self.means,
            &self.scales,
            &self.weights,
            self.bias,
        )))
    }
}

/// Check standardization and weight vectors against the expected columns.
pub(crate) fn check_parameters(
    columns: &[String],
    expected: &[&str],
    means: &[f64],
    scales: &[f64],
    weights: &[f64],
) -> Result<(), ClassifierError> {
    if columns.len() != expected.len() || columns.iter().zip(expected).any(|(a, b)| a != b) {
        return Err(ClassifierError::InvalidModel(
            "columns do not match the expected feature order".to_string(),
        ));
    }
    let n = columns.len();
    for (name, len) in [
        ("means", means.len()),
        ("scales", scales.len()),
        ("weights", weights.len()),
    ] {
        if len != n {
            return Err(ClassifierError::InvalidModel(format!(
                "{name} has {len} entries, expected {n}"
            )));
        }
    }
    if let Some(i) = scales.iter().position(|s| *s == 0.0 || !s.is_finite()) {
        return Err(ClassifierError::InvalidModel(format!(
            "scale for '{}' must be finite and non-zero",
            columns[i]
        )));
    }
    Ok(())
}

/// `bias + sum(w * (x - mean) / scale)`.
pub(crate) fn standardized_logit(
    row: &[f64],
    means: &[f64],
    scales: &[f64],
    weights: &[f64],
    bias: f64,
) -> f64 {
    row.iter()
        .zip(means)
        .zip(scales)
        .zip(weights)
        .fold(bias, |acc, (((x, mean), scale), w)| acc + w * (x - mean) / scale)
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::FeatureExtractor;
    use crate::keystroke::{Gender, Hand, KeystrokeEvent};

    fn model(encoding: GenderEncoding, weights: Vec<f64>, bias: f64) -> LinearClassifier {
        let columns: Vec<String> = encoding
            .column_order()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let n = columns.len();
        LinearClassifier {
            encoding,
            columns,
            means: vec![0.0; n],
            scales: vec![1.0; n],
            weights,
            bias,
            categories: HashMap::from([("Male".to_string(), 1.0), ("Female".to_string(), 0.0)]),
        }
    }

    #[test]
    fn test_bias_only_model() {
        let m = model(GenderEncoding::Label, vec![0.0; 28], 0.0);
        let fv = FeatureExtractor::new(GenderEncoding::Label).extract(&[], Gender::Male).unwrap();
        let p = classify(&m, &fv).unwrap();
        assert!((p.probability - 0.5).abs() < 1e-12);
        assert_eq!(p.prediction, 0);
    }

    #[test]
    fn test_weighted_hold_time() {
        let mut weights = vec![0.0; 29];
        weights[0] = 0.01; // L_HoldTime_mean
        let m = model(GenderEncoding::Indicator, weights, -1.0);
        let log = vec![KeystrokeEvent::new("a", Hand::L).with_hold_time(300.0)];
        let fv = FeatureExtractor::new(GenderEncoding::Indicator).extract(&log, Gender::Female).unwrap();
        let p = classify(&m, &fv).unwrap();
        assert!((p.probability - sigmoid(2.0)).abs() < 1e-12);
        assert_eq!(p.prediction, 1);
    }

    #[test]
    fn test_rejects_other_encoding() {
        let m = model(GenderEncoding::Indicator, vec![0.0; 29], 0.0);
        let fv = FeatureExtractor::new(GenderEncoding::Label).extract(&[], Gender::Male).unwrap();
        assert!(matches!(
            m.predict_probability(&fv),
            Err(ClassifierError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_category() {
        let mut m = model(GenderEncoding::Label, vec![0.0; 28], 0.0);
        m.categories.clear();
        let fv = FeatureExtractor::new(GenderEncoding::Label).extract(&[], Gender::Male).unwrap();
        assert!(matches!(
            m.predict(&fv),
            Err(ClassifierError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_json_validation() {
        let m = model(GenderEncoding::Label, vec![0.0; 28], 0.0);
        let json = serde_json::to_string(&m).unwrap();
        assert!(LinearClassifier::from_json(&json).is_ok());

        let mut short = m.clone();
        short.weights.pop();
        let json = serde_json::to_string(&short).unwrap();
        assert!(matches!(
            LinearClassifier::from_json(&json),
            Err(ClassifierError::InvalidModel(_))
        ));

        let mut zero_scale = m;
        zero_scale.scales[3] = 0.0;
        assert!(zero_scale.validate().is_err());
    }
}
