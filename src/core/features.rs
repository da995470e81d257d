//! Feature computation from keystroke logs.
//!
//! A log of any length (including empty or partially malformed) becomes a
//! fixed-order vector of 27 timing statistics followed by the gender columns
//! of the configured encoding. Statistics that cannot be computed are 0.

use crate::keystroke::types::{Direction, Gender, Hand, KeystrokeEvent};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Numerical columns in the order the typing classifier was trained on.
pub const NUMERICAL_FEATURES: [&str; 27] = [
    "L_HoldTime_mean",
    "R_HoldTime_mean",
    "L_HoldTime_std",
    "R_HoldTime_std",
    "L_HoldTime_skew",
    "R_HoldTime_skew",
    "L_HoldTime_kurt",
    "R_HoldTime_kurt",
    "LL_LatencyTime_mean",
    "LR_LatencyTime_mean",
    "RL_LatencyTime_mean",
    "RR_LatencyTime_mean",
    "LL_LatencyTime_std",
    "LR_LatencyTime_std",
    "RL_LatencyTime_std",
    "RR_LatencyTime_std",
    "LL_LatencyTime_skew",
    "LR_LatencyTime_skew",
    "RL_LatencyTime_skew",
    "RR_LatencyTime_skew",
    "LL_LatencyTime_kurt",
    "LR_LatencyTime_kurt",
    "RL_LatencyTime_kurt",
    "RR_LatencyTime_kurt",
    "mean_diff_LR_RL_LatencyTime",
    "mean_diff_LL_RR_LatencyTime",
    "mean_diff_L_R_HoldTime",
];

/// Skewness needs more than two samples.
pub const SKEW_MIN_SAMPLES: usize = 3;

/// Kurtosis needs more than three samples.
pub const KURT_MIN_SAMPLES: usize = 4;

/// Second moments at or below `(MOMENT_RESOLUTION * mean)^2` count as zero variance.
const MOMENT_RESOLUTION: f64 = 1e-15;

/// How gender is presented to the classifier.
///
/// The two variants are not interchangeable: a classifier trained on one
/// will silently misread the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderEncoding {
    /// One `Gender` column holding "Male" or "Female"
    #[default]
    Label,
    /// `Gender_Female` and `Gender_Male` indicator columns
    Indicator,
}

impl GenderEncoding {
    /// Categorical columns appended after the numerical features.
    pub fn categorical_columns(&self) -> &'static [&'static str] {
        match self {
            GenderEncoding::Label => &["Gender"],
            GenderEncoding::Indicator => &["Gender_Female", "Gender_Male"],
        }
    }

    /// Full column order for this encoding.
    pub fn column_order(&self) -> Vec<&'static str> {
        NUMERICAL_FEATURES
            .iter()
            .chain(self.categorical_columns())
            .copied()
            .collect()
    }

    fn encode(&self, gender: Gender) -> Vec<FeatureValue> {
        match self {
            GenderEncoding::Label => vec![FeatureValue::Text(gender.as_str().to_string())],
            GenderEncoding::Indicator => {
                let indicator = |g: Gender| FeatureValue::Number(if gender == g { 1.0 } else { 0.0 });
                vec![indicator(Gender::Female), indicator(Gender::Male)]
            }
        }
    }
}

impl std::str::FromStr for GenderEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "label" => Ok(GenderEncoding::Label),
            "indicator" | "one_hot" | "onehot" => Ok(GenderEncoding::Indicator),
            other => Err(format!("unknown gender encoding '{other}' (expected label or indicator)")),
        }
    }
}

/// Value of a single feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            FeatureValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Text(s) => Some(s),
            FeatureValue::Number(_) => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Number(n) => write!(f, "{n}"),
            FeatureValue::Text(s) => f.write_str(s),
        }
    }
}

/// One named column of a feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: FeatureValue,
}

/// Fixed-order feature vector for the typing classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub encoding: GenderEncoding,
    pub features: Vec<Feature>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.features
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    /// Numeric value of a column, `None` if absent or textual.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FeatureValue::as_f64)
    }

    /// Check that columns are exactly those of `encoding`, in order.
    pub fn check_schema(&self, encoding: GenderEncoding) -> Result<(), SchemaMismatch> {
        let expected = encoding.column_order();
        let matches = self.encoding == encoding
            && self.features.len() == expected.len()
            && self.names().zip(expected.iter()).all(|(a, b)| a == *b);
        if matches {
            Ok(())
        } else {
            Err(SchemaMismatch {
                expected: expected.iter().map(|s| s.to_string()).collect(),
                found: self.names().map(str::to_string).collect(),
            })
        }
    }

    /// Pass the vector through only if it matches `encoding`.
    pub fn checked(self, encoding: GenderEncoding) -> Result<Self, SchemaMismatch> {
        self.check_schema(encoding)?;
        Ok(self)
    }

    /// Write a header record and one value record.
    pub fn write_csv_to<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(self.names())?;
        writer.write_record(self.features.iter().map(|f| f.value.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    /// Header and value row as CSV text.
    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let mut buf = Vec::new();
        self.write_csv_to(&mut buf)?;
        String::from_utf8(buf).map_err(|e| csv::Error::from(std::io::Error::other(e)))
    }

    /// Write the vector as a one-row CSV, replacing any previous dump.
    pub fn write_csv(&self, path: &Path) -> Result<(), csv::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.write_csv_to(std::fs::File::create(path)?)
    }
}

/// A feature vector whose columns differ from the expected schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMismatch {
    pub expected: Vec<String>,
    pub found: Vec<String>,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first_diff = self
            .expected
            .iter()
            .zip(self.found.iter())
            .position(|(a, b)| a != b);
        match first_diff {
            Some(i) => write!(
                f,
                "feature column {i} is '{}', expected '{}'",
                self.found[i], self.expected[i]
            ),
            None => write!(
                f,
                "expected {} feature columns, found {}",
                self.expected.len(),
                self.found.len()
            ),
        }
    }
}

impl std::error::Error for SchemaMismatch {}

/// Summary statistics of one group of timings.
///
/// Undefined values are NaN here; they become 0 when assembled into a
/// [`FeatureVector`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation (divisor n)
    pub std: f64,
    /// Biased sample skewness, 0 below [`SKEW_MIN_SAMPLES`]
    pub skew: f64,
    /// Biased excess kurtosis, 0 below [`KURT_MIN_SAMPLES`]
    pub kurt: f64,
}

impl GroupStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let count = samples.len();
        let mean = samples.iter().mean();
        let std = samples.iter().population_std_dev();
        let (skew, kurt) = standardized_moments(samples, mean);

        Self {
            count,
            mean,
            std,
            skew: if count >= SKEW_MIN_SAMPLES { skew } else { 0.0 },
            kurt: if count >= KURT_MIN_SAMPLES { kurt } else { 0.0 },
        }
    }

    /// Mean if the group had any samples, otherwise 0.
    fn mean_or_zero(&self) -> f64 {
        finite_or_zero(self.mean)
    }
}

/// Biased skewness and excess kurtosis; NaN for empty or zero-variance samples.
fn standardized_moments(samples: &[f64], mean: f64) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = samples.len() as f64;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for &x in samples {
        let d = x - mean;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
    }
    m2 /= n;
    m3 /= n;
    m4 /= n;

    if m2 <= (MOMENT_RESOLUTION * mean).powi(2) {
        return (f64::NAN, f64::NAN);
    }
    (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Turns keystroke logs into classifier input.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor {
    encoding: GenderEncoding,
}

impl FeatureExtractor {
    pub fn new(encoding: GenderEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> GenderEncoding {
        self.encoding
    }

    /// Compute the feature vector for one log.
    ///
    /// Events missing a field are left out of the groups that need it, and
    /// every statistic that cannot be computed is 0. The only error is an
    /// assembled vector whose columns differ from the encoding's order.
    pub fn extract(
        &self,
        log: &[KeystrokeEvent],
        gender: Gender,
    ) -> Result<FeatureVector, SchemaMismatch> {
        let mut computed: HashMap<String, f64> = HashMap::new();

        if log.is_empty() {
            tracing::debug!("empty keystroke log; numerical features set to zero");
        } else {
            self.compute_into(log, &mut computed);
        }

        let mut features: Vec<Feature> = NUMERICAL_FEATURES
            .iter()
            .map(|name| Feature {
                name: name.to_string(),
                value: FeatureValue::Number(finite_or_zero(
                    computed.get(*name).copied().unwrap_or(0.0),
                )),
            })
            .collect();

        features.extend(
            self.encoding
                .categorical_columns()
                .iter()
                .zip(self.encoding.encode(gender))
                .map(|(name, value)| Feature {
                    name: name.to_string(),
                    value,
                }),
        );

        FeatureVector {
            encoding: self.encoding,
            features,
        }
        .checked(self.encoding)
    }

    fn compute_into(&self, log: &[KeystrokeEvent], computed: &mut HashMap<String, f64>) {
        let mut hold: HashMap<Hand, Vec<f64>> = HashMap::new();
        let mut latency: HashMap<Direction, Vec<f64>> = HashMap::new();

        for event in log {
            if let Some((hand, value)) = event.valid_hold() {
                hold.entry(hand).or_default().push(value);
            }
            if let Some((direction, value)) = event.valid_latency() {
                latency.entry(direction).or_default().push(value);
            }
        }

        let hold_stats: HashMap<Hand, GroupStats> = Hand::ALL
            .iter()
            .map(|h| (*h, GroupStats::from_samples(hold.get(h).map_or(&[][..], Vec::as_slice))))
            .collect();
        let latency_stats: HashMap<Direction, GroupStats> = Direction::ALL
            .iter()
            .map(|d| {
                (*d, GroupStats::from_samples(latency.get(d).map_or(&[][..], Vec::as_slice)))
            })
            .collect();

        tracing::debug!(
            events = log.len(),
            hold_l = hold_stats[&Hand::L].count,
            hold_r = hold_stats[&Hand::R].count,
            latency_ll = latency_stats[&Direction::LL].count,
            latency_lr = latency_stats[&Direction::LR].count,
            latency_rl = latency_stats[&Direction::RL].count,
            latency_rr = latency_stats[&Direction::RR].count,
            "keystroke groups"
        );

        for (hand, stats) in &hold_stats {
            insert_group(computed, &format!("{}_HoldTime", hand.as_str()), stats);
        }
        for (direction, stats) in &latency_stats {
            insert_group(computed, &format!("{}_LatencyTime", direction.as_str()), stats);
        }

        let latency_mean = |d: Direction| latency_stats[&d].mean_or_zero();
        let hold_mean = |h: Hand| hold_stats[&h].mean_or_zero();

        computed.insert(
            "mean_diff_LR_RL_LatencyTime".to_string(),
            latency_mean(Direction::LR) - latency_mean(Direction::RL),
        );
        computed.insert(
            "mean_diff_LL_RR_LatencyTime".to_string(),
            latency_mean(Direction::LL) - latency_mean(Direction::RR),
        );
        computed.insert(
            "mean_diff_L_R_HoldTime".to_string(),
            hold_mean(Hand::L) - hold_mean(Hand::R),
        );
    }
}

fn insert_group(computed: &mut HashMap<String, f64>, prefix: &str, stats: &GroupStats) {
    computed.insert(format!("{prefix}_mean"), stats.mean);
    computed.insert(format!("{prefix}_std"), stats.std);
    computed.insert(format!("{prefix}_skew"), stats.skew);
    computed.insert(format!("{prefix}_kurt"), stats.kurt);
}
