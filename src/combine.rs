//! Majority vote over the per-modality predictions.

use crate::classifier::Prediction;
use serde::{Deserialize, Serialize};

/// Fewest results a vote is taken over.
pub const MIN_VOTES: usize = 2;

/// Outcome of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteStatus {
    /// A strict majority exists
    Ok,
    /// As many positive as negative votes
    Tie,
    /// Fewer than [`MIN_VOTES`] results were available
    Inconclusive,
}

/// Combined label with the averaged probability of the winning side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedPrediction {
    pub status: VoteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    /// Results that took part in the vote
    pub votes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CombinedPrediction {
    fn undecided(status: VoteStatus, votes: usize, message: &str) -> Self {
        Self {
            status,
            prediction: None,
            probability: None,
            votes,
            message: Some(message.to_string()),
        }
    }
}

/// Vote over the available results; `None` entries did not run or failed.
///
/// The label with more votes wins and its probability is the mean over the
/// results that voted for it. A non-finite probability counts as 0.
pub fn combine(results: &[Option<Prediction>]) -> CombinedPrediction {
    let votes: Vec<&Prediction> = results.iter().flatten().collect();
    if votes.len() < MIN_VOTES {
        return CombinedPrediction::undecided(
            VoteStatus::Inconclusive,
            votes.len(),
            "Need at least two model results for a majority vote",
        );
    }

    let (ones, zeros): (Vec<&Prediction>, Vec<&Prediction>) = votes
        .iter()
        .copied()
        .filter(|p| p.prediction <= 1)
        .partition(|p| p.prediction == 1);
    if ones.len() == zeros.len() {
        return CombinedPrediction::undecided(
            VoteStatus::Tie,
            votes.len(),
            "Tie between classes; add another model or retry",
        );
    }

    let (label, group) = if ones.len() > zeros.len() {
        (1, ones)
    } else {
        (0, zeros)
    };
    let total: f64 = group
        .iter()
        .map(|p| if p.probability.is_finite() { p.probability } else { 0.0 })
        .sum();

    CombinedPrediction {
        status: VoteStatus::Ok,
        prediction: Some(label),
        probability: Some(total / group.len() as f64),
        votes: votes.len(),
        message: None,
    }
}
