//! Decoding curve and error-probability calibration
//!
//! Scores a [`DecisionRecord`] against the known targets of a supervised
//! session: accuracy and mean error probability per decision point, and how
//! well `1 - Perr` predicts a correct selection.

use serde::{Deserialize, Serialize};

use decoding_core::{DecisionRecord, DecoderError, DecoderResult, NO_SELECTION};

const RELIABILITY_BINS: usize = 10;

/// Accuracy at one decision point, pooled over trials (and models when not marginalized).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Epochs accumulated at this decision point, when known.
    pub epochs: Option<usize>,
    pub accuracy: f64,
    pub mean_error_probability: f64,
    /// Fraction of cells where a virtual output won.
    pub abstain_rate: f64,
    pub count: usize,
}

/// A bin in the reliability diagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityBin {
    /// Average predicted probability of a correct selection
    pub avg_predicted: f64,
    /// Observed fraction of correct selections
    pub actual_rate: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    /// Expected Calibration Error (lower is better)
    pub ece: f64,
    /// Maximum Calibration Error
    pub mce: f64,
    /// Mean squared error of `1 - Perr` against correctness
    pub brier_score: f64,
    pub sample_size: usize,
    pub reliability_bins: Vec<ReliabilityBin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodingCurve {
    pub points: Vec<CurvePoint>,
    pub calibration: CalibrationStats,
}

impl DecodingCurve {
    /// Build the curve from a record and the true target of every trial.
    pub fn from_record(record: &DecisionRecord, targets: &[usize]) -> DecoderResult<Self> {
        let [n_models, n_trials, n_decisions] = record.shape;
        if targets.len() != n_trials {
            return Err(DecoderError::shape("trial", n_trials, targets.len()));
        }

        let epochs: Vec<Option<usize>> = match &record.decision_index {
            Some(index) if index.len() == n_decisions => {
                index.counts().iter().map(|&n| Some(n)).collect()
            }
            _ => vec![None; n_decisions],
        };

        let mut points = Vec::with_capacity(n_decisions);
        let mut predictions = Vec::with_capacity(n_models * n_trials * n_decisions);
        for (d, &epochs) in epochs.iter().enumerate() {
            let mut correct = 0usize;
            let mut abstained = 0usize;
            let mut perr_sum = 0.0;
            for m in 0..n_models {
                for (t, &target) in targets.iter().enumerate() {
                    let estimate = record.estimate(m, t, d);
                    let perr = record.error_probability(m, t, d);
                    let hit = estimate == target as i64;
                    correct += usize::from(hit);
                    abstained += usize::from(estimate == NO_SELECTION);
                    perr_sum += perr;
                    predictions.push((1.0 - perr, hit));
                }
            }
            let count = n_models * n_trials;
            let denom = count.max(1) as f64;
            points.push(CurvePoint {
                epochs,
                accuracy: correct as f64 / denom,
                mean_error_probability: perr_sum / denom,
                abstain_rate: abstained as f64 / denom,
                count,
            });
        }

        Ok(Self {
            points,
            calibration: calibration_stats(&predictions),
        })
    }

    /// First decision point whose accuracy reaches `accuracy`.
    pub fn epochs_to_accuracy(&self, accuracy: f64) -> Option<usize> {
        self.points
            .iter()
            .find(|p| p.accuracy >= accuracy)
            .and_then(|p| p.epochs)
    }
}

/// ECE, MCE, Brier score and reliability bins for `(predicted, outcome)` pairs.
pub fn calibration_stats(predictions: &[(f64, bool)]) -> CalibrationStats {
    let mut bins: Vec<Vec<(f64, bool)>> = vec![Vec::new(); RELIABILITY_BINS];
    for &(pred, outcome) in predictions {
        let bin_idx = ((pred * RELIABILITY_BINS as f64) as usize).min(RELIABILITY_BINS - 1);
        bins[bin_idx].push((pred, outcome));
    }

    let mut reliability_bins = Vec::new();
    let mut ece = 0.0;
    let mut mce: f64 = 0.0;
    let n = predictions.len() as f64;

    for bin in bins.iter().filter(|b| !b.is_empty()) {
        let avg_predicted = bin.iter().map(|(p, _)| p).sum::<f64>() / bin.len() as f64;
        let actual_rate = bin.iter().filter(|(_, o)| *o).count() as f64 / bin.len() as f64;
        let calibration_error = (avg_predicted - actual_rate).abs();

        ece += calibration_error * bin.len() as f64 / n;
        mce = mce.max(calibration_error);

        reliability_bins.push(ReliabilityBin {
            avg_predicted,
            actual_rate,
            count: bin.len(),
        });
    }

    let brier_score = if predictions.is_empty() {
        0.0
    } else {
        predictions
            .iter()
            .map(|&(pred, outcome)| (pred - if outcome { 1.0 } else { 0.0 }).powi(2))
            .sum::<f64>()
            / n
    };

    CalibrationStats {
        ece,
        mce,
        brier_score,
        sample_size: predictions.len(),
        reliability_bins,
    }
}
