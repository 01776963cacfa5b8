use serde::{Deserialize, Serialize};

use crate::tensor::ProbabilityTensor;

/// Estimate reserved for "no usable selection": a virtual output won, or no
/// scores were available yet.
pub const NO_SELECTION: i64 = -1;

/// Cumulative epoch counts at which a decision is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionIndex {
    counts: Vec<usize>,
}

impl DecisionIndex {
    /// Decision points for `n_epochs` gathered epochs.
    ///
    /// - `min_len > 0`: exponential spacing `min_len, 2*min_len, 4*min_len, ...`
    /// - `min_len < 0`: a decision every `|min_len|` epochs
    /// - `min_len == 0`: a decision after every epoch
    ///
    /// The span is capped at `max_len` when that is nonzero, and the last
    /// decision point always covers the full span.
    pub fn build(n_epochs: usize, min_len: i64, max_len: usize) -> Self {
        let span = if max_len > 0 { n_epochs.min(max_len) } else { n_epochs };
        if span == 0 {
            return Self { counts: Vec::new() };
        }

        let mut counts = Vec::new();
        match min_len {
            0 => counts.extend(1..=span),
            len if len > 0 => {
                let mut n = len as usize;
                while n < span {
                    counts.push(n);
                    n *= 2;
                }
                counts.push(span);
            }
            len => {
                let stride = len.unsigned_abs() as usize;
                let mut n = stride;
                while n < span {
                    counts.push(n);
                    n += stride;
                }
                counts.push(span);
            }
        }
        Self { counts }
    }

    pub fn from_counts(counts: Vec<usize>) -> Self {
        Self { counts }
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Output of one decoding cycle.
///
/// `estimates` and `error_probabilities` are laid out over
/// `shape = (model, trial, decision)`, where a marginalized axis has length 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub shape: [usize; 3],
    /// Most likely candidate per cell, or [`NO_SELECTION`].
    pub estimates: Vec<i64>,
    /// Probability that the estimate is wrong.
    pub error_probabilities: Vec<f64>,
    /// Target probabilities with virtual outputs stripped.
    pub target_probabilities: Option<ProbabilityTensor>,
    /// Per (trial, decision): the model whose row gave the largest probability.
    /// `None` when models were marginalized.
    pub winning_model: Option<Vec<usize>>,
    /// Per (model, trial): the decision point with the largest probability.
    /// `None` when decision points were marginalized.
    pub winning_decision: Option<Vec<usize>>,
    pub decision_index: Option<DecisionIndex>,
}

impl DecisionRecord {
    /// Record returned when no score tensor is available yet.
    pub fn missing_input() -> Self {
        Self {
            shape: [1, 1, 1],
            estimates: vec![NO_SELECTION],
            error_probabilities: vec![1.0],
            target_probabilities: None,
            winning_model: None,
            winning_decision: None,
            decision_index: None,
        }
    }

    pub fn is_missing_input(&self) -> bool {
        self.target_probabilities.is_none()
            && self.estimates == [NO_SELECTION]
            && self.error_probabilities == [1.0]
    }

    fn offset(&self, model: usize, trial: usize, decision: usize) -> usize {
        (model * self.shape[1] + trial) * self.shape[2] + decision
    }

    pub fn n_trials(&self) -> usize {
        self.shape[1]
    }

    pub fn n_decisions(&self) -> usize {
        self.shape[2]
    }

    pub fn estimate(&self, model: usize, trial: usize, decision: usize) -> i64 {
        self.estimates[self.offset(model, trial, decision)]
    }

    pub fn error_probability(&self, model: usize, trial: usize, decision: usize) -> f64 {
        self.error_probabilities[self.offset(model, trial, decision)]
    }

    /// The selected real candidate, if any.
    pub fn selected(&self, model: usize, trial: usize, decision: usize) -> Option<usize> {
        usize::try_from(self.estimate(model, trial, decision)).ok()
    }

    /// Estimate and error probability at the last decision point of a trial.
    pub fn latest(&self, model: usize, trial: usize) -> Option<(i64, f64)> {
        let d = self.shape[2].checked_sub(1)?;
        Some((self.estimate(model, trial, d), self.error_probability(model, trial, d)))
    }
}
