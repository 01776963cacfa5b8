//! Dense row-major tensors used along the decoding pipeline.
//!
//! The innermost axis is always the candidate axis, so every "row" handed out
//! by these types is the vector of per-candidate values for one
//! (model, trial, epoch|decision) cell.

use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, DecoderResult};

/// Four-axis `f64` tensor, last axis contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor4 {
    shape: [usize; 4],
    data: Vec<f64>,
}

impl Tensor4 {
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn from_vec(shape: [usize; 4], data: Vec<f64>) -> DecoderResult<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DecoderError::shape("element", expected, data.len()));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn offset(&self, idx: [usize; 4]) -> usize {
        ((idx[0] * self.shape[1] + idx[1]) * self.shape[2] + idx[2]) * self.shape[3] + idx[3]
    }

    pub fn get(&self, idx: [usize; 4]) -> f64 {
        self.data[self.offset(idx)]
    }

    pub fn set(&mut self, idx: [usize; 4], value: f64) {
        let off = self.offset(idx);
        self.data[off] = value;
    }

    /// Values along the last axis for one cell of the three leading axes.
    pub fn lane(&self, a: usize, b: usize, c: usize) -> &[f64] {
        let start = self.offset([a, b, c, 0]);
        &self.data[start..start + self.shape[3]]
    }

    pub fn lane_mut(&mut self, a: usize, b: usize, c: usize) -> &mut [f64] {
        let start = self.offset([a, b, c, 0]);
        let len = self.shape[3];
        &mut self.data[start..start + len]
    }
}

/// Raw matching scores, axes (model, trial, epoch, candidate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTensor {
    values: Tensor4,
}

impl ScoreTensor {
    pub fn zeros(n_models: usize, n_trials: usize, n_epochs: usize, n_candidates: usize) -> Self {
        Self {
            values: Tensor4::zeros([n_models, n_trials, n_epochs, n_candidates]),
        }
    }

    pub fn from_vec(shape: [usize; 4], data: Vec<f64>) -> DecoderResult<Self> {
        Ok(Self {
            values: Tensor4::from_vec(shape, data)?,
        })
    }

    /// Build a tensor by evaluating `f(model, trial, epoch, candidate)` for every cell.
    pub fn from_fn<F>(shape: [usize; 4], mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize, usize) -> f64,
    {
        let mut values = Tensor4::zeros(shape);
        for m in 0..shape[0] {
            for t in 0..shape[1] {
                for e in 0..shape[2] {
                    for (y, v) in values.lane_mut(m, t, e).iter_mut().enumerate() {
                        *v = f(m, t, e, y);
                    }
                }
            }
        }
        Self { values }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.values.shape()
    }

    pub fn n_models(&self) -> usize {
        self.values.shape()[0]
    }

    pub fn n_trials(&self) -> usize {
        self.values.shape()[1]
    }

    pub fn n_epochs(&self) -> usize {
        self.values.shape()[2]
    }

    pub fn n_candidates(&self) -> usize {
        self.values.shape()[3]
    }

    pub fn get(&self, model: usize, trial: usize, epoch: usize, candidate: usize) -> f64 {
        self.values.get([model, trial, epoch, candidate])
    }

    pub fn set(&mut self, model: usize, trial: usize, epoch: usize, candidate: usize, value: f64) {
        self.values.set([model, trial, epoch, candidate], value);
    }

    /// Per-candidate scores of one epoch.
    pub fn epoch(&self, model: usize, trial: usize, epoch: usize) -> &[f64] {
        self.values.lane(model, trial, epoch)
    }

    pub fn epoch_mut(&mut self, model: usize, trial: usize, epoch: usize) -> &mut [f64] {
        self.values.lane_mut(model, trial, epoch)
    }

    pub fn values(&self) -> &Tensor4 {
        &self.values
    }

    /// Validity of every (model, trial, candidate): true iff any epoch is nonzero.
    pub fn validity(&self) -> ValidityMask {
        let [n_models, n_trials, n_epochs, n_candidates] = self.shape();
        let mut data = vec![false; n_models * n_trials * n_candidates];
        for m in 0..n_models {
            for t in 0..n_trials {
                let row = &mut data[(m * n_trials + t) * n_candidates..][..n_candidates];
                for e in 0..n_epochs {
                    for (flag, &v) in row.iter_mut().zip(self.epoch(m, t, e)) {
                        *flag |= v != 0.0;
                    }
                }
            }
        }
        ValidityMask {
            shape: [n_models, n_trials, n_candidates],
            data,
        }
    }

    /// Active length of one trial, taken over every model and candidate.
    pub fn trial_active_epochs(&self, trial: usize) -> usize {
        (0..self.n_epochs())
            .rev()
            .find(|&e| {
                (0..self.n_models()).any(|m| self.epoch(m, trial, e).iter().any(|&v| v != 0.0))
            })
            .map(|e| e + 1)
            .unwrap_or(0)
    }

    /// Copy of this tensor with `extra` all-zero candidate columns appended.
    pub fn with_extra_candidates(&self, extra: usize) -> ScoreTensor {
        let [n_models, n_trials, n_epochs, n_candidates] = self.shape();
        let mut out = ScoreTensor::zeros(n_models, n_trials, n_epochs, n_candidates + extra);
        for m in 0..n_models {
            for t in 0..n_trials {
                for e in 0..n_epochs {
                    out.epoch_mut(m, t, e)[..n_candidates].copy_from_slice(self.epoch(m, t, e));
                }
            }
        }
        out
    }

    /// Epochs `[start, end)` as a new tensor, e.g. one streaming block.
    pub fn epoch_range(&self, start: usize, end: usize) -> ScoreTensor {
        let [n_models, n_trials, n_epochs, n_candidates] = self.shape();
        let end = end.min(n_epochs);
        let start = start.min(end);
        let mut out = ScoreTensor::zeros(n_models, n_trials, end - start, n_candidates);
        for m in 0..n_models {
            for t in 0..n_trials {
                for e in start..end {
                    out.epoch_mut(m, t, e - start).copy_from_slice(self.epoch(m, t, e));
                }
            }
        }
        out
    }

    /// Zero one candidate column in every model, trial and epoch.
    pub fn clear_candidate(&mut self, candidate: usize) {
        let [n_models, n_trials, n_epochs, _] = self.shape();
        for m in 0..n_models {
            for t in 0..n_trials {
                for e in 0..n_epochs {
                    self.epoch_mut(m, t, e)[candidate] = 0.0;
                }
            }
        }
    }
}

/// Which candidates carry any data, axes (model, trial, candidate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMask {
    shape: [usize; 3],
    data: Vec<bool>,
}

impl ValidityMask {
    /// Assemble a mask from per-(model, trial) rows in model-major order.
    pub fn from_rows(n_models: usize, n_trials: usize, rows: Vec<Vec<bool>>) -> DecoderResult<Self> {
        if rows.len() != n_models * n_trials {
            return Err(DecoderError::shape("trial", n_models * n_trials, rows.len()));
        }
        let n_candidates = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * n_candidates);
        for row in rows {
            if row.len() != n_candidates {
                return Err(DecoderError::shape("candidate", n_candidates, row.len()));
            }
            data.extend(row);
        }
        Ok(Self {
            shape: [n_models, n_trials, n_candidates],
            data,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn row(&self, model: usize, trial: usize) -> &[bool] {
        let n = self.shape[2];
        let start = (model * self.shape[1] + trial) * n;
        &self.data[start..start + n]
    }
}

/// Target probabilities, axes (model, trial, decision, candidate).
///
/// A marginalized axis is kept with length 1 and flagged, so consumers can
/// tell "one model" apart from "all models blended".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityTensor {
    values: Tensor4,
    models_marginalized: bool,
    decisions_marginalized: bool,
}

impl ProbabilityTensor {
    pub fn new(values: Tensor4, models_marginalized: bool, decisions_marginalized: bool) -> Self {
        Self {
            values,
            models_marginalized,
            decisions_marginalized,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.values.shape()
    }

    pub fn n_candidates(&self) -> usize {
        self.values.shape()[3]
    }

    pub fn values(&self) -> &Tensor4 {
        &self.values
    }

    pub fn row(&self, model: usize, trial: usize, decision: usize) -> &[f64] {
        self.values.lane(model, trial, decision)
    }

    pub fn models_marginalized(&self) -> bool {
        self.models_marginalized
    }

    pub fn decisions_marginalized(&self) -> bool {
        self.decisions_marginalized
    }

    /// Keep only the first `n` candidates of every row.
    pub fn truncate_candidates(&self, n: usize) -> ProbabilityTensor {
        let [a, b, c, d] = self.shape();
        let n = n.min(d);
        let mut values = Tensor4::zeros([a, b, c, n]);
        for i in 0..a {
            for j in 0..b {
                for k in 0..c {
                    values
                        .lane_mut(i, j, k)
                        .copy_from_slice(&self.values.lane(i, j, k)[..n]);
                }
            }
        }
        ProbabilityTensor::new(values, self.models_marginalized, self.decisions_marginalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl ValidityMask {
        // Test-only helper; the public `n_valid` accessor was removed.
        fn n_valid(&self, model: usize, trial: usize) -> usize {
            self.row(model, trial).iter().filter(|&&v| v).count()
        }
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let err = Tensor4::from_vec([1, 2, 3, 4], vec![0.0; 23]).unwrap_err();
        assert_eq!(err, DecoderError::shape("element", 24, 23));
    }

    #[test]
    fn test_validity_requires_nonzero_epoch() {
        let mut scores = ScoreTensor::zeros(1, 2, 4, 3);
        scores.set(0, 0, 2, 1, 0.5);
        scores.set(0, 1, 0, 0, -1.0);
        scores.set(0, 1, 3, 2, 1e-9);

        let valid = scores.validity();
        assert_eq!(valid.row(0, 0), &[false, true, false]);
        assert_eq!(valid.row(0, 1), &[true, false, true]);
        assert_eq!(valid.n_valid(0, 1), 2);
    }

    #[test]
    fn test_active_epochs_ignores_trailing_zeros() {
        let mut scores = ScoreTensor::zeros(2, 2, 10, 3);
        scores.set(1, 0, 6, 2, 1.0);
        scores.set(0, 1, 3, 0, 1.0);

        assert_eq!(scores.trial_active_epochs(0), 7);
        assert_eq!(scores.trial_active_epochs(1), 4);
        assert_eq!(ScoreTensor::zeros(1, 1, 5, 2).trial_active_epochs(0), 0);
    }

    #[test]
    fn test_extra_candidates_and_epoch_range() {
        let scores = ScoreTensor::from_fn([1, 1, 4, 2], |_, _, e, y| (e * 10 + y) as f64);
        let wide = scores.with_extra_candidates(2);
        assert_eq!(wide.shape(), [1, 1, 4, 4]);
        assert_eq!(wide.epoch(0, 0, 3), &[30.0, 31.0, 0.0, 0.0]);

        let block = scores.epoch_range(1, 3);
        assert_eq!(block.n_epochs(), 2);
        assert_eq!(block.epoch(0, 0, 0), &[10.0, 11.0]);
    }

    #[test]
    fn test_truncate_keeps_flags() {
        let values = Tensor4::from_vec([1, 1, 1, 3], vec![0.2, 0.3, 0.5]).unwrap();
        let probs = ProbabilityTensor::new(values, true, false);
        let cut = probs.truncate_candidates(2);
        assert_eq!(cut.row(0, 0, 0), &[0.2, 0.3]);
        assert!(cut.models_marginalized());
        assert!(!cut.decisions_marginalized());
    }
}
