use rayon::prelude::*;

use decoding_core::{
    DecoderConfig, DecoderError, DecoderResult, Prior, ProbabilityTensor, Tensor4, ValidityMask,
};

/// Softmax over scaled z-scores plus optional log prior, per
/// (model, trial, decision) row, with optional averaging over models and
/// decision points.
#[derive(Debug, Clone)]
pub struct ProbabilityModel {
    scale: f64,
    marginalize_models: bool,
    marginalize_decisions: bool,
    prior: Option<Prior>,
}

impl ProbabilityModel {
    pub fn new(
        scale: f64,
        marginalize_models: bool,
        marginalize_decisions: bool,
        prior: Option<Prior>,
    ) -> Self {
        Self {
            scale,
            marginalize_models,
            marginalize_decisions,
            prior,
        }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(
            config.softmax_scale,
            config.marginalize_models,
            config.marginalize_decisions,
            config.prior.clone(),
        )
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Log prior for `n_candidates` columns, of which the first `n_real` are
    /// real outputs. Virtual columns get the mean finite real offset.
    pub fn prior_logits(&self, n_candidates: usize, n_real: usize) -> DecoderResult<Vec<f64>> {
        let Some(prior) = &self.prior else {
            return Ok(vec![0.0; n_candidates]);
        };
        if prior.len() != n_real {
            return Err(DecoderError::shape("candidate", n_real, prior.len()));
        }

        let mut logits = prior.log_offsets();
        let finite: Vec<f64> = logits.iter().copied().filter(|v| v.is_finite()).collect();
        let fill = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };
        logits.resize(n_candidates, fill);
        Ok(logits)
    }

    /// Target probabilities from z-scores shaped (model, trial, decision, candidate).
    pub fn probabilities(
        &self,
        z: &Tensor4,
        validity: &ValidityMask,
        n_real: usize,
    ) -> DecoderResult<ProbabilityTensor> {
        let [n_models, n_trials, n_decisions, n_candidates] = z.shape();
        let [v_models, v_trials, v_candidates] = validity.shape();
        if v_models != n_models {
            return Err(DecoderError::shape("model", n_models, v_models));
        }
        if v_trials != n_trials {
            return Err(DecoderError::shape("trial", n_trials, v_trials));
        }
        if v_candidates != n_candidates {
            return Err(DecoderError::shape("candidate", n_candidates, v_candidates));
        }

        let prior = self.prior_logits(n_candidates, n_real)?;
        let mut probs = z.data().to_vec();
        if n_candidates > 0 {
            probs
                .par_chunks_mut(n_candidates)
                .enumerate()
                .for_each(|(row, values)| {
                    let lane = row / n_decisions.max(1);
                    let (m, t) = (lane / n_trials, lane % n_trials);
                    self.softmax_row(values, validity.row(m, t), &prior);
                });
        }
        let mut values = Tensor4::from_vec(z.shape(), probs)?;

        if self.marginalize_models {
            values = mean_over_axis(&values, Axis::Model);
        }
        if self.marginalize_decisions {
            values = mean_over_axis(&values, Axis::Decision);
        }

        Ok(ProbabilityTensor::new(
            values,
            self.marginalize_models,
            self.marginalize_decisions,
        ))
    }

    /// Replace `values` (z-scores) with their probabilities in place.
    fn softmax_row(&self, values: &mut [f64], valid: &[bool], prior: &[f64]) {
        for ((v, &ok), &p) in values.iter_mut().zip(valid).zip(prior) {
            *v = if ok { self.scale * *v + p } else { f64::NEG_INFINITY };
        }

        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max == f64::NEG_INFINITY {
            let uniform = 1.0 / values.len() as f64;
            values.iter_mut().for_each(|v| *v = uniform);
            return;
        }

        let mut total = 0.0;
        for v in values.iter_mut() {
            *v = (*v - max).exp();
            total += *v;
        }
        for v in values.iter_mut() {
            *v /= total;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Model,
    Decision,
}

/// Equal-weight mean over one axis, which is kept with length 1.
fn mean_over_axis(values: &Tensor4, axis: Axis) -> Tensor4 {
    let [n_models, n_trials, n_decisions, n_candidates] = values.shape();
    let (len, shape) = match axis {
        Axis::Model => (n_models, [1, n_trials, n_decisions, n_candidates]),
        Axis::Decision => (n_decisions, [n_models, n_trials, 1, n_candidates]),
    };
    if len == 0 {
        return values.clone();
    }

    let mut out = Tensor4::zeros(shape);
    for m in 0..n_models {
        for t in 0..n_trials {
            for d in 0..n_decisions {
                let (om, od) = match axis {
                    Axis::Model => (0, d),
                    Axis::Decision => (m, 0),
                };
                let row = values.lane(m, t, d);
                for (acc, v) in out.lane_mut(om, t, od).iter_mut().zip(row) {
                    *acc += v / len as f64;
                }
            }
        }
    }
    out
}
