//! Score normalization
//!
//! Turns raw per-epoch matching scores into z-scores per decision point:
//! accumulate over a window of epochs, center across the valid candidates,
//! and divide by the noise scale of the accumulated score, inflated for
//! windows backed by few epochs.
//!
//! All statistics are kept as running sums in an [`EpochAccumulator`], one
//! per (model, trial). The batch normalizer and the streaming decoder feed the
//! same accumulator, so both produce bit-identical results for the same epochs.

use decoding_core::stats::{line_fit, median, RunningStats};
use decoding_core::{
    DecisionIndex, DecoderError, DecoderResult, NormalizerConfig, PriorSigma, ScoreTensor,
    Tensor4, ValidityMask,
};
use rayon::prelude::*;

/// Smallest variance used to scale an accumulated score.
const VARIANCE_FLOOR: f64 = 1e-12;

/// Outlier spread never drops below this fraction of the mean epoch energy.
const ENERGY_SPREAD_FLOOR: f64 = 0.25;

/// Scales a median absolute deviation to a Gaussian standard deviation.
const MAD_TO_STD: f64 = 1.4826;

/// Running sufficient statistics for one (model, trial) lane.
#[derive(Debug, Clone)]
pub struct EpochAccumulator {
    n_candidates: usize,
    outlier_threshold: f64,
    warmup: usize,
    /// Energy (L2 norm) of accepted active epochs.
    energy: RunningStats,
    /// Row `t` holds the per-candidate sum of epochs `0..t`; row 0 is zero.
    prefix_scores: Vec<f64>,
    /// Prefix sums of Σ_y f², (Σ_y f)², Σ_y f and t·Σ_y f.
    prefix_sq: Vec<f64>,
    prefix_sum_sq: Vec<f64>,
    prefix_sum: Vec<f64>,
    prefix_t_sum: Vec<f64>,
    valid: Vec<bool>,
    active_len: usize,
    n_clipped: usize,
    /// Raw scores of every epoch pushed before warm-up completed.
    warmup_epochs: Option<Vec<f64>>,
}

/// Standardized scores of one lane, (decision × candidate) plus per-decision variance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneScores {
    pub z: Vec<f64>,
    pub variance: Vec<f64>,
}

impl EpochAccumulator {
    pub fn new(n_candidates: usize, config: &NormalizerConfig) -> Self {
        Self {
            n_candidates,
            outlier_threshold: config.outlier_threshold,
            warmup: config.outlier_warmup_epochs,
            energy: RunningStats::new(),
            prefix_scores: vec![0.0; n_candidates],
            prefix_sq: vec![0.0],
            prefix_sum_sq: vec![0.0],
            prefix_sum: vec![0.0],
            prefix_t_sum: vec![0.0],
            valid: vec![false; n_candidates],
            active_len: 0,
            n_clipped: 0,
            warmup_epochs: (config.outlier_threshold > 0.0).then(Vec::new),
        }
    }

    /// Epochs pushed so far, including trailing all-zero ones.
    pub fn n_epochs(&self) -> usize {
        self.prefix_sq.len() - 1
    }

    /// One past the last epoch with any nonzero score.
    pub fn active_len(&self) -> usize {
        self.active_len
    }

    pub fn validity(&self) -> &[bool] {
        &self.valid
    }

    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Number of epochs scaled down as outliers.
    pub fn n_clipped(&self) -> usize {
        self.n_clipped
    }

    pub fn push_epoch(&mut self, scores: &[f64]) {
        debug_assert_eq!(scores.len(), self.n_candidates);
        let t = self.n_epochs();
        let active = scores.iter().any(|&v| v != 0.0);

        for (flag, &v) in self.valid.iter_mut().zip(scores) {
            *flag |= v != 0.0;
        }
        if active {
            self.active_len = t + 1;
        }

        if let Some(buffer) = self.warmup_epochs.as_mut() {
            buffer.extend_from_slice(scores);
            self.append_epoch(scores, 1.0);
            if self.energy.count() >= self.warmup.max(1) {
                self.settle_warmup();
            }
            return;
        }

        let energy = epoch_energy(scores);
        let mut weight = 1.0;
        if active && self.outlier_threshold > 0.0 {
            let spread = self
                .energy
                .std_dev()
                .max(ENERGY_SPREAD_FLOOR * self.energy.mean());
            let limit = self.energy.mean() + self.outlier_threshold * spread;
            if energy > limit {
                weight = limit / energy;
                self.n_clipped += 1;
                tracing::debug!(epoch = t, energy, limit, "Clipping outlier epoch");
            }
        }
        self.append_epoch(scores, weight);
    }

    /// Clip the buffered warm-up epochs against a median/MAD bound and
    /// rebuild the prefix rows from them.
    fn settle_warmup(&mut self) {
        let Some(buffer) = self.warmup_epochs.take() else {
            return;
        };

        let mut energies: Vec<f64> = buffer
            .chunks(self.n_candidates)
            .map(epoch_energy)
            .filter(|&e| e > 0.0)
            .collect();
        let center = median(&mut energies);
        let mut deviations: Vec<f64> = energies.iter().map(|e| (e - center).abs()).collect();
        let spread = (MAD_TO_STD * median(&mut deviations)).max(ENERGY_SPREAD_FLOOR * center);
        let limit = center + self.outlier_threshold * spread;

        self.energy = RunningStats::new();
        self.prefix_scores.truncate(self.n_candidates);
        for prefix in [
            &mut self.prefix_sq,
            &mut self.prefix_sum_sq,
            &mut self.prefix_sum,
            &mut self.prefix_t_sum,
        ] {
            prefix.truncate(1);
        }

        for (t, epoch) in buffer.chunks(self.n_candidates).enumerate() {
            let energy = epoch_energy(epoch);
            let mut weight = 1.0;
            if energy > limit {
                weight = limit / energy;
                self.n_clipped += 1;
                tracing::debug!(epoch = t, energy, limit, "Clipping outlier warm-up epoch");
            }
            self.append_epoch(epoch, weight);
        }
    }

    /// Append one epoch scaled by `weight` to the prefix rows.
    fn append_epoch(&mut self, scores: &[f64], weight: f64) {
        let t = self.n_epochs();
        let energy = epoch_energy(scores);
        if energy > 0.0 {
            self.energy.push(energy * weight);
        }

        let base = t * self.n_candidates;
        let mut sum = 0.0;
        let mut sq = 0.0;
        for (y, &v) in scores.iter().enumerate() {
            let g = v * weight;
            let prev = self.prefix_scores[base + y];
            self.prefix_scores.push(prev + g);
            sum += g;
            sq += g * g;
        }
        self.prefix_sq.push(self.prefix_sq[t] + sq);
        self.prefix_sum_sq.push(self.prefix_sum_sq[t] + sum * sum);
        self.prefix_sum.push(self.prefix_sum[t] + sum);
        self.prefix_t_sum.push(self.prefix_t_sum[t] + t as f64 * sum);
    }

    /// Z-scores at each decision point over the first `n_epochs` epochs.
    pub fn standardize(
        &self,
        n_epochs: usize,
        index: &DecisionIndex,
        config: &NormalizerConfig,
    ) -> LaneScores {
        let n_epochs = n_epochs.min(self.n_epochs());
        let ny = self.n_candidates;
        let n_valid = self.n_valid();
        let mut z = Vec::with_capacity(index.len() * ny);
        let mut variance = Vec::with_capacity(index.len());

        // common-mode drift fitted over the whole recording
        let drift = if config.detrend && n_valid > 0 {
            Some(line_fit(
                n_epochs,
                self.prefix_sum[n_epochs],
                self.prefix_t_sum[n_epochs],
            ))
        } else {
            None
        };

        for &count in index.counts() {
            let count = count.min(n_epochs);
            let (start, end) = if config.backward_accumulate {
                (n_epochs - count, n_epochs)
            } else {
                (0, count)
            };

            let mut acc: Vec<f64> = (0..ny)
                .map(|y| self.prefix_scores[end * ny + y] - self.prefix_scores[start * ny + y])
                .collect();

            if let Some((slope, intercept)) = drift {
                let sum_t = (end * end.saturating_sub(1) - start * start.saturating_sub(1)) as f64 / 2.0;
                let offset = (slope * sum_t + intercept * (end - start) as f64) / n_valid as f64;
                for (v, &ok) in acc.iter_mut().zip(&self.valid) {
                    if ok {
                        *v -= offset;
                    }
                }
            }

            if config.center && n_valid > 0 {
                let mu = acc
                    .iter()
                    .zip(&self.valid)
                    .filter(|(_, &ok)| ok)
                    .map(|(v, _)| v)
                    .sum::<f64>()
                    / n_valid as f64;
                for (v, &ok) in acc.iter_mut().zip(&self.valid) {
                    if ok {
                        *v -= mu;
                    }
                }
            }

            let window = (end - start).max(1) as f64;
            let var = self.window_variance(start, end, n_valid, window, config.prior_sigma);
            let scale = var.sqrt() * (1.0 + config.epoch_correction / window);
            z.extend(
                acc.iter()
                    .zip(&self.valid)
                    .map(|(v, &ok)| if ok { v / scale } else { 0.0 }),
            );
            variance.push(var);
        }

        LaneScores { z, variance }
    }

    /// Variance of one candidate's accumulated score over epochs `[start, end)`.
    fn window_variance(
        &self,
        start: usize,
        end: usize,
        n_valid: usize,
        window: f64,
        prior: Option<PriorSigma>,
    ) -> f64 {
        let observed = if n_valid >= 2 {
            let sq = self.prefix_sq[end] - self.prefix_sq[start];
            let sum_sq = self.prefix_sum_sq[end] - self.prefix_sum_sq[start];
            ((sq - sum_sq / n_valid as f64) / (n_valid - 1) as f64).max(0.0)
        } else {
            window
        };
        let var = match prior {
            Some(p) => (observed + p.sigma2 * p.pseudo_epochs) / (window + p.pseudo_epochs) * window,
            None => observed,
        };
        var.max(VARIANCE_FLOOR)
    }
}

/// L2 norm of one epoch's scores.
fn epoch_energy(scores: &[f64]) -> f64 {
    scores.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Output of [`ScoreNormalizer::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedScores {
    /// Axes (model, trial, decision, candidate).
    pub z: Tensor4,
    /// Variance of the accumulated score, axes (model, trial, decision).
    pub variance: Vec<f64>,
    pub decision_index: DecisionIndex,
    pub n_epochs: usize,
    pub n_candidates: usize,
    pub validity: ValidityMask,
}

impl NormalizedScores {
    pub fn variance(&self, model: usize, trial: usize, decision: usize) -> f64 {
        let [_, n_trials, n_decisions, _] = self.z.shape();
        self.variance[(model * n_trials + trial) * n_decisions + decision]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoreNormalizer {
    config: NormalizerConfig,
}

impl ScoreNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn decision_index(&self, n_epochs: usize) -> DecisionIndex {
        DecisionIndex::build(
            n_epochs,
            self.config.min_decision_len,
            self.config.max_decision_len,
        )
    }

    /// Fresh accumulators for `n_lanes` (model, trial) lanes.
    pub fn lanes(&self, n_lanes: usize, n_candidates: usize) -> Vec<EpochAccumulator> {
        (0..n_lanes)
            .map(|_| EpochAccumulator::new(n_candidates, &self.config))
            .collect()
    }

    /// Feed every epoch of `scores` into `lanes`, in epoch order.
    pub fn accumulate(
        &self,
        lanes: &mut [EpochAccumulator],
        scores: &ScoreTensor,
    ) -> DecoderResult<()> {
        let [n_models, n_trials, n_epochs, n_candidates] = scores.shape();
        if lanes.len() != n_models * n_trials {
            return Err(DecoderError::shape("trial", lanes.len(), n_models * n_trials));
        }
        if let Some(lane) = lanes.first() {
            if lane.n_candidates != n_candidates {
                return Err(DecoderError::shape("candidate", lane.n_candidates, n_candidates));
            }
        }

        lanes.par_iter_mut().enumerate().for_each(|(i, lane)| {
            let (m, t) = (i / n_trials, i % n_trials);
            for e in 0..n_epochs {
                lane.push_epoch(scores.epoch(m, t, e));
            }
        });
        Ok(())
    }

    pub fn normalize(&self, scores: &ScoreTensor) -> DecoderResult<NormalizedScores> {
        let mut lanes = self.lanes(scores.n_models() * scores.n_trials(), scores.n_candidates());
        self.accumulate(&mut lanes, scores)?;
        self.standardize(scores.n_models(), scores.n_trials(), scores.n_candidates(), &lanes)
    }

    /// Z-scores for every lane at the decision points of the epochs seen so far.
    pub fn standardize(
        &self,
        n_models: usize,
        n_trials: usize,
        n_candidates: usize,
        lanes: &[EpochAccumulator],
    ) -> DecoderResult<NormalizedScores> {
        if lanes.len() != n_models * n_trials {
            return Err(DecoderError::shape("trial", n_models * n_trials, lanes.len()));
        }

        let n_epochs = lanes.iter().map(|l| l.active_len()).max().unwrap_or(0);
        let decision_index = self.decision_index(n_epochs);

        for (i, lane) in lanes.iter().enumerate() {
            if n_epochs > 0 && lane.n_valid() == 0 {
                tracing::warn!(
                    model = i / n_trials.max(1),
                    trial = i % n_trials.max(1),
                    "No valid candidates in trial, probabilities will be uniform"
                );
            }
        }

        let per_lane: Vec<LaneScores> = lanes
            .par_iter()
            .map(|lane| lane.standardize(n_epochs, &decision_index, &self.config))
            .collect();

        let mut z = Vec::with_capacity(lanes.len() * decision_index.len() * n_candidates);
        let mut variance = Vec::with_capacity(lanes.len() * decision_index.len());
        for lane in per_lane {
            z.extend(lane.z);
            variance.extend(lane.variance);
        }
        let z = Tensor4::from_vec([n_models, n_trials, decision_index.len(), n_candidates], z)?;

        let validity = ValidityMask::from_rows(
            n_models,
            n_trials,
            lanes.iter().map(|l| l.validity().to_vec()).collect(),
        )?;

        let clipped: usize = lanes.iter().map(|l| l.n_clipped()).sum();
        tracing::debug!(
            n_epochs,
            n_decisions = decision_index.len(),
            clipped,
            "Normalized output scores"
        );

        Ok(NormalizedScores {
            z,
            variance,
            decision_index,
            n_epochs,
            n_candidates,
            validity,
        })
    }
}
