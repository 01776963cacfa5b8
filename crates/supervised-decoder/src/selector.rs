use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;

use decoding_core::{
    DecisionRecord, DecoderError, DecoderResult, ProbabilityTensor, TieBreakConfig, TieBreakMode,
    NO_SELECTION,
};

/// Picks the most likely candidate per row of a probability tensor.
#[derive(Debug, Clone, Default)]
pub struct DecisionSelector {
    config: TieBreakConfig,
}

impl DecisionSelector {
    pub fn new(config: TieBreakConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TieBreakConfig {
        &self.config
    }

    /// Select a winner per (model, trial, decision) row.
    ///
    /// Probabilities are perturbed with Gaussian noise (clipped to `[0, 1]`)
    /// before the arg-max, so exact ties do not always resolve to the lowest
    /// index. Only the first `n_real` candidates are real outputs: the trailing
    /// columns are stripped from the returned probabilities, and a row won by
    /// one of them reports [`NO_SELECTION`].
    pub fn select<R: Rng + ?Sized>(
        &self,
        probs: &ProbabilityTensor,
        n_real: usize,
        rng: &mut R,
    ) -> DecoderResult<DecisionRecord> {
        let [n_models, n_trials, n_decisions, n_candidates] = probs.shape();
        if n_real > n_candidates {
            return Err(DecoderError::shape("candidate", n_candidates, n_real));
        }

        let mut perturbed = probs.values().data().to_vec();
        match self.config.mode {
            TieBreakMode::PerCall => self.perturb(&mut perturbed, rng)?,
            TieBreakMode::SessionStable { seed } => {
                self.perturb(&mut perturbed, &mut StdRng::seed_from_u64(seed))?
            }
        }

        let n_rows = n_models * n_trials * n_decisions;
        let mut winners = Vec::with_capacity(n_rows);
        let mut maxima = Vec::with_capacity(n_rows);
        if n_candidates > 0 {
            for row in perturbed.chunks(n_candidates) {
                let (idx, p) = arg_max(row);
                winners.push(idx);
                maxima.push(p);
            }
        }

        let estimates = winners
            .iter()
            .map(|&y| if y < n_real { y as i64 } else { NO_SELECTION })
            .collect();
        let error_probabilities = maxima.iter().map(|p| 1.0 - p).collect();

        let offset = |m: usize, t: usize, d: usize| (m * n_trials + t) * n_decisions + d;

        let winning_model = (!probs.models_marginalized()).then(|| {
            let mut out = Vec::with_capacity(n_trials * n_decisions);
            for t in 0..n_trials {
                for d in 0..n_decisions {
                    let slice: Vec<f64> = (0..n_models).map(|m| maxima[offset(m, t, d)]).collect();
                    out.push(arg_max(&slice).0);
                }
            }
            out
        });

        let winning_decision = (!probs.decisions_marginalized()).then(|| {
            let mut out = Vec::with_capacity(n_models * n_trials);
            for m in 0..n_models {
                for t in 0..n_trials {
                    let slice: Vec<f64> = (0..n_decisions).map(|d| maxima[offset(m, t, d)]).collect();
                    out.push(arg_max(&slice).0);
                }
            }
            out
        });

        Ok(DecisionRecord {
            shape: [n_models, n_trials, n_decisions],
            estimates,
            error_probabilities,
            target_probabilities: Some(probs.truncate_candidates(n_real)),
            winning_model,
            winning_decision,
            decision_index: None,
        })
    }

    fn perturb<R: Rng + ?Sized>(&self, values: &mut [f64], rng: &mut R) -> DecoderResult<()> {
        if self.config.noise_scale <= 0.0 {
            return Ok(());
        }
        let noise = Normal::new(0.0, self.config.noise_scale)
            .map_err(|e| DecoderError::InvalidConfig(format!("tie_break.noise_scale: {e}")))?;
        for v in values.iter_mut() {
            *v = (*v + noise.sample(rng)).clamp(0.0, 1.0);
        }
        Ok(())
    }
}

/// Index and value of the largest entry; the first one wins exact ties.
fn arg_max(values: &[f64]) -> (usize, f64) {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, &v) in values.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use decoding_core::Tensor4;

    fn no_noise() -> DecisionSelector {
        DecisionSelector::new(TieBreakConfig {
            noise_scale: 0.0,
            mode: TieBreakMode::PerCall,
        })
    }

    fn probs(shape: [usize; 4], data: Vec<f64>, models: bool, decisions: bool) -> ProbabilityTensor {
        ProbabilityTensor::new(Tensor4::from_vec(shape, data).unwrap(), models, decisions)
    }

    #[test]
    fn test_picks_arg_max_and_error_probability() {
        let p = probs([1, 1, 2, 3], vec![0.2, 0.7, 0.1, 0.5, 0.1, 0.4], true, false);
        let record = no_noise()
            .select(&p, 3, &mut StdRng::seed_from_u64(0))
            .unwrap();

        assert_eq!(record.shape, [1, 1, 2]);
        assert_eq!(record.estimates, vec![1, 0]);
        assert_relative_eq!(record.error_probability(0, 0, 0), 0.3, epsilon = 1e-12);
        assert_relative_eq!(record.error_probability(0, 0, 1), 0.5, epsilon = 1e-12);
        assert!(record.winning_model.is_none());
        assert_eq!(record.winning_decision, Some(vec![0]));
    }

    #[test]
    fn test_exact_tie_without_noise_takes_first() {
        let p = probs([1, 1, 1, 2], vec![0.5, 0.5], true, true);
        let record = no_noise()
            .select(&p, 2, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(record.estimates, vec![0]);
    }

    #[test]
    fn test_noise_breaks_ties_both_ways() {
        let p = probs([1, 1, 1, 2], vec![0.5, 0.5], true, true);
        let selector = DecisionSelector::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 2];
        for _ in 0..200 {
            let record = selector.select(&p, 2, &mut rng).unwrap();
            counts[record.selected(0, 0, 0).unwrap()] += 1;
        }
        assert!(counts[0] > 50 && counts[1] > 50, "{counts:?}");
    }

    #[test]
    fn test_perturbed_probabilities_stay_in_unit_range() {
        let p = probs([1, 1, 1, 3], vec![1.0, 0.0, 0.0], true, true);
        let selector = DecisionSelector::new(TieBreakConfig {
            noise_scale: 0.5,
            mode: TieBreakMode::PerCall,
        });
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..50 {
            let record = selector.select(&p, 3, &mut rng).unwrap();
            let perr = record.error_probability(0, 0, 0);
            assert!((0.0..=1.0).contains(&perr));
        }
    }

    #[test]
    fn test_session_stable_noise_repeats() {
        let p = probs([1, 2, 1, 2], vec![0.5, 0.5, 0.5, 0.5], true, true);
        let selector = DecisionSelector::new(TieBreakConfig {
            noise_scale: 1e-3,
            mode: TieBreakMode::SessionStable { seed: 17 },
        });
        let mut rng = StdRng::seed_from_u64(1);
        let first = selector.select(&p, 2, &mut rng).unwrap();
        for _ in 0..5 {
            assert_eq!(selector.select(&p, 2, &mut rng).unwrap(), first);
        }
    }

    #[test]
    fn test_virtual_winner_is_stripped() {
        let p = probs([1, 1, 1, 4], vec![0.1, 0.1, 0.7, 0.1], true, true);
        let record = no_noise()
            .select(&p, 2, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(record.estimates, vec![NO_SELECTION]);
        assert_relative_eq!(record.error_probability(0, 0, 0), 0.3, epsilon = 1e-12);
        let target = record.target_probabilities.unwrap();
        assert_eq!(target.n_candidates(), 2);
        assert_eq!(target.row(0, 0, 0), &[0.1, 0.1]);
    }

    #[test]
    fn test_winning_model_and_decision() {
        // model 1 is more confident at decision 1
        let p = probs(
            [2, 1, 2, 2],
            vec![0.6, 0.4, 0.7, 0.3, 0.55, 0.45, 0.1, 0.9],
            false,
            false,
        );
        let record = no_noise()
            .select(&p, 2, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(record.estimates, vec![0, 0, 0, 1]);
        // per (trial, decision)
        assert_eq!(record.winning_model, Some(vec![0, 1]));
        // per (model, trial)
        assert_eq!(record.winning_decision, Some(vec![1, 1]));
    }

    #[test]
    fn test_n_real_larger_than_candidates() {
        let p = probs([1, 1, 1, 2], vec![0.5, 0.5], true, true);
        let err = no_noise()
            .select(&p, 3, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert_eq!(err, DecoderError::shape("candidate", 2, 3));
    }
}
