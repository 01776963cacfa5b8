//! Synthetic supervised sessions with deterministic seeding

use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use decoding_core::{DecoderError, DecoderResult, ScoreTensor};

/// Shape and signal level of a simulated recording.
///
/// Every candidate scores Gaussian noise each epoch; the trial's target
/// candidate additionally carries `signal_mean`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticConfig {
    pub n_models: usize,
    pub n_trials: usize,
    pub n_epochs: usize,
    pub n_candidates: usize,
    /// Fixed target for every trial; `None` draws one per trial.
    pub target: Option<usize>,
    pub signal_mean: f64,
    pub noise_std: f64,
    /// Candidates left all-zero, i.e. without data.
    pub invalid_candidates: Vec<usize>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            n_models: 1,
            n_trials: 1,
            n_epochs: 100,
            n_candidates: 5,
            target: Some(2),
            signal_mean: 0.4,
            noise_std: 1.0,
            invalid_candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSession {
    pub scores: ScoreTensor,
    /// True target per trial.
    pub targets: Vec<usize>,
}

impl SyntheticConfig {
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> DecoderResult<SyntheticSession> {
        if self.n_candidates == 0 {
            return Err(DecoderError::InvalidConfig(
                "synthetic session needs at least one candidate".to_string(),
            ));
        }
        let valid: Vec<usize> = (0..self.n_candidates)
            .filter(|y| !self.invalid_candidates.contains(y))
            .collect();
        if let Some(target) = self.target {
            if !valid.contains(&target) {
                return Err(DecoderError::InvalidConfig(format!(
                    "target {target} is not a valid candidate"
                )));
            }
        }
        if valid.is_empty() {
            return Err(DecoderError::InvalidConfig(
                "every synthetic candidate is invalid".to_string(),
            ));
        }

        let noise = Normal::new(0.0, self.noise_std)
            .map_err(|e| DecoderError::InvalidConfig(format!("noise_std: {e}")))?;

        let targets: Vec<usize> = (0..self.n_trials)
            .map(|_| {
                self.target
                    .unwrap_or_else(|| valid[rng.gen_range(0..valid.len())])
            })
            .collect();

        let mut scores =
            ScoreTensor::zeros(self.n_models, self.n_trials, self.n_epochs, self.n_candidates);
        for m in 0..self.n_models {
            for (t, &target) in targets.iter().enumerate() {
                for e in 0..self.n_epochs {
                    let epoch = scores.epoch_mut(m, t, e);
                    for &y in &valid {
                        let signal = if y == target { self.signal_mean } else { 0.0 };
                        epoch[y] = signal + noise.sample(rng);
                    }
                }
            }
        }

        tracing::debug!(
            n_models = self.n_models,
            n_trials = self.n_trials,
            n_epochs = self.n_epochs,
            n_candidates = self.n_candidates,
            "Generated synthetic session"
        );
        Ok(SyntheticSession { scores, targets })
    }
}
