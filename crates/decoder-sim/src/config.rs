use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

use supervised_decoder::SyntheticConfig;

/// Settings of the simulated online session (decoder settings come from `DECODER_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub seed: u64,
    pub n_trials: usize,
    pub n_epochs: usize,
    pub n_candidates: usize,
    pub signal_mean: f64,
    pub noise_std: f64,
    /// Epochs delivered per streaming block
    pub block_epochs: usize,
    /// Act once the error probability drops below this
    pub act_threshold: f64,
}

impl SimConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            seed: env::var("SIM_SEED")
                .unwrap_or_else(|_| "42".to_string())
                .parse()
                .context("SIM_SEED")?,
            n_trials: env::var("SIM_TRIALS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("SIM_TRIALS")?,
            n_epochs: env::var("SIM_EPOCHS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("SIM_EPOCHS")?,
            n_candidates: env::var("SIM_CANDIDATES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("SIM_CANDIDATES")?,
            signal_mean: env::var("SIM_SIGNAL_MEAN")
                .unwrap_or_else(|_| "0.4".to_string())
                .parse()
                .context("SIM_SIGNAL_MEAN")?,
            noise_std: env::var("SIM_NOISE_STD")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()
                .context("SIM_NOISE_STD")?,
            block_epochs: env::var("SIM_BLOCK_EPOCHS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("SIM_BLOCK_EPOCHS")?,
            act_threshold: env::var("SIM_ACT_THRESHOLD")
                .unwrap_or_else(|_| "0.1".to_string())
                .parse()
                .context("SIM_ACT_THRESHOLD")?,
        };

        if config.block_epochs == 0 {
            bail!("SIM_BLOCK_EPOCHS must be at least 1");
        }
        if !(0.0..=1.0).contains(&config.act_threshold) {
            bail!("SIM_ACT_THRESHOLD must be within [0, 1]");
        }
        Ok(config)
    }

    /// One trial at a time, target drawn per trial.
    pub fn session(&self) -> SyntheticConfig {
        SyntheticConfig {
            n_models: 1,
            n_trials: self.n_trials,
            n_epochs: self.n_epochs,
            n_candidates: self.n_candidates,
            target: None,
            signal_mean: self.signal_mean,
            noise_std: self.noise_std,
            invalid_candidates: Vec::new(),
        }
    }
}
