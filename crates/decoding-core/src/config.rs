use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, DecoderResult};

/// Prefix of every environment variable read by [`DecoderConfig::from_env`].
pub const ENV_PREFIX: &str = "DECODER_";

/// Prior estimate of the per-epoch noise variance, worth `pseudo_epochs`
/// epochs of observed data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorSigma {
    pub sigma2: f64,
    pub pseudo_epochs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerConfig {
    /// Epochs whose score energy exceeds this many std-devs are clipped. 0 disables.
    pub outlier_threshold: f64,
    /// Active epochs seen before clipping starts.
    pub outlier_warmup_epochs: usize,
    /// Subtract the mean over valid candidates.
    pub center: bool,
    /// Remove a linear drift of the common-mode score.
    pub detrend: bool,
    /// Scale is inflated by `1 + epoch_correction / n_epochs`.
    pub epoch_correction: f64,
    /// >0: exponential decision spacing from this base; <0: fixed stride; 0: every epoch.
    pub min_decision_len: i64,
    /// Maximum epochs in one decision window. 0 = unbounded.
    pub max_decision_len: usize,
    /// Accumulate backwards from the most recent epoch.
    pub backward_accumulate: bool,
    pub prior_sigma: Option<PriorSigma>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            outlier_threshold: 4.0,
            outlier_warmup_epochs: 5,
            center: true,
            detrend: false,
            epoch_correction: 10.0,
            min_decision_len: 0,
            max_decision_len: 0,
            backward_accumulate: false,
            prior_sigma: None,
        }
    }
}

/// Per-candidate prior over which output is the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prior {
    /// Probabilities (need not be normalized); zero rules a candidate out.
    Probabilities(Vec<f64>),
    /// Log-probability offsets added to the logits as-is.
    LogOffsets(Vec<f64>),
}

impl Prior {
    pub fn len(&self) -> usize {
        match self {
            Prior::Probabilities(p) => p.len(),
            Prior::LogOffsets(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn log_offsets(&self) -> Vec<f64> {
        match self {
            Prior::Probabilities(p) => p
                .iter()
                .map(|&v| if v > 0.0 { v.ln() } else { f64::NEG_INFINITY })
                .collect(),
            Prior::LogOffsets(l) => l.clone(),
        }
    }
}

/// How tie-breaking noise is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TieBreakMode {
    /// Fresh draws from the caller's random source on every call.
    PerCall,
    /// The same noise on every call, regenerated from `seed`.
    SessionStable { seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TieBreakConfig {
    /// Std-dev of the Gaussian noise added to probabilities. 0 disables.
    pub noise_scale: f64,
    pub mode: TieBreakMode,
}

impl Default for TieBreakConfig {
    fn default() -> Self {
        Self {
            noise_scale: 1e-3,
            mode: TieBreakMode::PerCall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VirtualOutputConfig {
    /// Number of synthetic null outputs to append. 0 disables.
    pub count: usize,
    /// Epochs per permuted block.
    pub block_len: usize,
    /// Candidate known to be the cued target, never used as a source.
    /// Defaults to output 0, the supervised-recording convention.
    pub target_index: Option<usize>,
}

impl Default for VirtualOutputConfig {
    fn default() -> Self {
        Self {
            count: 0,
            block_len: 5,
            target_index: Some(0),
        }
    }
}

/// Complete decoder configuration. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub normalizer: NormalizerConfig,
    /// Inverse noise scale applied to z-scores before the softmax.
    pub softmax_scale: f64,
    pub marginalize_models: bool,
    pub marginalize_decisions: bool,
    pub prior: Option<Prior>,
    /// Reserved. Setting it fails validation with `NotImplemented`.
    pub no_control_amplitude: Option<f64>,
    pub tie_break: TieBreakConfig,
    pub virtual_outputs: VirtualOutputConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            softmax_scale: 3.5,
            marginalize_models: true,
            marginalize_decisions: false,
            prior: None,
            no_control_amplitude: None,
            tie_break: TieBreakConfig::default(),
            virtual_outputs: VirtualOutputConfig::default(),
        }
    }
}

impl DecoderConfig {
    pub fn from_json(json: &str) -> DecoderResult<Self> {
        let config: DecoderConfig = serde_json::from_str(json)
            .map_err(|e| DecoderError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `DECODER_*` environment variables over the defaults.
    pub fn from_env() -> DecoderResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load from `(name, value)` pairs; names without the `DECODER_` prefix are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> DecoderResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let mut sigma2: Option<f64> = None;
        let mut pseudo_epochs: Option<f64> = None;

        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name {
                "OUTLIER_THRESHOLD" => config.normalizer.outlier_threshold = parse(key, value)?,
                "OUTLIER_WARMUP_EPOCHS" => {
                    config.normalizer.outlier_warmup_epochs = parse(key, value)?
                }
                "CENTER" => config.normalizer.center = parse(key, value)?,
                "DETREND" => config.normalizer.detrend = parse(key, value)?,
                "EPOCH_CORRECTION" => config.normalizer.epoch_correction = parse(key, value)?,
                "MIN_DECISION_LEN" => config.normalizer.min_decision_len = parse(key, value)?,
                "MAX_DECISION_LEN" => config.normalizer.max_decision_len = parse(key, value)?,
                "BACKWARD_ACCUMULATE" => {
                    config.normalizer.backward_accumulate = parse(key, value)?
                }
                "PRIOR_SIGMA2" => sigma2 = Some(parse(key, value)?),
                "PRIOR_SIGMA_EPOCHS" => pseudo_epochs = Some(parse(key, value)?),
                "SOFTMAX_SCALE" => config.softmax_scale = parse(key, value)?,
                "MARGINALIZE_MODELS" => config.marginalize_models = parse(key, value)?,
                "MARGINALIZE_DECISIONS" => config.marginalize_decisions = parse(key, value)?,
                "PRIOR" => {
                    let probabilities = value
                        .split(',')
                        .map(|v| parse(key, v.trim()))
                        .collect::<DecoderResult<Vec<f64>>>()?;
                    config.prior = Some(Prior::Probabilities(probabilities));
                }
                "NO_CONTROL_AMPLITUDE" => config.no_control_amplitude = Some(parse(key, value)?),
                "TIE_BREAK_NOISE" => config.tie_break.noise_scale = parse(key, value)?,
                "TIE_BREAK_SEED" => {
                    config.tie_break.mode = TieBreakMode::SessionStable {
                        seed: parse(key, value)?,
                    }
                }
                "VIRTUAL_OUTPUTS" => config.virtual_outputs.count = parse(key, value)?,
                "VIRTUAL_BLOCK_LEN" => config.virtual_outputs.block_len = parse(key, value)?,
                "VIRTUAL_TARGET_INDEX" => {
                    config.virtual_outputs.target_index = if value.eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(parse(key, value)?)
                    }
                }
                _ => return Err(DecoderError::UnknownConfigKey(key.to_string())),
            }
        }

        config.normalizer.prior_sigma = match (sigma2, pseudo_epochs) {
            (Some(sigma2), pseudo) => Some(PriorSigma {
                sigma2,
                pseudo_epochs: pseudo.unwrap_or(120.0),
            }),
            (None, Some(_)) => {
                return Err(DecoderError::InvalidConfig(format!(
                    "{ENV_PREFIX}PRIOR_SIGMA_EPOCHS requires {ENV_PREFIX}PRIOR_SIGMA2"
                )))
            }
            (None, None) => None,
        };

        config.validate()?;
        tracing::debug!("Decoder configuration loaded from environment: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> DecoderResult<()> {
        if self.no_control_amplitude.is_some() {
            return Err(DecoderError::NotImplemented(
                "no-control amplitude pseudo-output".to_string(),
            ));
        }
        if !(self.softmax_scale.is_finite() && self.softmax_scale > 0.0) {
            return Err(invalid("softmax_scale must be positive and finite"));
        }

        let n = &self.normalizer;
        if !(n.outlier_threshold.is_finite() && n.outlier_threshold >= 0.0) {
            return Err(invalid("outlier_threshold must be >= 0"));
        }
        if !(n.epoch_correction.is_finite() && n.epoch_correction >= 0.0) {
            return Err(invalid("epoch_correction must be >= 0"));
        }
        if let Some(prior) = n.prior_sigma {
            if !(prior.sigma2.is_finite() && prior.sigma2 > 0.0) {
                return Err(invalid("prior_sigma.sigma2 must be positive"));
            }
            if !(prior.pseudo_epochs.is_finite() && prior.pseudo_epochs >= 0.0) {
                return Err(invalid("prior_sigma.pseudo_epochs must be >= 0"));
            }
        }

        if !(self.tie_break.noise_scale.is_finite() && self.tie_break.noise_scale >= 0.0) {
            return Err(invalid("tie_break.noise_scale must be >= 0"));
        }
        if self.virtual_outputs.count > 0 && self.virtual_outputs.block_len == 0 {
            return Err(invalid("virtual_outputs.block_len must be at least 1"));
        }

        match &self.prior {
            Some(Prior::Probabilities(p)) => {
                if p.iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return Err(invalid("prior probabilities must be finite and >= 0"));
                }
                if !p.iter().any(|&v| v > 0.0) {
                    return Err(invalid("prior must give some candidate nonzero probability"));
                }
            }
            Some(Prior::LogOffsets(l)) => {
                if l.is_empty() || l.iter().any(|v| v.is_nan() || *v == f64::INFINITY) {
                    return Err(invalid("prior log offsets must be non-empty and < +inf"));
                }
            }
            None => {}
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> DecoderError {
    DecoderError::InvalidConfig(msg.to_string())
}

fn parse<T>(key: &str, value: &str) -> DecoderResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| DecoderError::InvalidConfig(format!("{key}={value}: {e}")))
}
