use rand::Rng;

use decoding_core::{DecisionRecord, DecoderConfig, DecoderError, DecoderResult, ScoreTensor};

use crate::normalizer::{NormalizedScores, ScoreNormalizer};
use crate::null_outputs::{Augmented, NullOutputAugmenter};
use crate::probability::ProbabilityModel;
use crate::selector::DecisionSelector;

/// Batch decoding pipeline: augment, normalize, softmax, select.
#[derive(Debug, Clone)]
pub struct SupervisedDecoder {
    config: DecoderConfig,
    normalizer: ScoreNormalizer,
    augmenter: NullOutputAugmenter,
    model: ProbabilityModel,
    selector: DecisionSelector,
}

impl SupervisedDecoder {
    pub fn new(config: DecoderConfig) -> DecoderResult<Self> {
        config.validate()?;
        Ok(Self {
            normalizer: ScoreNormalizer::new(config.normalizer.clone()),
            augmenter: NullOutputAugmenter::new(config.virtual_outputs.clone()),
            model: ProbabilityModel::from_config(&config),
            selector: DecisionSelector::new(config.tie_break.clone()),
            config,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &ScoreNormalizer {
        &self.normalizer
    }

    /// Decode a score tensor shaped (model, trial, epoch, candidate).
    ///
    /// `None` means no scores have arrived yet and yields
    /// [`DecisionRecord::missing_input`]. The random source shuffles virtual
    /// outputs first, then supplies tie-break noise.
    pub fn decode<R: Rng + ?Sized>(
        &self,
        scores: Option<&ScoreTensor>,
        rng: &mut R,
    ) -> DecoderResult<DecisionRecord> {
        let Some(scores) = scores else {
            tracing::debug!("No score tensor, returning missing-input record");
            return Ok(DecisionRecord::missing_input());
        };
        self.check_prior(scores.n_candidates())?;

        let augmented = self.augmenter.augment(scores, rng);
        self.decode_augmented(&augmented, rng)
    }

    /// Run the pipeline on scores whose last `n_virtual` columns are already virtual.
    pub fn decode_augmented<R: Rng + ?Sized>(
        &self,
        augmented: &Augmented,
        rng: &mut R,
    ) -> DecoderResult<DecisionRecord> {
        let normalized = self.normalizer.normalize(&augmented.scores)?;
        self.decide(normalized, augmented.n_real(), rng)
    }

    /// Probabilities and selection from already normalized scores.
    pub(crate) fn decide<R: Rng + ?Sized>(
        &self,
        normalized: NormalizedScores,
        n_real: usize,
        rng: &mut R,
    ) -> DecoderResult<DecisionRecord> {
        if normalized.decision_index.is_empty() {
            tracing::debug!("No active epochs, returning missing-input record");
            return Ok(DecisionRecord::missing_input());
        }

        let probs = self
            .model
            .probabilities(&normalized.z, &normalized.validity, n_real)?;
        let mut record = self.selector.select(&probs, n_real, rng)?;
        record.decision_index = Some(normalized.decision_index);

        if let Some((estimate, perr)) = record.latest(0, 0) {
            tracing::debug!(
                n_epochs = normalized.n_epochs,
                n_decisions = record.n_decisions(),
                estimate,
                perr,
                "Decoded"
            );
        }
        Ok(record)
    }

    pub(crate) fn check_prior(&self, n_candidates: usize) -> DecoderResult<()> {
        match &self.config.prior {
            Some(prior) if prior.len() != n_candidates => Err(DecoderError::shape(
                "candidate",
                n_candidates,
                prior.len(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decoding_core::{Prior, NO_SELECTION};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_missing_input_returns_sentinel() {
        let decoder = SupervisedDecoder::new(DecoderConfig::default()).unwrap();
        let record = decoder.decode(None, &mut StdRng::seed_from_u64(0)).unwrap();
        assert!(record.is_missing_input());
        assert_eq!(record.estimates, vec![NO_SELECTION]);
        assert_eq!(record.error_probabilities, vec![1.0]);
        assert!(record.target_probabilities.is_none());
        assert!(record.decision_index.is_none());
    }

    #[test]
    fn test_all_zero_scores_return_sentinel() {
        let decoder = SupervisedDecoder::new(DecoderConfig::default()).unwrap();
        let scores = ScoreTensor::zeros(1, 2, 10, 4);
        let record = decoder
            .decode(Some(&scores), &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert!(record.is_missing_input());
    }

    #[test]
    fn test_no_control_amplitude_is_not_implemented() {
        let config = DecoderConfig {
            no_control_amplitude: Some(0.5),
            ..DecoderConfig::default()
        };
        assert!(matches!(
            SupervisedDecoder::new(config),
            Err(DecoderError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_prior_length_mismatch_names_candidate() {
        let config = DecoderConfig {
            prior: Some(Prior::Probabilities(vec![0.5, 0.5])),
            ..DecoderConfig::default()
        };
        let decoder = SupervisedDecoder::new(config).unwrap();
        let scores = ScoreTensor::from_fn([1, 1, 5, 3], |_, _, e, y| (e + y) as f64 + 1.0);
        let err = decoder
            .decode(Some(&scores), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert_eq!(err, DecoderError::shape("candidate", 3, 2));
        assert!(err.to_string().contains("candidate"));
    }

    #[test]
    fn test_record_carries_decision_index() {
        let config = DecoderConfig {
            normalizer: decoding_core::NormalizerConfig {
                min_decision_len: 2,
                ..Default::default()
            },
            ..DecoderConfig::default()
        };
        let decoder = SupervisedDecoder::new(config).unwrap();
        let scores = ScoreTensor::from_fn([1, 1, 10, 3], |_, _, e, y| {
            if y == 1 {
                1.0
            } else {
                -0.5 + 0.01 * e as f64
            }
        });
        let record = decoder
            .decode(Some(&scores), &mut StdRng::seed_from_u64(0))
            .unwrap();
        let index = record.decision_index.clone().unwrap();
        assert_eq!(index.counts(), &[2, 4, 8, 10]);
        assert_eq!(record.shape, [1, 1, 4]);
        assert_eq!(record.latest(0, 0).unwrap().0, 1);
    }
}
