use rand::Rng;

use decoding_core::{DecisionRecord, DecoderConfig, DecoderError, DecoderResult, ScoreTensor};

use crate::decoder::SupervisedDecoder;
use crate::normalizer::EpochAccumulator;

/// Incremental decoder for one online session.
///
/// Epoch blocks are folded into per-lane prefix sums as they arrive, so a
/// decision costs O(decisions × candidates) per lane without revisiting raw
/// epochs. For the
/// same epochs and random state it returns exactly what
/// [`SupervisedDecoder::decode`] returns on the concatenated tensor.
#[derive(Debug, Clone)]
pub struct StreamingDecoder {
    decoder: SupervisedDecoder,
    /// (model, trial, candidate), fixed by the first block.
    shape: Option<[usize; 3]>,
    lanes: Vec<EpochAccumulator>,
    epochs_seen: usize,
}

impl StreamingDecoder {
    pub fn new(config: DecoderConfig) -> DecoderResult<Self> {
        if config.virtual_outputs.count > 0 {
            return Err(DecoderError::InvalidConfig(
                "virtual outputs need the full epoch history and cannot be streamed".to_string(),
            ));
        }
        Ok(Self {
            decoder: SupervisedDecoder::new(config)?,
            shape: None,
            lanes: Vec::new(),
            epochs_seen: 0,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        self.decoder.config()
    }

    /// Epochs received since construction or the last reset.
    pub fn epochs_seen(&self) -> usize {
        self.epochs_seen
    }

    pub fn push_block(&mut self, block: &ScoreTensor) -> DecoderResult<()> {
        let [n_models, n_trials, n_epochs, n_candidates] = block.shape();
        match self.shape {
            Some([m, t, y]) => {
                if n_models != m {
                    return Err(DecoderError::shape("model", m, n_models));
                }
                if n_trials != t {
                    return Err(DecoderError::shape("trial", t, n_trials));
                }
                if n_candidates != y {
                    return Err(DecoderError::shape("candidate", y, n_candidates));
                }
            }
            None => {
                self.decoder.check_prior(n_candidates)?;
                self.lanes = self
                    .decoder
                    .normalizer()
                    .lanes(n_models * n_trials, n_candidates);
                self.shape = Some([n_models, n_trials, n_candidates]);
            }
        }

        self.decoder.normalizer().accumulate(&mut self.lanes, block)?;
        self.epochs_seen += n_epochs;
        tracing::debug!(
            block_epochs = n_epochs,
            epochs_seen = self.epochs_seen,
            "Accumulated epoch block"
        );
        Ok(())
    }

    /// Decide from everything received so far.
    pub fn decide<R: Rng + ?Sized>(&self, rng: &mut R) -> DecoderResult<DecisionRecord> {
        let Some([n_models, n_trials, n_candidates]) = self.shape else {
            return Ok(DecisionRecord::missing_input());
        };
        let normalized =
            self.decoder
                .normalizer()
                .standardize(n_models, n_trials, n_candidates, &self.lanes)?;
        self.decoder.decide(normalized, n_candidates, rng)
    }

    pub fn push_and_decide<R: Rng + ?Sized>(
        &mut self,
        block: &ScoreTensor,
        rng: &mut R,
    ) -> DecoderResult<DecisionRecord> {
        self.push_block(block)?;
        self.decide(rng)
    }

    /// Drop all accumulated epochs, e.g. at the start of a new trial set.
    pub fn reset(&mut self) {
        self.shape = None;
        self.lanes.clear();
        self.epochs_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticConfig;
    use decoding_core::{NormalizerConfig, VirtualOutputConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn session() -> ScoreTensor {
        SyntheticConfig {
            n_models: 2,
            n_trials: 3,
            n_epochs: 40,
            n_candidates: 6,
            target: None,
            signal_mean: 0.5,
            invalid_candidates: vec![4],
            ..SyntheticConfig::default()
        }
        .generate(&mut StdRng::seed_from_u64(21))
        .unwrap()
        .scores
    }

    #[test]
    fn test_stream_matches_batch_bit_for_bit() {
        let scores = session();
        let config = DecoderConfig {
            marginalize_models: false,
            normalizer: NormalizerConfig {
                min_decision_len: 1,
                detrend: true,
                ..NormalizerConfig::default()
            },
            ..DecoderConfig::default()
        };

        let batch = SupervisedDecoder::new(config.clone())
            .unwrap()
            .decode(Some(&scores), &mut StdRng::seed_from_u64(99))
            .unwrap();

        let mut stream = StreamingDecoder::new(config).unwrap();
        for (start, end) in [(0, 7), (7, 8), (8, 25), (25, 40)] {
            stream.push_block(&scores.epoch_range(start, end)).unwrap();
        }
        let streamed = stream.decide(&mut StdRng::seed_from_u64(99)).unwrap();

        assert_eq!(stream.epochs_seen(), 40);
        assert_eq!(streamed, batch);
    }

    #[test]
    fn test_every_prefix_matches_batch() {
        let scores = session();
        let config = DecoderConfig::default();
        let batch = SupervisedDecoder::new(config.clone()).unwrap();
        let mut stream = StreamingDecoder::new(config).unwrap();

        for end in (5..=40).step_by(5) {
            let streamed = stream
                .push_and_decide(&scores.epoch_range(end - 5, end), &mut StdRng::seed_from_u64(end as u64))
                .unwrap();
            let expected = batch
                .decode(Some(&scores.epoch_range(0, end)), &mut StdRng::seed_from_u64(end as u64))
                .unwrap();
            assert_eq!(streamed, expected);
        }
    }

    #[test]
    fn test_warmup_outlier_matches_batch_at_every_epoch() {
        let mut scores = session();
        let [_, _, _, n_candidates] = scores.shape();
        let mut spike = vec![0.0; n_candidates];
        spike[5] = 100.0;
        scores.epoch_mut(1, 2, 1).copy_from_slice(&spike);

        let config = DecoderConfig::default();
        let batch = SupervisedDecoder::new(config.clone()).unwrap();
        let mut stream = StreamingDecoder::new(config).unwrap();

        for end in 1..=12 {
            let streamed = stream
                .push_and_decide(&scores.epoch_range(end - 1, end), &mut StdRng::seed_from_u64(7))
                .unwrap();
            let expected = batch
                .decode(Some(&scores.epoch_range(0, end)), &mut StdRng::seed_from_u64(7))
                .unwrap();
            assert_eq!(streamed, expected, "after {end} epochs");
        }
    }

    #[test]
    fn test_decide_before_any_block_is_sentinel() {
        let stream = StreamingDecoder::new(DecoderConfig::default()).unwrap();
        let record = stream.decide(&mut StdRng::seed_from_u64(0)).unwrap();
        assert!(record.is_missing_input());
    }

    #[test]
    fn test_block_shape_must_not_change() {
        let mut stream = StreamingDecoder::new(DecoderConfig::default()).unwrap();
        stream.push_block(&ScoreTensor::zeros(1, 2, 3, 4)).unwrap();

        let err = stream.push_block(&ScoreTensor::zeros(1, 2, 3, 5)).unwrap_err();
        assert_eq!(err, DecoderError::shape("candidate", 4, 5));
        let err = stream.push_block(&ScoreTensor::zeros(2, 2, 3, 4)).unwrap_err();
        assert_eq!(err, DecoderError::shape("model", 1, 2));
    }

    #[test]
    fn test_reset_starts_over() {
        let scores = session();
        let mut stream = StreamingDecoder::new(DecoderConfig::default()).unwrap();
        stream.push_block(&scores).unwrap();
        stream.reset();
        assert_eq!(stream.epochs_seen(), 0);
        assert!(stream
            .decide(&mut StdRng::seed_from_u64(0))
            .unwrap()
            .is_missing_input());

        // a different shape is accepted after reset
        stream.push_block(&ScoreTensor::zeros(1, 1, 2, 3)).unwrap();
    }

    #[test]
    fn test_virtual_outputs_are_rejected() {
        let config = DecoderConfig {
            virtual_outputs: VirtualOutputConfig {
                count: 3,
                ..VirtualOutputConfig::default()
            },
            ..DecoderConfig::default()
        };
        assert!(matches!(
            StreamingDecoder::new(config),
            Err(DecoderError::InvalidConfig(_))
        ));
    }
}
