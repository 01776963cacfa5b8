use rand::seq::SliceRandom;
use rand::Rng;

use decoding_core::{ScoreTensor, VirtualOutputConfig};

/// Scores with virtual null outputs appended after the real candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Augmented {
    pub scores: ScoreTensor,
    pub n_virtual: usize,
}

impl Augmented {
    pub fn n_real(&self) -> usize {
        self.scores.n_candidates() - self.n_virtual
    }
}

/// Appends virtual "null" outputs built by block-shuffling the epochs of
/// non-target candidates.
///
/// A shuffled copy keeps a real output's score statistics but none of its
/// time-locking to the stimulus, so a decoder that picks a virtual output
/// signals that it cannot tell the target from noise.
#[derive(Debug, Clone, Default)]
pub struct NullOutputAugmenter {
    config: VirtualOutputConfig,
}

impl NullOutputAugmenter {
    pub fn new(config: VirtualOutputConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VirtualOutputConfig {
        &self.config
    }

    /// Real candidates that virtual outputs may be copied from.
    pub fn sources(&self, n_candidates: usize) -> Vec<usize> {
        (0..n_candidates)
            .filter(|&y| Some(y) != self.config.target_index)
            .collect()
    }

    pub fn augment<R: Rng + ?Sized>(&self, scores: &ScoreTensor, rng: &mut R) -> Augmented {
        let count = self.config.count;
        let sources = self.sources(scores.n_candidates());
        if count == 0 || sources.is_empty() {
            if count > 0 {
                tracing::warn!(
                    n_candidates = scores.n_candidates(),
                    "No non-target outputs to build virtual outputs from"
                );
            }
            return Augmented {
                scores: scores.clone(),
                n_virtual: 0,
            };
        }

        let [n_models, n_trials, _, n_real] = scores.shape();
        let block_len = self.config.block_len.max(1);
        let mut out = scores.with_extra_candidates(count);

        for k in 0..count {
            let source = sources[k % sources.len()];
            for t in 0..n_trials {
                let order = block_order(scores.trial_active_epochs(t), block_len, rng);
                // one permutation per (virtual output, trial), shared by every model
                for m in 0..n_models {
                    for (e, &src_epoch) in order.iter().enumerate() {
                        let value = scores.get(m, t, src_epoch, source);
                        out.set(m, t, e, n_real + k, value);
                    }
                }
            }
        }

        tracing::debug!(count, block_len, n_sources = sources.len(), "Appended virtual outputs");
        Augmented {
            scores: out,
            n_virtual: count,
        }
    }
}

/// Epoch order after shuffling `0..n_epochs` in blocks of `block_len`.
/// The final block may be short.
fn block_order<R: Rng + ?Sized>(n_epochs: usize, block_len: usize, rng: &mut R) -> Vec<usize> {
    let n_blocks = n_epochs.div_ceil(block_len);
    let mut blocks: Vec<usize> = (0..n_blocks).collect();
    blocks.shuffle(rng);
    blocks
        .into_iter()
        .flat_map(|b| b * block_len..((b + 1) * block_len).min(n_epochs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn numbered_scores() -> ScoreTensor {
        // distinct value per (model, trial, epoch, candidate)
        ScoreTensor::from_fn([2, 2, 12, 4], |m, t, e, y| {
            1.0 + (m * 1000 + t * 100 + e) as f64 + y as f64 * 0.01
        })
    }

    fn augmenter(count: usize, block_len: usize) -> NullOutputAugmenter {
        NullOutputAugmenter::new(VirtualOutputConfig {
            count,
            block_len,
            target_index: Some(0),
        })
    }

    #[test]
    fn test_disabled_is_a_no_op() {
        let scores = numbered_scores();
        let out = augmenter(0, 3).augment(&scores, &mut StdRng::seed_from_u64(1));
        assert_eq!(out.n_virtual, 0);
        assert_eq!(out.scores, scores);
    }

    #[test]
    fn test_virtual_columns_are_block_permutations_of_sources() {
        let scores = numbered_scores();
        let out = augmenter(5, 3).augment(&scores, &mut StdRng::seed_from_u64(7));

        assert_eq!(out.n_virtual, 5);
        assert_eq!(out.n_real(), 4);
        assert_eq!(out.scores.n_candidates(), 9);

        for k in 0..5 {
            // sources are 1, 2, 3 cycling
            let source = 1 + k % 3;
            for m in 0..2 {
                for t in 0..2 {
                    let mut real: Vec<f64> = (0..12).map(|e| scores.get(m, t, e, source)).collect();
                    let mut virt: Vec<f64> =
                        (0..12).map(|e| out.scores.get(m, t, e, 4 + k)).collect();
                    real.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    virt.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    assert_eq!(real, virt);

                    // blocks stay contiguous
                    for block in 0..4 {
                        let first = out.scores.get(m, t, block * 3, 4 + k);
                        for i in 1..3 {
                            assert_relative_eq!(
                                out.scores.get(m, t, block * 3 + i, 4 + k),
                                first + i as f64,
                                epsilon = 1e-9
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_target_column_is_never_a_source() {
        let mut scores = numbered_scores();
        for m in 0..2 {
            for t in 0..2 {
                for e in 0..12 {
                    scores.set(m, t, e, 0, -777.0);
                }
            }
        }
        let out = augmenter(6, 2).augment(&scores, &mut StdRng::seed_from_u64(3));
        let virt = (4..10).flat_map(|y| {
            let s = &out.scores;
            (0..12).map(move |e| s.get(1, 1, e, y))
        });
        assert!(virt.into_iter().all(|v| v != -777.0));
    }

    #[test]
    fn test_permutation_is_shared_across_models() {
        // identical models, so identical virtual columns
        let scores = ScoreTensor::from_fn([3, 1, 20, 3], |_, _, e, y| (e * 10 + y) as f64 + 1.0);
        let out = augmenter(2, 4).augment(&scores, &mut StdRng::seed_from_u64(11));
        for y in 3..5 {
            for e in 0..20 {
                let v = out.scores.get(0, 0, e, y);
                assert_eq!(out.scores.get(1, 0, e, y), v);
                assert_eq!(out.scores.get(2, 0, e, y), v);
            }
        }
    }

    #[test]
    fn test_block_order_covers_every_epoch_once() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut order = block_order(11, 4, &mut rng);
        assert_eq!(order.len(), 11);
        order.sort_unstable();
        assert_eq!(order, (0..11).collect::<Vec<_>>());

        // one block of everything is the identity
        assert_eq!(block_order(6, 10, &mut rng), vec![0, 1, 2, 3, 4, 5]);
        assert!(block_order(0, 3, &mut rng).is_empty());
    }

    #[test]
    fn test_trailing_zero_epochs_are_not_shuffled_in() {
        let mut scores = ScoreTensor::zeros(1, 1, 10, 3);
        for e in 0..6 {
            scores.epoch_mut(0, 0, e).copy_from_slice(&[1.0, 2.0 + e as f64, 3.0]);
        }
        let out = augmenter(1, 2).augment(&scores, &mut StdRng::seed_from_u64(9));
        for e in 0..6 {
            assert_ne!(out.scores.get(0, 0, e, 3), 0.0);
        }
        for e in 6..10 {
            assert_eq!(out.scores.get(0, 0, e, 3), 0.0);
        }
    }

    #[test]
    fn test_no_sources_leaves_scores_alone() {
        let scores = ScoreTensor::from_fn([1, 1, 4, 1], |_, _, _, _| 1.0);
        let out = augmenter(3, 2).augment(&scores, &mut StdRng::seed_from_u64(2));
        assert_eq!(out.n_virtual, 0);
        assert_eq!(out.scores.n_candidates(), 1);
    }
}
