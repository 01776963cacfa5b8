//! Supervised Decoder Module
//!
//! Turns per-epoch matching scores between candidate stimulus codes and the
//! measured brain response into a probability over candidates, the most
//! likely target, and the probability that this choice is wrong.
//! Runs either on a whole recording or incrementally as epochs arrive.

pub mod curve;
pub mod decoder;
pub mod normalizer;
pub mod null_outputs;
pub mod probability;
pub mod selector;
pub mod streaming;
pub mod synthetic;


pub use curve::{calibration_stats, CalibrationStats, CurvePoint, DecodingCurve, ReliabilityBin};
pub use decoder::SupervisedDecoder;
pub use normalizer::{EpochAccumulator, NormalizedScores, ScoreNormalizer};
pub use null_outputs::{Augmented, NullOutputAugmenter};
pub use probability::ProbabilityModel;
pub use selector::DecisionSelector;
pub use streaming::StreamingDecoder;
pub use synthetic::{SyntheticConfig, SyntheticSession};
