use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecoderError {
    #[error("Shape mismatch in {dimension} dimension: expected {expected}, got {actual}")]
    ShapeMismatch {
        dimension: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown configuration key: {0}")]
    UnknownConfigKey(String),
}

impl DecoderError {
    pub fn shape(dimension: &'static str, expected: usize, actual: usize) -> Self {
        DecoderError::ShapeMismatch {
            dimension,
            expected,
            actual,
        }
    }
}

pub type DecoderResult<T> = Result<T, DecoderError>;
