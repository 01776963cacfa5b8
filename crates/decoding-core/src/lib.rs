//! Shared types for supervised stimulus decoding: score and probability
//! tensors, decision records, configuration and errors.

pub mod config;
pub mod error;
pub mod stats;
pub mod tensor;
pub mod types;

pub use config::*;
pub use error::*;
pub use tensor::*;
pub use types::*;
