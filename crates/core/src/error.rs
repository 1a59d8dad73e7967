//! Error type shared by every FashionViL component.

use thiserror::Error;

/// Errors raised while building or running a FashionViL model.
#[derive(Debug, Error)]
pub enum FashionVilError {
    /// `training_head_type` named a head that does not exist.
    #[error("unsupported training head type: {0}")]
    UnsupportedHeadType(String),
    /// A pretraining batch asked for an objective the head does not know.
    #[error("unsupported pretraining task: {0}")]
    UnsupportedTask(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("sample list is missing field `{0}`")]
    MissingField(String),
    #[error("shape mismatch for `{field}`: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        field: String,
        expected: String,
        actual: Vec<usize>,
    },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, FashionVilError>;
