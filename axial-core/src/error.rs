//! Error types for axial

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Key not found in state dict: {0}")]
    MissingKey(String),

    #[error("Cannot {0} a leaf value without a key")]
    MissingPrefix(&'static str),

    #[error("Structure mismatch: {0}")]
    Structure(String),

    #[error("Duplicate key {0}")]
    DuplicateKey(String),

    #[error("Missing block {index} for stacked key {key}")]
    MissingBlock { key: String, index: usize },

    #[error("Axis error: {0}")]
    Axis(String),

    #[error("Shape mismatch for {key}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Partition error: {0}")]
    Partition(String),

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("Initialization error: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, Error>;
