//! Error types for layer construction, building and evaluation

use thiserror::Error;

/// Layer errors
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid filter count: {0}. Must be positive.")]
    InvalidFilters(usize),

    #[error("Invalid strides {strides:?}: expected {arity} positive value(s)")]
    InvalidStrides { strides: Vec<usize>, arity: usize },

    #[error("Invalid kernel size: {0}. Must be positive.")]
    InvalidKernelSize(usize),

    #[error("Invalid input shape {shape}: {reason}")]
    InvalidShape { shape: String, reason: String },

    #[error("Input shape mismatch in '{layer}': expected {expected}, got {got}")]
    ShapeMismatch {
        layer: String,
        expected: String,
        got: String,
    },

    #[error("Layer '{0}' has not been built")]
    NotBuilt(String),

    #[error("Invalid layer config: {0}")]
    InvalidConfig(String),

    #[error("Weight initialization failed: {0}")]
    Initialization(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, LayerError>;
