//! QFAC error types

use thiserror::Error;

/// QFAC error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fragment rejected before any engine state was touched
    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    /// Requested reconstruction fidelity outside [0.0, 1.0]
    #[error("Invalid fidelity {0}: must be within [0.0, 1.0]")]
    InvalidFidelity(f64),

    /// An episode or composite references a pattern the store does not hold
    #[error("Dangling pattern reference: pattern {0} is not in the store")]
    DanglingPatternRef(u64),

    /// A composite whose depth does not strictly increase over its children
    #[error("Cyclic pattern composition involving pattern {0}")]
    CyclicPattern(u64),

    /// Pattern capacity limit reached; the triggering call committed nothing
    #[error("Pattern storage exhausted: capacity {capacity} reached")]
    StorageExhausted {
        /// Configured pattern capacity that was hit
        capacity: usize,
    },

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for QFAC operations
pub type Result<T> = std::result::Result<T, Error>;
