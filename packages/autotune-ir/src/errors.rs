//! Error types for autotune-ir
//!
//! Provides unified error handling across the crate.

use thiserror::Error;

/// Main error type for autotune-ir operations
#[derive(Debug, Error)]
pub enum IrError {
    /// Malformed wire or text data (TensorInfo JSON, target strings, shapes)
    #[error("Format error: {0}")]
    Format(String),

    /// Metadata that should exist in a program could not be found
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// The default compilation routine rejected the program
    #[error("Lowering error: {0}")]
    Lowering(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IrError {
    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        IrError::Format(msg.into())
    }

    /// Create a lookup error
    pub fn lookup(msg: impl Into<String>) -> Self {
        IrError::Lookup(msg.into())
    }

    /// Create a lowering error
    pub fn lowering(msg: impl Into<String>) -> Self {
        IrError::Lowering(msg.into())
    }

    pub fn is_format(&self) -> bool {
        matches!(self, IrError::Format(_))
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, IrError::Lookup(_))
    }
}

/// Result type alias for autotune-ir operations
pub type Result<T> = std::result::Result<T, IrError>;
