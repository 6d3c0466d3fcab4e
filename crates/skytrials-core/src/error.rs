//! Error types shared by every skytrials component.
//!
//! Only unrecoverable conditions end up here: unreadable inputs, malformed
//! configuration, or arrays whose shape does not match the pixel grid they claim
//! to describe. Per-pixel, per-bin and per-hypothesis failures are carried as
//! tagged values instead (see [`crate::pvalue::PValue`],
//! [`crate::trials::AggregationStatus`] and
//! [`crate::sensitivity::SensitivityStatus`]).

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for skytrials operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (reading job outputs, writing maps and manifests)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration values
    #[error("configuration error: {0}")]
    Config(String),

    /// Input validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// An array does not have the length its pixel grid requires
    #[error("{what} has {actual} entries, expected {expected}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// A persisted file was built for a different grid or cut
    #[error("{path}: {message}")]
    IncompatibleFile { path: PathBuf, message: String },

    /// Source catalog arrays are inconsistent
    #[error("catalog error: {0}")]
    Catalog(String),
}

impl Error {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Creates a shape mismatch error.
    pub fn shape(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_names_both_sizes() {
        let err = Error::shape("TS map", 3072, 12);
        assert_eq!(err.to_string(), "TS map has 12 entries, expected 3072");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
