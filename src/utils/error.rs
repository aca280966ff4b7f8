//! Error Handling Module
//!
//! Error taxonomy for the co-training pipeline. Structural failures (shape or
//! device mismatches, missing dataset files, bad configuration) abort the run.
//! Mixed-precision overflow is deliberately absent: the gradient scaler
//! recovers from it by skipping the optimizer step.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for co-training operations
#[derive(Error, Debug)]
pub enum CoTrainError {
    /// Tensors entering a warp or loss computation disagree on shape
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A tensor or model is not on the device its slot requires
    #[error("Device placement error for {model}: expected {expected}, found {actual}")]
    DevicePlacement {
        model: String,
        expected: String,
        actual: String,
    },

    /// The dataset index references a file that does not exist
    #[error("Missing file: {0}")]
    MissingFile(PathBuf),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Saving or loading model weights failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Error decoding or encoding an image volume
    #[error("Failed to process image at '{0}': {1}")]
    Image(PathBuf, String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoTrainError {
    /// Build a [`CoTrainError::ShapeMismatch`] from two dimension slices
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<serde_json::Error> for CoTrainError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<csv::Error> for CoTrainError {
    fn from(e: csv::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience Result type for co-training operations
pub type Result<T> = std::result::Result<T, CoTrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = CoTrainError::shape_mismatch("warp", &[1, 1, 4, 8, 8], &[1, 1, 4, 8, 6]);
        let msg = format!("{}", err);
        assert!(msg.contains("warp"));
        assert!(msg.contains("[1, 1, 4, 8, 6]"));
    }

    #[test]
    fn test_missing_file_display() {
        let err = CoTrainError::MissingFile(PathBuf::from("/data/gt/case_01.png"));
        assert!(format!("{}", err).contains("case_01.png"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CoTrainError = io.into();
        assert!(matches!(err, CoTrainError::Io(_)));
    }
}
