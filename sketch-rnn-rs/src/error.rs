//! Error types for the Sketch-RNN crate.

use thiserror::Error;

/// Result type for Sketch-RNN operations.
pub type SketchResult<T> = Result<T, SketchError>;

/// Errors that can occur while building, training or sampling the model.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SketchError {
    /// Tensor operation failed
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Training error
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint save/restore error
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Dataset loading error
    #[error("data error: {0}")]
    Data(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Progress bar template error
    #[error("progress template error: {0}")]
    Template(String),
}

impl SketchError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for SketchError {
    fn from(e: indicatif::style::TemplateError) -> Self {
        Self::Template(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = SketchError::shape_mismatch("[T, B, 5]", "[T, B, 3]");
        assert_eq!(
            err.to_string(),
            "shape mismatch: expected [T, B, 5], got [T, B, 3]"
        );
    }

    #[test]
    fn test_helper_constructors() {
        assert_eq!(
            SketchError::invalid_config("d_z must be > 0").to_string(),
            "invalid configuration: d_z must be > 0"
        );
        assert_eq!(
            SketchError::data("empty split").to_string(),
            "data error: empty split"
        );
        assert_eq!(
            SketchError::checkpoint("missing encoder").to_string(),
            "checkpoint error: missing encoder"
        );
        assert_eq!(
            SketchError::training("lock poisoned").to_string(),
            "training error: lock poisoned"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "strokes.json");
        let err: SketchError = io.into();
        assert!(matches!(err, SketchError::Io(_)));
        assert!(err.to_string().contains("strokes.json"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SketchError = parse.into();
        assert!(matches!(err, SketchError::Serde(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let parse = serde_yaml::from_str::<Vec<u32>>("a: [").unwrap_err();
        let err: SketchError = parse.into();
        assert!(matches!(err, SketchError::Yaml(_)));
    }
}
