//! Error types for matting and interactive segmentation operations

use thiserror::Error;

/// Result type alias for clearcut operations
pub type Result<T> = std::result::Result<T, ClearcutError>;

/// Error taxonomy shared by the batch and interactive pipelines
#[derive(Error, Debug)]
pub enum ClearcutError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Backend inference errors (malformed model output, runtime failures)
    #[error("Inference error: {0}")]
    Inference(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Model loading or initialization errors
    #[error("Model error: {0}")]
    Model(String),

    /// Per-item processing errors (buffer allocation, shape mismatch)
    #[error("Processing error: {0}")]
    Processing(String),

    /// Interactive decode errors; the session stays usable
    #[error("Decode error: {0}")]
    Decode(String),

    /// Worker context is gone or its channel closed
    #[error("Worker error: {0}")]
    Worker(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClearcutError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new worker error
    pub fn worker<S: Into<String>>(msg: S) -> Self {
        Self::Worker(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Create model initialization error with provider context
    pub fn inference_error_with_provider(
        provider: &str,
        operation: &str,
        error: &str,
        fallback_suggestions: &[&str],
    ) -> Self {
        let suggestions = if fallback_suggestions.is_empty() {
            String::new()
        } else {
            format!(" Try: {}", fallback_suggestions.join(" or "))
        };

        Self::Model(format!(
            "{} failed using '{}' provider: {}.{}",
            operation, provider, error, suggestions
        ))
    }

    /// Create processing error with stage context
    pub fn processing_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {})", info),
            None => String::new(),
        };

        Self::Processing(format!(
            "Processing failed at stage '{}'{}: {}",
            stage, input_context, details
        ))
    }

    /// Whether this error only concerns the current decode and can be retried
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Model(_) | Self::Worker(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ClearcutError::invalid_config("test config error");
        assert!(matches!(err, ClearcutError::InvalidConfig(_)));

        let err = ClearcutError::decode("no embedding");
        assert!(matches!(err, ClearcutError::Decode(_)));
    }

    #[test]
    fn test_error_display() {
        let err = ClearcutError::invalid_config("Invalid radius");
        assert_eq!(err.to_string(), "Invalid configuration: Invalid radius");
    }

    #[test]
    fn test_enhanced_error_context() {
        let err = ClearcutError::config_value_error("alpha floor", 1.5, "0.0-1.0", Some(0.2));
        let error_string = err.to_string();
        assert!(error_string.contains("alpha floor"));
        assert!(error_string.contains("1.5"));
        assert!(error_string.contains("Recommended: 0.2"));

        let err = ClearcutError::inference_error_with_provider(
            "gpu",
            "Model initialization",
            "device lost",
            &["cpu provider"],
        );
        let error_string = err.to_string();
        assert!(error_string.contains("gpu"));
        assert!(error_string.contains("Try: cpu provider"));

        let err = ClearcutError::processing_stage_error(
            "mask_resize",
            "mask has zero width",
            Some("640x480 RGB"),
        );
        let error_string = err.to_string();
        assert!(error_string.contains("mask_resize"));
        assert!(error_string.contains("640x480 RGB"));
    }

    #[test]
    fn test_recoverability() {
        assert!(ClearcutError::decode("bad index").is_recoverable());
        assert!(ClearcutError::processing("bad mask").is_recoverable());
        assert!(!ClearcutError::model("load failed").is_recoverable());
        assert!(!ClearcutError::worker("terminated").is_recoverable());
    }
}
