//! Error types for preload operations

use crate::ToolId;
use thiserror::Error;

/// Result type for preload operations
pub type Result<T> = std::result::Result<T, PreloadError>;

/// Errors that can occur while preloading or persisting usage state
///
/// Every variant owns plain data so a single outcome can be cloned out to
/// all callers awaiting the same identifier.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreloadError {
    /// The registered loader function returned an error
    #[error("Loader for '{id}' failed: {message}")]
    LoaderFailed { id: ToolId, message: String },

    /// The loader did not settle within the configured timeout
    #[error("Load of '{id}' timed out after {timeout_ms}ms")]
    Timeout { id: ToolId, timeout_ms: u64 },

    /// The pending load was dropped before it settled (e.g. by `cleanup`)
    #[error("Preload of '{0}' was abandoned before it settled")]
    Abandoned(ToolId),

    /// Key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl PreloadError {
    /// Check if the caller may retry the same identifier
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PreloadError::LoaderFailed { .. }
                | PreloadError::Timeout { .. }
                | PreloadError::Abandoned(_)
        )
    }

    /// Identifier the error refers to, if any
    pub fn tool_id(&self) -> Option<&ToolId> {
        match self {
            PreloadError::LoaderFailed { id, .. } => Some(id),
            PreloadError::Timeout { id, .. } => Some(id),
            PreloadError::Abandoned(id) => Some(id),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PreloadError {
    fn from(e: std::io::Error) -> Self {
        PreloadError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PreloadError {
    fn from(e: serde_json::Error) -> Self {
        PreloadError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let failed = PreloadError::LoaderFailed {
            id: "json-formatter".into(),
            message: "chunk missing".into(),
        };
        assert!(failed.is_retryable());
        assert_eq!(failed.tool_id().map(ToolId::as_str), Some("json-formatter"));

        let storage = PreloadError::Storage("quota exceeded".into());
        assert!(!storage.is_retryable());
        assert!(storage.tool_id().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = PreloadError::Timeout {
            id: "qr-code-generator".into(),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Load of 'qr-code-generator' timed out after 5000ms"
        );
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let converted: PreloadError = err.into();
        assert!(matches!(converted, PreloadError::Serialization(_)));
    }
}
