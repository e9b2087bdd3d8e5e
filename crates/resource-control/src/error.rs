//! Controller error types

use thiserror::Error;

/// Errors surfaced by the resource group controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The resource group spec is missing, incomplete or uses a mode the
    /// client does not support.
    #[error("resource group configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// Token reservations could not be satisfied within the retry budget.
    #[error("resource group request throttled")]
    Throttled,

    /// The admission call was cancelled or ran past its deadline.
    #[error("admission cancelled")]
    Cancelled,

    /// The resource manager provider failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// `stop` was called on a controller that was never started.
    #[error("resource group controller not started")]
    NotStarted,

    /// Payload decoding error, e.g. a malformed RU config item.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControllerError::ConfigUnavailable("not configured".to_string());
        assert!(format!("{err}").contains("not configured"));

        let err = ControllerError::Throttled;
        assert!(format!("{err}").contains("throttled"));

        let err = ControllerError::Provider("rpc failed".to_string());
        assert!(format!("{err}").contains("rpc failed"));

        let err = ControllerError::NotStarted;
        assert!(format!("{err}").contains("not started"));
    }

    #[test]
    fn test_serialization_error_from() {
        let json_err = serde_json::from_str::<i32>("not json").unwrap_err();
        let err: ControllerError = json_err.into();
        assert!(matches!(err, ControllerError::Serialization(_)));
    }
}
