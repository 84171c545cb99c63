//! Controller-specific error types.
//!
//! The variants follow how an error is handled: terminal errors are written
//! into status conditions, retryable ones are retried with backoff.

use crds::CrdError;
use devserver_client::ClientError;
use thiserror::Error;

/// Errors that can occur in the DevServer operator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Bad or incomplete spec; needs a user edit
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced flavor or object is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// No flavor requested and none is marked default
    #[error("No flavor specified and no default DevServerFlavor exists")]
    NoDefaultFlavor,

    /// More than one default flavor observed
    #[error("Data invariant violated: {0}")]
    DataInvariantViolation(String),

    /// Stale write; refresh and retry
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network or server-side failure
    #[error("Transient API error: {0}")]
    Transient(String),

    /// Deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Watch stream broken for good
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Conflicts and transient API failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControllerError::Conflict(_) | ControllerError::Transient(_))
    }

    /// Terminal for the current event: needs an edit, not a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerError::Validation(_)
                | ControllerError::NotFound(_)
                | ControllerError::NoDefaultFlavor
                | ControllerError::DataInvariantViolation(_)
        )
    }

    /// Condition reason for status reporting
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Validation(_) => "ValidationError",
            ControllerError::NotFound(_) => "NotFound",
            ControllerError::NoDefaultFlavor => "NoDefaultFlavor",
            ControllerError::DataInvariantViolation(_) => "DataInvariantViolation",
            ControllerError::Conflict(_) => "Conflict",
            ControllerError::Transient(_) => "TransientAPIError",
            ControllerError::Timeout(_) => "Timeout",
            ControllerError::Stream(_) => "StreamError",
            ControllerError::InvalidConfig(_) => "InvalidConfig",
            ControllerError::Watch(_) => "WatchError",
        }
    }
}

impl From<ClientError> for ControllerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(msg) => ControllerError::NotFound(msg),
            ClientError::Conflict(msg) => ControllerError::Conflict(msg),
            ClientError::Invalid(msg) | ClientError::Validation(msg) => {
                ControllerError::Validation(msg)
            }
            ClientError::Timeout(msg) => ControllerError::Timeout(msg),
            ClientError::Stream(msg) => ControllerError::Stream(msg),
            ClientError::Forbidden(msg) => ControllerError::Transient(format!("forbidden: {}", msg)),
            ClientError::Transient(msg)
            | ClientError::Exec(msg)
            | ClientError::Io(msg)
            | ClientError::Serialization(msg) => ControllerError::Transient(msg),
        }
    }
}

impl From<CrdError> for ControllerError {
    fn from(err: CrdError) -> Self {
        ControllerError::Validation(err.to_string())
    }
}
