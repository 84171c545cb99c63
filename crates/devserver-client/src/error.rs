//! Cluster client errors

use thiserror::Error;

/// Errors returned by cluster API operations
///
/// Kubernetes API failures are classified by status code so callers can
/// decide between terminal handling and retry without inspecting raw responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Object does not exist (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stale write rejected by optimistic concurrency (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller lacks permission (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// API server rejected the object (400/422)
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Network failure or server-side error; worth retrying
    #[error("Transient API error: {0}")]
    Transient(String),

    /// Deadline passed while waiting on the cluster
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Watch stream broken after exhausting reconnect attempts
    #[error("Stream error: {0}")]
    Stream(String),

    /// Client-side validation rejected the request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote command could not be run
    #[error("Exec error: {0}")]
    Exec(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON conversion failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Whether a retry with a fresh read may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::Transient(_))
    }

    /// Whether this error is a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => {
                let msg = format!("{} ({})", ae.message, ae.reason);
                match ae.code {
                    404 => ClientError::NotFound(msg),
                    409 => ClientError::Conflict(msg),
                    403 => ClientError::Forbidden(msg),
                    400 | 422 => ClientError::Invalid(msg),
                    _ => ClientError::Transient(msg),
                }
            }
            kube::Error::SerdeError(e) => ClientError::Serialization(e.to_string()),
            other => ClientError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<crds::CrdError> for ClientError {
    fn from(err: crds::CrdError) -> Self {
        ClientError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_status_code_classification() {
        assert!(matches!(ClientError::from(api_error(404)), ClientError::NotFound(_)));
        assert!(matches!(ClientError::from(api_error(409)), ClientError::Conflict(_)));
        assert!(matches!(ClientError::from(api_error(403)), ClientError::Forbidden(_)));
        assert!(matches!(ClientError::from(api_error(422)), ClientError::Invalid(_)));
        assert!(matches!(ClientError::from(api_error(503)), ClientError::Transient(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::Conflict("x".into()).is_retryable());
        assert!(ClientError::Transient("x".into()).is_retryable());
        assert!(!ClientError::NotFound("x".into()).is_retryable());
        assert!(!ClientError::Validation("x".into()).is_retryable());
    }
}
