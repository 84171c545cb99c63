//! CRD validation errors

use thiserror::Error;

/// Errors raised while validating or interpreting DevServer resources.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdError {
    /// A spec field is missing or has an invalid value
    #[error("Invalid spec: {0}")]
    Validation(String),

    /// A duration string could not be parsed
    #[error("Invalid duration '{0}': {1}")]
    Duration(String, String),

    /// A resource quantity could not be parsed
    #[error("Invalid quantity '{0}'")]
    Quantity(String),
}
