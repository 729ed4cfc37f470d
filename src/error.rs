//! Central error types for the netsync operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

/// Central error type for the netsync operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP transport error talking to the network backend
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The network backend answered with a non-success status
    #[error("Backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    /// A backend call did not complete within the configured timeout
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Something this resource depends on has not been realized yet
    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    /// The backend accepted a write but the realized object is missing data
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The resource can never be realized as declared; retrying will not help
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The backend does not support a feature required by this resource kind
    #[error("Unsupported backend: {0}")]
    Unsupported(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Error::Rejected(_) | Error::ConfigError(_))
    }

    /// Whether this is a 404 from either the Kubernetes API or the backend
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            Error::Backend { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::Backend { status, message } => {
                format!("Backend request failed with HTTP {}: {}", status, message)
            }
            Error::HttpError(e) => format!("Backend unreachable: {}", e),
            Error::Timeout(d) => format!("Backend did not answer within {}s", d.as_secs()),
            Error::DependencyNotReady(msg) => format!("Waiting for dependency: {}", msg),
            Error::Rejected(msg) => msg.clone(),
            _ => self.to_string(),
        }
    }
}
