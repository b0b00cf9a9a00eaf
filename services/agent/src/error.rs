//! Error types for the agent.

use tether_resource::ResourceError;
use thiserror::Error;

/// Errors returned by a [`ResourceApi`](crate::api::ResourceApi) call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The object (or its namespace) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification or the object already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested resourceVersion is no longer retained by the store.
    #[error("resource version expired: {0}")]
    Gone(String),

    /// The API server asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// Access denied.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Any other non-success status.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },

    /// Connection, timeout or body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Map an HTTP status and message to an error.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 | 403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            410 => ApiError::Gone(message),
            429 => ApiError::Throttled(message),
            _ => ApiError::Status { code, message },
        }
    }

    /// The request itself was malformed (422 Unprocessable Entity).
    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::Status {
            code: 422,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, ApiError::Gone(_))
    }

    /// The server understood the request but could not apply it (422).
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, ApiError::Status { code: 422, .. })
    }

    /// Worth retrying unchanged after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Conflict(_) | ApiError::Throttled(_) | ApiError::Transport(_) => true,
            ApiError::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Retrying cannot succeed without outside intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApiError::Forbidden(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Errors rejected synchronously, before any background task starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Heartbeat interval must be positive.
    #[error("heartbeat interval must be greater than zero")]
    InvalidInterval,

    /// A name was required but empty.
    #[error("resource name cannot be empty")]
    EmptyName,

    /// A namespace was required but empty.
    #[error("namespace cannot be empty")]
    EmptyNamespace,

    /// The label selector cannot be expressed.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
}

impl From<ResourceError> for RegistrationError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::EmptyName => RegistrationError::EmptyName,
            ResourceError::EmptyNamespace => RegistrationError::EmptyNamespace,
            other => RegistrationError::InvalidSelector(other.to_string()),
        }
    }
}

/// Errors surfaced by the lifecycle facade.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}
