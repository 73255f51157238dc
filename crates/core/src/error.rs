use serde::{Deserialize, Serialize};

/// Storage errors surfaced to callers of the dual writer and the adapters.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageError {
    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },
    #[error("{resource} \"{name}\" already exists")]
    AlreadyExists { resource: String, name: String },
    #[error(
        "operation cannot be fulfilled on {resource} \"{name}\": the object has been modified; \
         please apply your changes to the latest version and try again"
    )]
    Conflict { resource: String, name: String, expected: String, current: String },
    #[error("forbidden: {verb} on {resource}: {reason}")]
    Forbidden { verb: String, resource: String, reason: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{backend} backend unavailable: {message}")]
    Unavailable { backend: String, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal: {0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn not_found(resource: &str, name: &str) -> Self {
        StorageError::NotFound { resource: resource.to_string(), name: name.to_string() }
    }

    pub fn already_exists(resource: &str, name: &str) -> Self {
        StorageError::AlreadyExists { resource: resource.to_string(), name: name.to_string() }
    }

    pub fn conflict(resource: &str, name: &str, expected: &str, current: &str) -> Self {
        StorageError::Conflict {
            resource: resource.to_string(),
            name: name.to_string(),
            expected: expected.to_string(),
            current: current.to_string(),
        }
    }

    pub fn unavailable(backend: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        StorageError::Unavailable { backend: backend.to_string(), message: message.to_string() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StorageError::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StorageError::Conflict { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StorageError::AlreadyExists { .. }) }

    /// Short machine-readable reason, used as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "NotFound",
            StorageError::AlreadyExists { .. } => "AlreadyExists",
            StorageError::Conflict { .. } => "Conflict",
            StorageError::Forbidden { .. } => "Forbidden",
            StorageError::BadRequest(_) => "BadRequest",
            StorageError::Unavailable { .. } => "ServiceUnavailable",
            StorageError::Cancelled => "Cancelled",
            StorageError::DeadlineExceeded => "Timeout",
            StorageError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status the API framing should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            StorageError::NotFound { .. } => 404,
            StorageError::AlreadyExists { .. } | StorageError::Conflict { .. } => 409,
            StorageError::Forbidden { .. } => 403,
            StorageError::BadRequest(_) => 400,
            StorageError::Unavailable { .. } => 503,
            StorageError::Cancelled => 499,
            StorageError::DeadlineExceeded => 504,
            StorageError::Internal(_) => 500,
        }
    }
}
