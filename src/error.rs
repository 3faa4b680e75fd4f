//! Errors surfaced to callers of the discovery engine.

use crate::discovery::BackendError;
use crate::plugins::token::TokenError;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Missing, invalid or mismatched plugin token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Plugin registration rejected: unreachable callback or bad credential.
    #[error("admission failed: {0}")]
    Admission(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<StorageError> for DiscoveryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => DiscoveryError::Conflict(msg),
            StorageError::NotFound(msg) => DiscoveryError::NotFound(msg),
            other => DiscoveryError::Storage(other),
        }
    }
}

impl From<TokenError> for DiscoveryError {
    fn from(err: TokenError) -> Self {
        DiscoveryError::Unauthorized(err.to_string())
    }
}
