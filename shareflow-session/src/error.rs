//! Error taxonomy shared by the join, edit and cleanup paths.
//!
//! Errors produced while serving a connection are delivered only to that
//! connection (see [`crate::protocol::ErrorPayload`]); they are never
//! broadcast to the room.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

/// Why an otherwise valid request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForbiddenReason {
    /// Membership already reached the room's `max_users`.
    Capacity,
    /// The joiner's network class is not accepted for a scoped room.
    NetworkScope,
    /// The room's policy does not allow edits.
    EditDisabled,
    /// The room's policy does not allow downloads.
    DownloadDisabled,
}

impl std::fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capacity => write!(f, "share is full"),
            Self::NetworkScope => write!(f, "not on the same local network as the other participants"),
            Self::EditDisabled => write!(f, "editing is disabled for this share"),
            Self::DownloadDisabled => write!(f, "downloads are disabled for this share"),
        }
    }
}

/// Session engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("share not found")]
    NotFound,
    #[error("share has expired")]
    Expired,
    #[error("secret missing or incorrect")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(ForbiddenReason),
    #[error("data store did not answer in time")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl SessionError {
    /// Stable machine-readable code sent in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Expired => "EXPIRED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Timeout => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }

    /// Whether the client may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Forbidden(ForbiddenReason::Capacity))
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => SessionError::NotFound,
            other => SessionError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SessionError::NotFound.code(), "NOT_FOUND");
        assert_eq!(SessionError::Expired.code(), "EXPIRED");
        assert_eq!(SessionError::Unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(SessionError::Forbidden(ForbiddenReason::Capacity).code(), "FORBIDDEN");
        assert_eq!(SessionError::Timeout.code(), "TIMEOUT");
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(SessionError::Timeout.is_retryable());
        assert!(!SessionError::Unauthorized.is_retryable());
        assert!(!SessionError::Forbidden(ForbiddenReason::NetworkScope).is_retryable());
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: SessionError = StoreError::NotFound("abc".into()).into();
        assert_eq!(err, SessionError::NotFound);

        let err: SessionError = StoreError::Database("boom".into()).into();
        assert!(matches!(err, SessionError::Internal(_)));
    }

    #[test]
    fn test_forbidden_display() {
        let err = SessionError::Forbidden(ForbiddenReason::Capacity);
        assert!(err.to_string().contains("full"));
    }
}
