use crate::{object_store::ObjectStoreError, store::StoreError};
use thiserror::Error;
use uuid::Uuid;

/// Every way an access, issuance or lifecycle operation can be declined.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact `{0}` not found")]
    NotFound(Uuid),
    #[error("invalid or unknown token")]
    InvalidToken,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token expired")]
    Expired,
    #[error("usage limit reached")]
    QuotaExceeded,
    #[error("origin not allowed")]
    OriginNotAllowed,
    /// A stored constraint cannot be interpreted; access is refused.
    #[error("invalid stored configuration: {0}")]
    InvalidConfiguration(String),
    #[error("artifact is {status}, not {required}")]
    ArtifactNotReady {
        status: &'static str,
        required: &'static str,
    },
    #[error("object for artifact `{0}` has not been uploaded yet")]
    UploadIncomplete(Uuid),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Transient metadata/object store failure; safe to retry.
    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ArtifactError {
    /// Stable machine-readable reason, surfaced to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            ArtifactError::NotFound(_) => "not_found",
            ArtifactError::InvalidToken => "invalid_token",
            ArtifactError::NotYetValid => "not_yet_valid",
            ArtifactError::Expired => "expired",
            ArtifactError::QuotaExceeded => "quota_exceeded",
            ArtifactError::OriginNotAllowed => "origin_not_allowed",
            ArtifactError::InvalidConfiguration(_) => "invalid_configuration",
            ArtifactError::ArtifactNotReady { .. } => "artifact_not_ready",
            ArtifactError::UploadIncomplete(_) => "upload_incomplete",
            ArtifactError::InvalidRequest(_) => "invalid_request",
            ArtifactError::StoreUnavailable(_) => "store_unavailable",
            ArtifactError::InternalError(_) => "internal_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ArtifactError::StoreUnavailable(_))
    }

    /// Failures of the service or its stores rather than of the request.
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            ArtifactError::StoreUnavailable(_)
                | ArtifactError::InvalidConfiguration(_)
                | ArtifactError::InternalError(_)
        )
    }
}

impl From<StoreError> for ArtifactError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ArtifactError::StoreUnavailable(msg),
            StoreError::Conflict(msg) | StoreError::Backend(msg) => {
                ArtifactError::InternalError(msg)
            }
        }
    }
}

impl From<ObjectStoreError> for ArtifactError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::InvalidKey | ObjectStoreError::Body(_) => {
                ArtifactError::InvalidRequest(err.to_string())
            }
            ObjectStoreError::NotFound(_) => ArtifactError::InternalError(err.to_string()),
            ObjectStoreError::Unavailable(_) | ObjectStoreError::Io(_) => {
                ArtifactError::StoreUnavailable(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn broken_request_bodies_are_not_retryable() {
        let body = ArtifactError::from(ObjectStoreError::Body(io::Error::other("eof")));
        assert!(matches!(body, ArtifactError::InvalidRequest(_)));
        assert!(!body.is_retryable());

        let disk = ArtifactError::from(ObjectStoreError::Io(io::Error::other("disk full")));
        assert!(disk.is_retryable());
    }
}
