//! Represents an artifact, a stored binary object plus its metadata record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Upload-completion state of an artifact.
///
/// `Pending` is the only non-terminal state. An artifact leaves it at most
/// once, either to `Uploaded` (bytes confirmed in the object store) or to
/// `Expired` (abandoned past the staleness threshold).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum ArtifactStatus {
    Pending,
    Uploaded,
    Expired,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "PENDING",
            ArtifactStatus::Uploaded => "UPLOADED",
            ArtifactStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ArtifactStatus::Pending)
    }

    /// Whether `self -> next` is a legal edge of the status machine.
    pub fn can_transition_to(&self, next: ArtifactStatus) -> bool {
        matches!(
            (self, next),
            (ArtifactStatus::Pending, ArtifactStatus::Uploaded)
                | (ArtifactStatus::Pending, ArtifactStatus::Expired)
        )
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata row for a single artifact.
///
/// Everything except `status` and `stored_size` is immutable after insertion.
/// The payload lives in the object store under [`Artifact::storage_key`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Artifact {
    /// Globally unique identifier, assigned at creation.
    pub uuid: Uuid,

    /// Original filename supplied by the client.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: String,

    /// Size in bytes (declared for pending uploads, observed for synchronous ones).
    pub size: i64,

    /// Bytes found in the object store when the upload was confirmed. Set
    /// once, on the move to `UPLOADED`.
    pub stored_size: Option<i64>,

    /// Current lifecycle state.
    pub status: ArtifactStatus,

    /// Insertion time; the anchor for staleness checks.
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

impl Artifact {
    pub fn new(
        filename: impl Into<String>,
        content_type: Option<String>,
        size: i64,
        status: ArtifactStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            filename: filename.into(),
            content_type: content_type
                .filter(|ct| !ct.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size,
            stored_size: None,
            status,
            created_at,
        }
    }

    /// Key under which the payload is stored in the object store.
    pub fn storage_key(&self) -> String {
        storage_key(self.uuid)
    }
}

pub fn storage_key(uuid: Uuid) -> String {
    uuid.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_has_outgoing_edges() {
        use ArtifactStatus::*;
        assert!(Pending.can_transition_to(Uploaded));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Uploaded, Expired] {
            assert!(terminal.is_terminal());
            for next in [Pending, Uploaded, Expired] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn blank_content_type_falls_back_to_octet_stream() {
        let artifact = Artifact::new("a.bin", Some("  ".into()), 3, ArtifactStatus::Pending, Utc::now());
        assert_eq!(artifact.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(artifact.storage_key(), artifact.uuid.to_string());
    }
}
