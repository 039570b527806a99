//! Represents bearer access tokens scoped to a single artifact.

use super::artifact::ArtifactStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What a token authorizes: fetching the payload or writing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TokenKind {
    Download,
    Upload,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Download => "DOWNLOAD",
            TokenKind::Upload => "UPLOAD",
        }
    }

    /// Artifact status a redemption of this kind requires.
    pub fn required_status(&self) -> ArtifactStatus {
        match self {
            TokenKind::Download => ArtifactStatus::Uploaded,
            TokenKind::Upload => ArtifactStatus::Pending,
        }
    }

    /// Path segment (relative to the public base URL) where the token is redeemed.
    pub fn access_path(&self, token: &str) -> String {
        match self {
            TokenKind::Download => format!("/artifacts/{token}"),
            TokenKind::Upload => format!("/artifacts/upload/{token}"),
        }
    }
}

/// A persisted token row.
///
/// `current_uses` is the only mutable field. It changes exclusively through
/// the store's atomic increment-if-below-quota operation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Token {
    /// Unguessable bearer credential.
    pub token: String,

    /// The single artifact this token grants access to.
    pub artifact_uuid: Uuid,

    pub kind: TokenKind,

    /// Inclusive lower bound of the validity window.
    pub valid_from: Option<DateTime<Utc>>,

    /// Exclusive upper bound of the validity window.
    pub valid_to: Option<DateTime<Utc>>,

    /// `max_downloads` / `max_uploads`; `None` means unlimited.
    pub max_uses: Option<i64>,

    /// Successful redemptions so far.
    pub current_uses: i64,

    /// Optional CIDR block the caller must originate from.
    pub allowed_cidr: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Caller-supplied restrictions attached to a token at issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenConstraints {
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub max_uses: Option<i64>,
    pub allowed_cidr: Option<String>,
}

/// Token row joined with the fields of its artifact that redemption needs.
#[derive(Clone, FromRow, Debug)]
pub struct TokenGrant {
    #[sqlx(flatten)]
    pub token: Token,
    pub filename: String,
    pub content_type: String,
    pub artifact_status: ArtifactStatus,
}
