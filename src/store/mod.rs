//! Metadata store: durable artifact and token rows.
//!
//! The [`MetadataStore`] trait is the only way services touch metadata. Every
//! mutation it exposes is a single atomic statement: status changes are
//! compare-and-set on the current status, and token usage is an
//! increment-if-below-quota checked by the store itself.

use crate::models::{Artifact, ArtifactStatus, Token, TokenGrant};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient failure: pool exhausted, database locked, connection lost.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate key: {0}")]
    Conflict(String),
    #[error("metadata store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Aggregate figures for the storage usage report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageTotals {
    pub file_count: i64,
    pub used_space: i64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> StoreResult<()>;

    async fn artifact_exists(&self, uuid: Uuid) -> StoreResult<bool>;

    async fn insert_artifact(&self, artifact: &Artifact) -> StoreResult<()>;

    async fn get_artifact(&self, uuid: Uuid) -> StoreResult<Option<Artifact>>;

    /// All artifacts, newest first.
    async fn list_artifacts(&self) -> StoreResult<Vec<Artifact>>;

    async fn list_artifacts_by_status(&self, status: ArtifactStatus)
    -> StoreResult<Vec<Artifact>>;

    /// Move `uuid` from `from` to `to` only if it is still in `from`,
    /// recording `stored_size` in the same write when given.
    ///
    /// Returns `false` when the row is missing or another writer changed the
    /// status first.
    async fn transition_status(
        &self,
        uuid: Uuid,
        from: ArtifactStatus,
        to: ArtifactStatus,
        stored_size: Option<i64>,
    ) -> StoreResult<bool>;

    /// Remove the artifact row and every token that references it.
    async fn delete_artifact(&self, uuid: Uuid) -> StoreResult<bool>;

    async fn storage_totals(&self) -> StoreResult<StorageTotals>;

    async fn insert_token(&self, token: &Token) -> StoreResult<()>;

    async fn get_token_grant(&self, token: &str) -> StoreResult<Option<TokenGrant>>;

    /// Atomically add one use to `token` unless its quota is exhausted.
    ///
    /// Returns `true` when the counter moved.
    async fn increment_usage_if_below_quota(&self, token: &str) -> StoreResult<bool>;

    /// Undo one use after a redemption failed past the increment.
    async fn refund_usage(&self, token: &str) -> StoreResult<()>;
}
