//! SQLite-backed metadata store.
//!
//! All conditional writes are single `UPDATE ... WHERE` statements, so
//! SQLite's writer lock is the serialization point for both the token quota
//! and artifact status transitions.

use super::{MetadataStore, StorageTotals, StoreError, StoreResult};
use crate::models::{Artifact, ArtifactStatus, Token, TokenGrant};
use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use tracing::debug;
use uuid::Uuid;

const ARTIFACT_COLUMNS: &str =
    "uuid, filename, content_type, size, stored_size, status, created_at";

#[derive(Clone, Debug)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Open (creating if needed) the database at `database_url` and apply
    /// the embedded migrations.
    ///
    /// `statement_timeout` bounds both waiting for a pooled connection and
    /// waiting on another writer's lock. A statement that runs out of time
    /// fails inside SQLite and leaves nothing behind, so callers do not need
    /// to cancel writes from outside.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        statement_timeout: Duration,
    ) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(statement_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(statement_timeout)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(format!("migration failed: {err}")))?;
        debug!("metadata schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn ping(&self) -> StoreResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        if one == 1 {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("unexpected ping result: {one}")))
        }
    }

    async fn artifact_exists(&self, uuid: Uuid) -> StoreResult<bool> {
        let exists: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM artifacts WHERE uuid = ?)")
                .bind(uuid)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists != 0)
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO artifacts (uuid, filename, content_type, size, stored_size, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(artifact.uuid)
        .bind(&artifact.filename)
        .bind(&artifact.content_type)
        .bind(artifact.size)
        .bind(artifact.stored_size)
        .bind(artifact.status)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_artifact(&self, uuid: Uuid) -> StoreResult<Option<Artifact>> {
        let artifact = sqlx::query_as::<_, Artifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(artifact)
    }

    async fn list_artifacts(&self) -> StoreResult<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, Artifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_artifacts_by_status(
        &self,
        status: ArtifactStatus,
    ) -> StoreResult<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, Artifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE status = ? ORDER BY created_at ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn transition_status(
        &self,
        uuid: Uuid,
        from: ArtifactStatus,
        to: ArtifactStatus,
        stored_size: Option<i64>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE artifacts SET status = ?, stored_size = COALESCE(?, stored_size)
             WHERE uuid = ? AND status = ?",
        )
        .bind(to)
        .bind(stored_size)
        .bind(uuid)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_artifact(&self, uuid: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tokens WHERE artifact_uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM artifacts WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn storage_totals(&self) -> StoreResult<StorageTotals> {
        let (file_count, used_space): (i64, i64) =
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(COALESCE(stored_size, size)), 0) FROM artifacts",
            )
                .fetch_one(&self.pool)
                .await?;
        Ok(StorageTotals {
            file_count,
            used_space,
        })
    }

    async fn insert_token(&self, token: &Token) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tokens (
                token, artifact_uuid, kind, valid_from, valid_to,
                max_uses, current_uses, allowed_cidr, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&token.token)
        .bind(token.artifact_uuid)
        .bind(token.kind)
        .bind(token.valid_from)
        .bind(token.valid_to)
        .bind(token.max_uses)
        .bind(token.current_uses)
        .bind(token.allowed_cidr.as_deref())
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_token_grant(&self, token: &str) -> StoreResult<Option<TokenGrant>> {
        let grant = sqlx::query_as::<_, TokenGrant>(
            "SELECT t.token, t.artifact_uuid, t.kind, t.valid_from, t.valid_to,
                    t.max_uses, t.current_uses, t.allowed_cidr, t.created_at,
                    a.filename, a.content_type, a.status AS artifact_status
             FROM tokens t
             JOIN artifacts a ON a.uuid = t.artifact_uuid
             WHERE t.token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(grant)
    }

    async fn increment_usage_if_below_quota(&self, token: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE tokens SET current_uses = current_uses + 1
             WHERE token = ? AND (max_uses IS NULL OR current_uses < max_uses)",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refund_usage(&self, token: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE tokens SET current_uses = current_uses - 1
             WHERE token = ? AND current_uses > 0",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => StoreError::Unavailable(err.to_string()),
            _ if is_unique_violation(&err) => StoreError::Conflict(err.to_string()),
            _ if is_busy(&err) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// SQLite reports writer contention past the busy timeout as "database is locked".
fn is_busy(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if {
            let message = db_err.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
    )
}
