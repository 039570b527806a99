//! In-process metadata store.
//!
//! Every operation runs under one mutex guard, which gives the same
//! per-row atomicity the SQLite store gets from its writer lock. Used by tests
//! and by local runs that do not need durability.

use super::{MetadataStore, StorageTotals, StoreError, StoreResult};
use crate::models::{Artifact, ArtifactStatus, Token, TokenGrant};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    artifacts: HashMap<Uuid, Artifact>,
    tokens: HashMap<String, Token>,
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: Mutex<Tables>,
    increment_delay: Mutex<Duration>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every usage increment for `delay` before it applies, like a write
    /// queued behind another writer that eventually commits.
    pub fn delay_increments(&self, delay: Duration) {
        if let Ok(mut slot) = self.increment_delay.lock() {
            *slot = delay;
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".into()))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn artifact_exists(&self, uuid: Uuid) -> StoreResult<bool> {
        Ok(self.lock()?.artifacts.contains_key(&uuid))
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if tables.artifacts.contains_key(&artifact.uuid) {
            return Err(StoreError::Conflict(format!("artifact {}", artifact.uuid)));
        }
        tables.artifacts.insert(artifact.uuid, artifact.clone());
        Ok(())
    }

    async fn get_artifact(&self, uuid: Uuid) -> StoreResult<Option<Artifact>> {
        Ok(self.lock()?.artifacts.get(&uuid).cloned())
    }

    async fn list_artifacts(&self) -> StoreResult<Vec<Artifact>> {
        let mut rows: Vec<Artifact> = self.lock()?.artifacts.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_artifacts_by_status(
        &self,
        status: ArtifactStatus,
    ) -> StoreResult<Vec<Artifact>> {
        let mut rows: Vec<Artifact> = self
            .lock()?
            .artifacts
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn transition_status(
        &self,
        uuid: Uuid,
        from: ArtifactStatus,
        to: ArtifactStatus,
        stored_size: Option<i64>,
    ) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        match tables.artifacts.get_mut(&uuid) {
            Some(artifact) if artifact.status == from => {
                artifact.status = to;
                if stored_size.is_some() {
                    artifact.stored_size = stored_size;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_artifact(&self, uuid: Uuid) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        tables.tokens.retain(|_, t| t.artifact_uuid != uuid);
        Ok(tables.artifacts.remove(&uuid).is_some())
    }

    async fn storage_totals(&self) -> StoreResult<StorageTotals> {
        let tables = self.lock()?;
        Ok(StorageTotals {
            file_count: tables.artifacts.len() as i64,
            used_space: tables
                .artifacts
                .values()
                .map(|a| a.stored_size.unwrap_or(a.size))
                .sum(),
        })
    }

    async fn insert_token(&self, token: &Token) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if !tables.artifacts.contains_key(&token.artifact_uuid) {
            return Err(StoreError::Backend(format!(
                "foreign key violation: artifact {} missing",
                token.artifact_uuid
            )));
        }
        if tables.tokens.contains_key(&token.token) {
            return Err(StoreError::Conflict("token".into()));
        }
        tables.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn get_token_grant(&self, token: &str) -> StoreResult<Option<TokenGrant>> {
        let tables = self.lock()?;
        let Some(row) = tables.tokens.get(token) else {
            return Ok(None);
        };
        Ok(tables
            .artifacts
            .get(&row.artifact_uuid)
            .map(|artifact| TokenGrant {
                token: row.clone(),
                filename: artifact.filename.clone(),
                content_type: artifact.content_type.clone(),
                artifact_status: artifact.status,
            }))
    }

    async fn increment_usage_if_below_quota(&self, token: &str) -> StoreResult<bool> {
        let delay = self
            .increment_delay
            .lock()
            .map(|slot| *slot)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut tables = self.lock()?;
        match tables.tokens.get_mut(token) {
            Some(row) if row.max_uses.is_none_or(|max| row.current_uses < max) => {
                row.current_uses += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refund_usage(&self, token: &str) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if let Some(row) = tables.tokens.get_mut(token) {
            if row.current_uses > 0 {
                row.current_uses -= 1;
            }
        }
        Ok(())
    }
}
