#![allow(dead_code)]

use artifact_service::{
    models::{Artifact, TokenConstraints, TokenKind},
    object_store::{ByteStream, MemoryObjectStore},
    services::{ArtifactService, CoreConfig, Reconciler, TokenEngine},
    store::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::{StreamExt, stream};
use std::{sync::Arc, time::Duration as StdDuration};
use tempfile::TempDir;

pub const BASE_URL: &str = "http://artifacts.test";

/// Fixed reference instant so window arithmetic is exact.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}

pub fn core_config() -> CoreConfig {
    CoreConfig {
        store_timeout: StdDuration::from_millis(250),
        ..CoreConfig::default()
    }
}

pub fn body(bytes: &'static [u8]) -> ByteStream<'static> {
    stream::once(async move { Ok(Bytes::from_static(bytes)) }).boxed()
}

pub struct Harness {
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub tokens: TokenEngine,
    pub artifacts: ArtifactService,
    pub reconciler: Reconciler,
    /// Concrete handles for tests that reach below the trait.
    pub memory_store: Option<Arc<MemoryMetadataStore>>,
    pub sqlite_store: Option<SqliteMetadataStore>,
    /// Keeps a SQLite database directory alive for the test's duration.
    _dir: Option<TempDir>,
}

impl Harness {
    fn build(metadata: Arc<dyn MetadataStore>, config: CoreConfig) -> Self {
        let objects = Arc::new(MemoryObjectStore::new());
        Self {
            tokens: TokenEngine::new(metadata.clone(), objects.clone(), config),
            artifacts: ArtifactService::new(metadata.clone(), objects.clone(), config),
            reconciler: Reconciler::new(metadata.clone(), objects.clone(), config),
            metadata,
            objects,
            memory_store: None,
            sqlite_store: None,
            _dir: None,
        }
    }

    pub fn memory() -> Self {
        Self::memory_with(core_config())
    }

    pub fn memory_with(config: CoreConfig) -> Self {
        let store = Arc::new(MemoryMetadataStore::new());
        Self {
            memory_store: Some(store.clone()),
            ..Self::build(store, config)
        }
    }

    pub async fn sqlite() -> Self {
        Self::sqlite_with(CoreConfig {
            store_timeout: StdDuration::from_secs(10),
            ..CoreConfig::default()
        })
        .await
    }

    pub async fn sqlite_with(config: CoreConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let store = SqliteMetadataStore::connect(&url, 8, config.store_timeout)
            .await
            .unwrap();
        Self {
            sqlite_store: Some(store.clone()),
            _dir: Some(dir),
            ..Self::build(Arc::new(store), config)
        }
    }

    pub async fn uploaded(&self, now: DateTime<Utc>) -> Artifact {
        self.artifacts
            .upload("build.tar.gz", None, body(b"payload"), now)
            .await
            .unwrap()
    }

    pub async fn pending(&self, now: DateTime<Utc>) -> Artifact {
        self.artifacts
            .create_pending("build.tar.gz", None, 7, now)
            .await
            .unwrap()
            .0
    }

    pub async fn download_token(&self, artifact: &Artifact, constraints: TokenConstraints) -> String {
        self.tokens
            .issue(artifact.uuid, TokenKind::Download, constraints, BASE_URL, t0())
            .await
            .unwrap()
            .token
    }

    pub async fn uses(&self, token: &str) -> i64 {
        self.metadata
            .get_token_grant(token)
            .await
            .unwrap()
            .unwrap()
            .token
            .current_uses
    }

    pub async fn status(&self, artifact: &Artifact) -> artifact_service::models::ArtifactStatus {
        self.metadata
            .get_artifact(artifact.uuid)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}
