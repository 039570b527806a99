//! Artifact lifecycle: synchronous upload, pending (presigned) upload,
//! completion, reads and deletion.

use super::{ArtifactError, CoreConfig, bounded, transition};
use crate::{
    models::{Artifact, ArtifactStatus},
    object_store::{ByteStream, ObjectBody, ObjectStore, PresignMethod, PresignedUrl},
    store::MetadataStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage consumption report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
    pub total_space: i64,
    pub used_space: i64,
    pub remaining_space: i64,
    pub usage_percent: f64,
    pub file_count: i64,
}

impl StorageUsage {
    pub fn new(total_space: i64, used_space: i64, file_count: i64) -> Self {
        let usage_percent = if total_space > 0 {
            let pct = used_space as f64 / total_space as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            total_space,
            used_space,
            remaining_space: (total_space - used_space).max(0),
            usage_percent,
            file_count,
        }
    }
}

#[derive(Clone)]
pub struct ArtifactService {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    config: CoreConfig,
}

impl ArtifactService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        config: CoreConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            config,
        }
    }

    /// Store `body` and record the artifact as `UPLOADED`.
    ///
    /// The bytes land first. If the row cannot be written the object is
    /// removed again so no orphan payload is left behind.
    pub async fn upload(
        &self,
        filename: &str,
        content_type: Option<String>,
        body: ByteStream<'_>,
        now: DateTime<Utc>,
    ) -> Result<Artifact, ArtifactError> {
        let filename = validate_filename(filename)?;
        let mut artifact = Artifact::new(filename, content_type, 0, ArtifactStatus::Uploaded, now);
        let key = artifact.storage_key();

        // The payload transfer is paced by the client, so only the control
        // calls around it are bounded.
        let written = self
            .objects
            .put_object(&key, Some(&artifact.content_type), body)
            .await?;
        artifact.size = i64::try_from(written).unwrap_or(i64::MAX);
        artifact.stored_size = Some(artifact.size);

        let inserted = bounded(
            self.config.store_timeout,
            "insert_artifact",
            self.metadata.insert_artifact(&artifact),
        )
        .await;
        if let Err(err) = inserted {
            warn!(artifact = %artifact.uuid, error = %err, "metadata insert failed; removing object");
            if let Err(cleanup) = bounded(
                self.config.store_timeout,
                "delete_object",
                self.objects.delete_object(&key),
            )
            .await
            {
                warn!(artifact = %artifact.uuid, error = %cleanup, "orphan object left behind");
            }
            return Err(err);
        }

        info!(artifact = %artifact.uuid, size = artifact.size, "artifact uploaded");
        Ok(artifact)
    }

    /// Record a `PENDING` artifact and hand back a presigned PUT for the
    /// direct-to-storage upload.
    pub async fn create_pending(
        &self,
        filename: &str,
        content_type: Option<String>,
        size: i64,
        now: DateTime<Utc>,
    ) -> Result<(Artifact, PresignedUrl), ArtifactError> {
        let filename = validate_filename(filename)?;
        if size < 0 {
            return Err(ArtifactError::InvalidRequest(
                "size must not be negative".into(),
            ));
        }
        let artifact = Artifact::new(filename, content_type, size, ArtifactStatus::Pending, now);
        bounded(
            self.config.store_timeout,
            "insert_artifact",
            self.metadata.insert_artifact(&artifact),
        )
        .await?;

        let presigned = bounded(
            self.config.store_timeout,
            "presign",
            self.objects.presign(
                &artifact.storage_key(),
                PresignMethod::Put,
                self.config.presign_expiry,
            ),
        )
        .await?;

        info!(artifact = %artifact.uuid, "pending artifact created");
        Ok((artifact, presigned))
    }

    /// Confirm that the bytes of a pending artifact have landed.
    ///
    /// Idempotent: completing an `UPLOADED` artifact returns `UPLOADED`
    /// without touching the object store.
    pub async fn complete_upload(&self, uuid: Uuid) -> Result<ArtifactStatus, ArtifactError> {
        let artifact = self.get(uuid).await?;
        if artifact.status.is_terminal() {
            return match artifact.status {
                ArtifactStatus::Uploaded => Ok(ArtifactStatus::Uploaded),
                other => Err(not_ready(other, ArtifactStatus::Pending)),
            };
        }

        let stored = bounded(
            self.config.store_timeout,
            "object_size",
            self.objects.object_size(&artifact.storage_key()),
        )
        .await?;
        let Some(stored) = stored else {
            return Err(ArtifactError::UploadIncomplete(uuid));
        };
        let stored = i64::try_from(stored).unwrap_or(i64::MAX);
        if stored != artifact.size {
            debug!(artifact = %uuid, declared = artifact.size, stored, "stored size differs from declared size");
        }

        let moved = transition(
            self.metadata.as_ref(),
            self.config.store_timeout,
            uuid,
            (artifact.status, ArtifactStatus::Uploaded),
            Some(stored),
        )
        .await?;
        if moved {
            info!(artifact = %uuid, size = stored, "upload completed");
            return Ok(ArtifactStatus::Uploaded);
        }

        // Lost the compare-and-set; report whatever won.
        match self.get(uuid).await?.status {
            ArtifactStatus::Uploaded => {
                debug!(artifact = %uuid, "upload already confirmed by another writer");
                Ok(ArtifactStatus::Uploaded)
            }
            other => Err(not_ready(other, ArtifactStatus::Pending)),
        }
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Artifact, ArtifactError> {
        bounded(
            self.config.store_timeout,
            "get_artifact",
            self.metadata.get_artifact(uuid),
        )
        .await?
        .ok_or(ArtifactError::NotFound(uuid))
    }

    pub async fn list(&self) -> Result<Vec<Artifact>, ArtifactError> {
        bounded(
            self.config.store_timeout,
            "list_artifacts",
            self.metadata.list_artifacts(),
        )
        .await
    }

    /// Open an uploaded artifact for streaming through the service.
    pub async fn open(&self, uuid: Uuid) -> Result<(Artifact, ObjectBody), ArtifactError> {
        let artifact = self.get(uuid).await?;
        if artifact.status != ArtifactStatus::Uploaded {
            return Err(not_ready(artifact.status, ArtifactStatus::Uploaded));
        }
        let body = bounded(
            self.config.store_timeout,
            "get_object",
            self.objects.get_object(&artifact.storage_key()),
        )
        .await?;
        Ok((artifact, body))
    }

    /// Remove the object, then the artifact row and its tokens.
    pub async fn delete(&self, uuid: Uuid) -> Result<Artifact, ArtifactError> {
        let artifact = self.get(uuid).await?;
        bounded(
            self.config.store_timeout,
            "delete_object",
            self.objects.delete_object(&artifact.storage_key()),
        )
        .await?;
        let removed = bounded(
            self.config.store_timeout,
            "delete_artifact",
            self.metadata.delete_artifact(uuid),
        )
        .await?;
        if !removed {
            return Err(ArtifactError::NotFound(uuid));
        }
        info!(artifact = %uuid, "artifact deleted");
        Ok(artifact)
    }

    pub async fn usage(&self, total_space: i64) -> Result<StorageUsage, ArtifactError> {
        let totals = bounded(
            self.config.store_timeout,
            "storage_totals",
            self.metadata.storage_totals(),
        )
        .await?;
        Ok(StorageUsage::new(
            total_space,
            totals.used_space,
            totals.file_count,
        ))
    }
}

fn not_ready(status: ArtifactStatus, required: ArtifactStatus) -> ArtifactError {
    ArtifactError::ArtifactNotReady {
        status: status.as_str(),
        required: required.as_str(),
    }
}

fn validate_filename(filename: &str) -> Result<&str, ArtifactError> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(ArtifactError::InvalidRequest("filename is required".into()));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ArtifactError::InvalidRequest(
            "filename contains control characters".into(),
        ));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_clamps_and_rounds() {
        let usage = StorageUsage::new(1000, 333, 2);
        assert_eq!(usage.remaining_space, 667);
        assert_eq!(usage.usage_percent, 33.3);

        let over = StorageUsage::new(100, 150, 1);
        assert_eq!(over.remaining_space, 0);
        assert_eq!(over.usage_percent, 150.0);

        let unbounded = StorageUsage::new(0, 10, 1);
        assert_eq!(unbounded.usage_percent, 0.0);
    }

    #[test]
    fn filenames_are_trimmed_and_checked() {
        assert_eq!(validate_filename("  report.pdf "), Ok("report.pdf"));
        assert!(validate_filename("   ").is_err());
        assert!(validate_filename("a\nb").is_err());
    }
}
