//! Background reconciliation of PENDING artifacts.
//!
//! Presigned uploads land in the object store without this process seeing
//! them. Each tick polls the object store for every PENDING artifact and
//! settles it: present means `UPLOADED`; absent past the staleness threshold
//! means `EXPIRED`. An inconclusive check never changes a status.

use super::{ArtifactError, CoreConfig, bounded, transition};
use crate::{
    models::{Artifact, ArtifactStatus},
    object_store::ObjectStore,
    store::MetadataStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub uploaded: usize,
    pub expired: usize,
    pub unchanged: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn changed(&self) -> bool {
        self.uploaded + self.expired > 0
    }
}

enum Outcome {
    Uploaded,
    Expired,
    Unchanged,
}

#[derive(Clone)]
pub struct Reconciler {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    config: CoreConfig,
}

impl Reconciler {
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

    /// Run one pass over all PENDING artifacts as of `now`.
    ///
    /// Failing to list pending artifacts aborts the pass. A failure on a
    /// single artifact is counted and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, ArtifactError> {
        let pending = bounded(
            self.config.store_timeout,
            "list_pending",
            self.metadata
                .list_artifacts_by_status(ArtifactStatus::Pending),
        )
        .await?;

        let mut report = TickReport::default();
        for artifact in &pending {
            report.scanned += 1;
            match self.reconcile_one(artifact, now).await {
                Ok(Outcome::Uploaded) => report.uploaded += 1,
                Ok(Outcome::Expired) => report.expired += 1,
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Err(err) => {
                    warn!(artifact = %artifact.uuid, error = %err, "reconciliation check failed; will retry");
                    report.errors += 1;
                }
            }
        }

        if report.changed() || report.errors > 0 {
            info!(
                scanned = report.scanned,
                uploaded = report.uploaded,
                expired = report.expired,
                errors = report.errors,
                "reconciliation tick"
            );
        } else {
            debug!(scanned = report.scanned, "reconciliation tick: nothing to do");
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ArtifactError> {
        let stored = bounded(
            self.config.store_timeout,
            "object_size",
            self.objects.object_size(&artifact.storage_key()),
        )
        .await?;

        let (target, stored_size) = match stored {
            Some(size) => (
                ArtifactStatus::Uploaded,
                Some(i64::try_from(size).unwrap_or(i64::MAX)),
            ),
            None if self.is_stale(artifact, now) => (ArtifactStatus::Expired, None),
            None => return Ok(Outcome::Unchanged),
        };

        let moved = transition(
            self.metadata.as_ref(),
            self.config.store_timeout,
            artifact.uuid,
            (artifact.status, target),
            stored_size,
        )
        .await?;
        if !moved {
            // A completion call settled it between the listing and now.
            return Ok(Outcome::Unchanged);
        }

        info!(artifact = %artifact.uuid, status = %target, "artifact reconciled");
        Ok(match target {
            ArtifactStatus::Uploaded => Outcome::Uploaded,
            _ => Outcome::Expired,
        })
    }

    fn is_stale(&self, artifact: &Artifact, now: DateTime<Utc>) -> bool {
        let threshold = chrono::Duration::from_std(self.config.staleness_threshold)
            .unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(artifact.created_at) > threshold
    }

    /// Run a tick immediately, then every `reconcile_interval`, until
    /// `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.reconcile_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval = ?self.config.reconcile_interval,
                staleness = ?self.config.staleness_threshold,
                "reconciler started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.tick(Utc::now()).await {
                            warn!(error = %err, "reconciliation tick aborted");
                        }
                    }
                }
            }
            info!("reconciler stopped");
        })
    }
}
