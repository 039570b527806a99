//! Access-control and reconciliation core.
//!
//! - [`token_engine`]: issues and redeems capability tokens.
//! - [`artifact_service`]: artifact lifecycle and the PENDING → terminal
//!   status machine.
//! - [`reconciler`]: background task converging PENDING artifacts with what
//!   the object store actually holds.
//! - [`access`]: time window, quota and CIDR checks shared by the above.
//!
//! Components receive their store handles at construction; nothing here
//! reaches for global state.

use crate::{models::ArtifactStatus, store::MetadataStore};
use std::{future::Future, time::Duration};
use tracing::warn;
use uuid::Uuid;

pub mod access;
pub mod artifact_service;
pub mod error;
pub mod reconciler;
pub mod token_engine;

pub use artifact_service::{ArtifactService, StorageUsage};
pub use error::ArtifactError;
pub use reconciler::{Reconciler, TickReport};
pub use token_engine::{IssuedToken, Redemption, TokenEngine};

/// Policy knobs of the core, supplied by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// How long an artifact may stay PENDING without an object before it expires.
    pub staleness_threshold: Duration,
    pub reconcile_interval: Duration,
    /// Lifetime of presigned GET/PUT URLs.
    pub presign_expiry: Duration,
    /// Upper bound on every individual store call.
    pub store_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(30 * 60),
            reconcile_interval: Duration::from_secs(60),
            presign_expiry: Duration::from_secs(15 * 60),
            store_timeout: Duration::from_secs(10),
        }
    }
}

/// Run a store call under `limit`. An elapsed timeout is reported as
/// [`ArtifactError::StoreUnavailable`], never as success.
pub(crate) async fn bounded<T, E, F>(
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, ArtifactError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ArtifactError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!(operation, timeout = ?limit, "store call timed out");
            Err(ArtifactError::StoreUnavailable(format!(
                "{operation} timed out after {limit:?}"
            )))
        }
    }
}

/// Compare-and-set `uuid` from `from` to `to`, refusing edges the status
/// machine does not have before the store is asked.
pub(crate) async fn transition(
    metadata: &dyn MetadataStore,
    limit: Duration,
    uuid: Uuid,
    (from, to): (ArtifactStatus, ArtifactStatus),
    stored_size: Option<i64>,
) -> Result<bool, ArtifactError> {
    if !from.can_transition_to(to) {
        return Err(ArtifactError::InternalError(format!(
            "illegal status change {from} -> {to} for artifact {uuid}"
        )));
    }
    bounded(
        limit,
        "transition_status",
        metadata.transition_status(uuid, from, to, stored_size),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::Artifact, store::MemoryMetadataStore};
    use chrono::Utc;

    #[tokio::test]
    async fn transition_rejects_edges_outside_the_status_machine() {
        let store = MemoryMetadataStore::new();
        let artifact = Artifact::new("a.bin", None, 1, ArtifactStatus::Uploaded, Utc::now());
        store.insert_artifact(&artifact).await.unwrap();

        let limit = Duration::from_secs(1);
        let edge = (ArtifactStatus::Uploaded, ArtifactStatus::Expired);
        let err = transition(&store, limit, artifact.uuid, edge, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InternalError(_)));
        let row = store.get_artifact(artifact.uuid).await.unwrap().unwrap();
        assert_eq!(row.status, ArtifactStatus::Uploaded);
    }

    #[tokio::test]
    async fn bounded_reports_elapsed_calls_as_unavailable() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ArtifactError>(())
        };
        let err = bounded(Duration::from_millis(10), "slow_call", slow)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
