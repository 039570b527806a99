//! HTTP handlers. Each one delegates to a service and maps the outcome to a
//! response; audit records are emitted here because only the HTTP layer
//! knows the client address.

use crate::{
    audit::{AuditAction, AuditOutcome, AuditRecord},
    services::ArtifactError,
    state::AppState,
};
use std::net::IpAddr;
use uuid::Uuid;

pub mod artifact_handlers;
pub mod health_handlers;
pub mod object_handlers;
pub mod token_handlers;

/// Emit the audit records for the outcome of `action`.
pub(crate) fn audit<T>(
    state: &AppState,
    action: AuditAction,
    artifact: Option<Uuid>,
    client: IpAddr,
    result: &Result<T, ArtifactError>,
) {
    for record in audit_records(action, artifact, client, result) {
        state.audit.record(record);
    }
}

/// One record for the action itself, plus an `ERROR` record when the
/// service, not the request, was at fault.
fn audit_records<T>(
    action: AuditAction,
    artifact: Option<Uuid>,
    client: IpAddr,
    result: &Result<T, ArtifactError>,
) -> Vec<AuditRecord> {
    let scoped = |record: AuditRecord| {
        let record = record.client(client);
        match artifact {
            Some(uuid) => record.artifact(uuid),
            None => record,
        }
    };
    match result {
        Ok(_) => vec![scoped(AuditRecord::new(action, AuditOutcome::Success))],
        Err(err) => {
            let mut records =
                vec![scoped(AuditRecord::new(action, AuditOutcome::Failed).details(err.code()))];
            if err.is_server_fault() {
                records.push(scoped(
                    AuditRecord::new(AuditAction::Error, AuditOutcome::Failed)
                        .details(format!("{}: {err}", action.as_str())),
                ));
            }
            records
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    #[test]
    fn declined_requests_are_not_service_errors() {
        let result: Result<(), _> = Err(ArtifactError::QuotaExceeded);
        let records = audit_records(AuditAction::Download, None, client(), &result);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditOutcome::Failed);
        assert_eq!(records[0].details, "quota_exceeded");
    }

    #[test]
    fn store_failures_add_an_error_record() {
        let uuid = Uuid::new_v4();
        let result: Result<(), _> = Err(ArtifactError::StoreUnavailable("disk gone".into()));
        let records = audit_records(AuditAction::Upload, Some(uuid), client(), &result);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].action, AuditAction::Error);
        assert_eq!(records[1].artifact_uuid, Some(uuid));
        assert!(records[1].details.starts_with("UPLOAD: "));

        let ok: Result<(), ArtifactError> = Ok(());
        let records = audit_records(AuditAction::Upload, Some(uuid), client(), &ok);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditOutcome::Success);
    }
}
