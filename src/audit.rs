//! Audit trail of artifact operations.
//!
//! Records are JSON objects. The sink is chosen once at startup: `Local`
//! writes them to the `audit` tracing target, `Remote` POSTs them to a
//! collector from a detached task so request latency never depends on it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{net::IpAddr, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Upload,
    Download,
    Delete,
    TokenIssue,
    Complete,
    Error,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Upload => "UPLOAD",
            AuditAction::Download => "DOWNLOAD",
            AuditAction::Delete => "DELETE",
            AuditAction::TokenIssue => "TOKEN_ISSUE",
            AuditAction::Complete => "COMPLETE",
            AuditAction::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_uuid: Option<Uuid>,
    pub client_ip: Option<IpAddr>,
    pub status: AuditOutcome,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl AuditRecord {
    pub fn new(action: AuditAction, status: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            artifact_uuid: None,
            client_ip: None,
            status,
            details: String::new(),
        }
    }

    pub fn artifact(mut self, uuid: Uuid) -> Self {
        self.artifact_uuid = Some(uuid);
        self
    }

    pub fn client(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

#[derive(Debug, Clone)]
pub enum AuditSink {
    Local,
    Remote {
        endpoint: String,
        client: reqwest::Client,
    },
}

impl AuditSink {
    pub fn remote(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(AuditSink::Remote {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuditSink::Local => "local",
            AuditSink::Remote { .. } => "remote",
        }
    }

    /// Emit `record`. Never fails; delivery problems are logged and dropped.
    pub fn record(&self, record: AuditRecord) {
        match self {
            AuditSink::Local => match serde_json::to_string(&record) {
                Ok(line) => info!(target: "audit", "{line}"),
                Err(err) => warn!(error = %err, "could not serialize audit record"),
            },
            AuditSink::Remote { endpoint, client } => {
                let request = client.post(endpoint.as_str()).json(&record);
                tokio::spawn(async move {
                    match request.send().await {
                        Ok(resp) if resp.status().is_success() => {}
                        Ok(resp) => {
                            warn!(status = resp.status().as_u16(), "audit collector rejected record")
                        }
                        Err(err) => warn!(error = %err, "audit delivery failed"),
                    }
                });
            }
        }
    }
}
