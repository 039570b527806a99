//! Artifact CRUD under `/artifact-service/v1`.
//! Upload and download stream bodies instead of buffering them.

use super::audit;
use crate::{
    audit::AuditAction,
    errors::AppError,
    models::{Artifact, ArtifactStatus},
    object_store::PresignMethod,
    services::StorageUsage,
    state::{AppState, BaseUrl, ClientIp},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    io,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

pub const API_PREFIX: &str = "/artifact-service/v1";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uuid: Uuid,
    pub filename: String,
    pub size: i64,
    pub status: ArtifactStatus,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
pub struct PendingRequest {
    pub filename: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub uuid: Uuid,
    pub status: ArtifactStatus,
    pub upload_url: String,
    pub method: PresignMethod,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uuid: Uuid,
    pub status: ArtifactStatus,
}

/// `POST /artifact-service/v1/artifacts/`: multipart upload, field `file`.
pub async fn upload_artifact(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    BaseUrl(base): BaseUrl,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        // Keep the multipart error so its own status (400, 413) is reported
        // instead of a storage failure.
        let broken: Arc<Mutex<Option<MultipartError>>> = Arc::default();
        let slot = broken.clone();
        let body = field
            .map(move |chunk| {
                chunk.map_err(|err| {
                    let io_err = io::Error::other(err.body_text());
                    if let Ok(mut first) = slot.lock() {
                        first.get_or_insert(err);
                    }
                    io_err
                })
            })
            .boxed();

        let result = state
            .artifacts
            .upload(&filename, content_type, body, Utc::now())
            .await;
        let broken = broken.lock().ok().and_then(|mut slot| slot.take());
        audit(
            &state,
            AuditAction::Upload,
            result.as_ref().ok().map(|a| a.uuid),
            client,
            &result,
        );
        if let (Err(_), Some(err)) = (&result, broken) {
            return Err(err.into());
        }
        let artifact = result?;
        return Ok(Json(UploadResponse {
            download_url: format!(
                "{base}{API_PREFIX}/artifacts/{}/action/downloadFile",
                artifact.uuid
            ),
            uuid: artifact.uuid,
            filename: artifact.filename,
            size: artifact.size,
            status: artifact.status,
        }));
    }
    Err(AppError::bad_request("no file is received"))
}

/// `POST /artifact-service/v1/artifacts/pending`: start a direct-to-storage upload.
pub async fn create_pending(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    Json(req): Json<PendingRequest>,
) -> Result<(StatusCode, Json<PendingResponse>), AppError> {
    let result = state
        .artifacts
        .create_pending(&req.filename, req.content_type, req.size, Utc::now())
        .await;
    audit(
        &state,
        AuditAction::Upload,
        result.as_ref().ok().map(|(a, _)| a.uuid),
        client,
        &result,
    );
    let (artifact, presigned) = result?;
    Ok((
        StatusCode::CREATED,
        Json(PendingResponse {
            uuid: artifact.uuid,
            status: artifact.status,
            upload_url: presigned.url,
            method: presigned.method,
            expires_at: presigned.expires_at,
        }),
    ))
}

pub async fn list_artifacts(
    State(state): State<AppState>,
) -> Result<Json<Vec<Artifact>>, AppError> {
    Ok(Json(state.artifacts.list().await?))
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Artifact>, AppError> {
    Ok(Json(state.artifacts.get(uuid).await?))
}

/// `DELETE /artifact-service/v1/artifacts/{uuid}`
pub async fn delete_artifact(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    Path(uuid): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let result = state.artifacts.delete(uuid).await;
    audit(&state, AuditAction::Delete, Some(uuid), client, &result);
    let artifact = result?;
    Ok(Json(StatusResponse {
        uuid: artifact.uuid,
        status: artifact.status,
    }))
}

/// `GET /artifact-service/v1/artifacts/{uuid}/action/downloadFile`
pub async fn download_file(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    Path(uuid): Path<Uuid>,
) -> Result<Response, AppError> {
    let result = state.artifacts.open(uuid).await;
    audit(&state, AuditAction::Download, Some(uuid), client, &result);
    let (artifact, object) = result?;

    let mut response = Response::new(Body::from_stream(object.stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&artifact.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(size) = object.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&artifact.filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// `POST /artifact-service/v1/artifacts/{uuid}/action/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    Path(uuid): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let result = state.artifacts.complete_upload(uuid).await;
    audit(&state, AuditAction::Complete, Some(uuid), client, &result);
    Ok(Json(StatusResponse {
        uuid,
        status: result?,
    }))
}

/// `GET /artifact-service/v1/storage/usage`
pub async fn storage_usage(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let usage: StorageUsage = state.artifacts.usage(state.http.storage_quota).await?;
    Ok(Json(usage))
}

/// `attachment; filename="..."` with quotes and non-ASCII replaced.
fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}
