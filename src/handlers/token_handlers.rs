//! Token issuance and redemption endpoints.

use super::audit;
use crate::{
    audit::AuditAction,
    errors::AppError,
    models::{TokenConstraints, TokenKind},
    object_store::PresignMethod,
    state::{AppState, BaseUrl, ClientIp},
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct GenDownloadRequest {
    pub artifact_uuid: Uuid,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub max_downloads: Option<i64>,
    pub allowed_cidr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenUploadRequest {
    pub artifact_uuid: Uuid,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub max_uploads: Option<i64>,
    pub allowed_cidr: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenTokenResponse {
    pub token: String,
    pub presigned_url: String,
}

#[derive(Debug, Serialize)]
pub struct UploadGrantResponse {
    pub upload_url: String,
    pub method: PresignMethod,
    pub expires_at: DateTime<Utc>,
}

/// `POST /genDownloadPresignedURL`
pub async fn gen_download_url(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    BaseUrl(base): BaseUrl,
    Json(req): Json<GenDownloadRequest>,
) -> Result<Json<GenTokenResponse>, AppError> {
    let constraints = TokenConstraints {
        valid_from: req.valid_from,
        valid_to: req.valid_to,
        max_uses: req.max_downloads,
        allowed_cidr: req.allowed_cidr,
    };
    issue(&state, client, &base, req.artifact_uuid, TokenKind::Download, constraints).await
}

/// `POST /genUploadPresignedURL`
pub async fn gen_upload_url(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    BaseUrl(base): BaseUrl,
    Json(req): Json<GenUploadRequest>,
) -> Result<Json<GenTokenResponse>, AppError> {
    let constraints = TokenConstraints {
        valid_from: req.valid_from,
        valid_to: req.valid_to,
        max_uses: req.max_uploads,
        allowed_cidr: req.allowed_cidr,
    };
    issue(&state, client, &base, req.artifact_uuid, TokenKind::Upload, constraints).await
}

async fn issue(
    state: &AppState,
    client: std::net::IpAddr,
    base: &str,
    artifact_uuid: Uuid,
    kind: TokenKind,
    constraints: TokenConstraints,
) -> Result<Json<GenTokenResponse>, AppError> {
    let result = state
        .tokens
        .issue(artifact_uuid, kind, constraints, base, Utc::now())
        .await;
    audit(state, AuditAction::TokenIssue, Some(artifact_uuid), client, &result);
    let issued = result?;
    Ok(Json(GenTokenResponse {
        token: issued.token,
        presigned_url: issued.access_url,
    }))
}

/// `GET /artifacts/{token}`: redeem a download token with a 302 to storage.
pub async fn redeem_download(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let result = state
        .tokens
        .redeem(&token, TokenKind::Download, client, Utc::now())
        .await;
    audit(
        &state,
        AuditAction::Download,
        result.as_ref().ok().map(|r| r.artifact_uuid),
        client,
        &result,
    );
    let redemption = result?;

    let location = HeaderValue::from_str(&redemption.presigned.url)
        .map_err(|err| AppError::internal(format!("unusable presigned url: {err}")))?;
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    headers.insert(header::LOCATION, location);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// `POST /artifacts/upload/{token}`: redeem an upload token for a presigned PUT.
pub async fn redeem_upload(
    State(state): State<AppState>,
    ClientIp(client): ClientIp,
    Path(token): Path<String>,
) -> Result<Json<UploadGrantResponse>, AppError> {
    let result = state
        .tokens
        .redeem(&token, TokenKind::Upload, client, Utc::now())
        .await;
    audit(
        &state,
        AuditAction::Upload,
        result.as_ref().ok().map(|r| r.artifact_uuid),
        client,
        &result,
    );
    let presigned = result?.presigned;
    Ok(Json(UploadGrantResponse {
        upload_url: presigned.url,
        method: presigned.method,
        expires_at: presigned.expires_at,
    }))
}
