//! Direct-storage endpoint of the filesystem backend.
//!
//! Presigned URLs minted by [`FsObjectStore`](crate::object_store::FsObjectStore)
//! land here. Each request must carry a valid, unexpired signature for its
//! method and key. Writing an object does not touch artifact metadata; the
//! reconciler or an explicit completion call observes it later, exactly as
//! with an external object store.

use crate::{
    errors::AppError,
    object_store::{FsObjectStore, ObjectStore, ObjectStoreError, PresignMethod},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;
use tracing::{debug, warn};

/// Signature parameters appended to every presigned URL.
#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

fn authorize(
    state: &AppState,
    method: PresignMethod,
    key: &str,
    query: &SignedQuery,
) -> Result<FsObjectStore, AppError> {
    let gateway = state
        .fs_gateway
        .clone()
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", "no such route"))?;
    if !gateway
        .signer()
        .verify(method, key, query.expires, &query.signature, Utc::now())
    {
        debug!(key, method = method.as_str(), "rejected presigned request");
        return Err(AppError::forbidden(
            "invalid_signature",
            "signature mismatch or url expired",
        ));
    }
    Ok(gateway)
}

fn object_error(err: ObjectStoreError) -> AppError {
    match err {
        ObjectStoreError::NotFound(key) => AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("object `{key}` not found"),
        ),
        ObjectStoreError::InvalidKey => AppError::bad_request("invalid object key"),
        ObjectStoreError::Body(err) => {
            AppError::bad_request(format!("request body could not be read: {err}"))
        }
        other => {
            warn!(error = %other, "object gateway storage failure");
            AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                other.to_string(),
            )
        }
    }
}

/// `GET /objects/{*key}`
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, AppError> {
    let gateway = authorize(&state, PresignMethod::Get, &key, &query)?;
    let object = gateway.get_object(&key).await.map_err(object_error)?;

    let mut response = Response::new(Body::from_stream(object.stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), object.size);
    Ok(response)
}

/// `HEAD /objects/{*key}`: same headers as GET, no body. Uses the GET signature.
pub async fn head_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, AppError> {
    let gateway = authorize(&state, PresignMethod::Get, &key, &query)?;
    let object = gateway.get_object(&key).await.map_err(object_error)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), object.size);
    Ok(response)
}

/// `PUT /objects/{*key}`: write the request body as the object.
///
/// An existing object is never replaced, so a PUT URL stops working once
/// its upload has landed.
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let gateway = authorize(&state, PresignMethod::Put, &key, &query)?;
    if gateway.object_size(&key).await.map_err(object_error)?.is_some() {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "object_exists",
            format!("object `{key}` already exists"),
        ));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    let size = gateway
        .put_object(&key, content_type, stream)
        .await
        .map_err(object_error)?;

    Ok((StatusCode::OK, Json(json!({ "key": key, "size": size }))))
}

fn set_object_headers(headers: &mut HeaderMap, size: Option<u64>) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
}
