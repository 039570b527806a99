//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings the metadata and object stores

use crate::{services::bounded, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, time::Duration};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// `GET /healthz`
///
/// Very small liveness probe that always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that pings the metadata store and the object store.
/// HTTP 200 when both pass, HTTP 503 when either fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let metadata = bounded(PROBE_TIMEOUT, "metadata_ping", state.metadata.ping()).await;
    let objects = bounded(PROBE_TIMEOUT, "object_ping", state.objects.ping()).await;

    let mut checks = HashMap::new();
    checks.insert(
        "metadata",
        CheckStatus {
            ok: metadata.is_ok(),
            error: metadata.err().map(|e| e.to_string()),
        },
    );
    checks.insert(
        state.objects.backend_name(),
        CheckStatus {
            ok: objects.is_ok(),
            error: objects.err().map(|e| e.to_string()),
        },
    );

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
