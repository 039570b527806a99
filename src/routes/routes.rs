//! Defines routes for artifact, token and direct-storage operations.
//!
//! ## Structure
//! - **Artifact API** (`/artifact-service/v1`)
//!   - `POST   /artifacts/`                           multipart upload
//!   - `POST   /artifacts/pending`                    start a presigned upload
//!   - `GET    /artifacts/`                           list artifacts
//!   - `GET    /artifacts/{uuid}`                     metadata
//!   - `DELETE /artifacts/{uuid}`                     delete object, tokens and row
//!   - `GET    /artifacts/{uuid}/action/downloadFile`  stream the payload
//!   - `POST   /artifacts/{uuid}/action/complete`     confirm a presigned upload
//!   - `GET    /storage/usage`                        usage report
//!
//! - **Tokens**
//!   - `POST /genDownloadPresignedURL`, `POST /genUploadPresignedURL`: issue
//!   - `GET  /artifacts/{token}`                      redeem download (302)
//!   - `POST /artifacts/upload/{token}`               redeem upload
//!
//! - **Direct storage** (fs backend only)
//!   - `GET | HEAD | PUT /objects/{*key}?expires=&signature=`

use crate::{
    handlers::{
        artifact_handlers::{
            API_PREFIX, complete_upload, create_pending, delete_artifact, download_file,
            get_artifact, list_artifacts, storage_usage, upload_artifact,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, head_object, put_object},
        token_handlers::{gen_download_url, gen_upload_url, redeem_download, redeem_upload},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the application router with `state` attached.
pub fn routes(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/artifacts/",
            post(upload_artifact)
                .layer(DefaultBodyLimit::max(state.http.max_upload_bytes))
                .get(list_artifacts),
        )
        .route("/artifacts/pending", post(create_pending))
        .route("/artifacts/{uuid}", get(get_artifact).delete(delete_artifact))
        .route("/artifacts/{uuid}/action/downloadFile", get(download_file))
        .route("/artifacts/{uuid}/action/complete", post(complete_upload))
        .route("/storage/usage", get(storage_usage));

    let mut router = Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest(API_PREFIX, api)
        .route("/genDownloadPresignedURL", post(gen_download_url))
        .route("/genUploadPresignedURL", post(gen_upload_url))
        .route("/artifacts/{token}", get(redeem_download))
        .route("/artifacts/upload/{token}", post(redeem_upload));

    if state.fs_gateway.is_some() {
        router = router.route(
            "/objects/{*key}",
            get(get_object).head(head_object).put(put_object),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
