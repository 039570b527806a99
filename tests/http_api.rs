mod common;

use artifact_service::{
    AppState, HttpSettings,
    audit::AuditSink,
    object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, UrlSigner},
    routes,
    services::CoreConfig,
    store::{MemoryMetadataStore, MetadataStore},
};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode, header},
};
use common::BASE_URL;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use tempfile::TempDir;
use tower::util::ServiceExt; // for oneshot

const BOUNDARY: &str = "artifact-test-boundary";

fn settings() -> HttpSettings {
    HttpSettings {
        public_base_url: Some(BASE_URL.into()),
        storage_quota: 1000,
        ..HttpSettings::default()
    }
}

fn memory_app() -> (Router, Arc<MemoryObjectStore>) {
    memory_app_with(settings())
}

fn memory_app_with(http: HttpSettings) -> (Router, Arc<MemoryObjectStore>) {
    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let state = AppState::new(
        metadata,
        objects.clone(),
        CoreConfig::default(),
        http,
        AuditSink::Local,
    );
    (routes::routes(state), objects)
}

fn fs_app(dir: &TempDir) -> Router {
    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let fs = FsObjectStore::new(dir.path(), BASE_URL, UrlSigner::new(b"test-signing-key"));
    let objects: Arc<dyn ObjectStore> = Arc::new(fs.clone());
    let state = AppState::new(
        metadata,
        objects,
        CoreConfig::default(),
        settings(),
        AuditSink::Local,
    )
    .with_fs_gateway(fs);
    routes::routes(state)
}

fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
    request_from(method, uri, body, [10, 0, 0, 7])
}

fn request_from(method: &str, uri: &str, body: Body, ip: [u8; 4]) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "artifacts.test")
        .body(body)
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
    req
}

fn json_request(method: &str, uri: &str, value: Value) -> Request<Body> {
    let mut req = request(method, uri, Body::from(value.to_string()));
    req.headers_mut()
        .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    req
}

fn multipart_upload(filename: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {content}\r\n\
         --{BOUNDARY}--\r\n"
    );
    let mut req = request("POST", "/artifact-service/v1/artifacts/", Body::from(body));
    req.headers_mut().insert(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}").parse().unwrap(),
    );
    req
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn as_json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap()
}

/// Strip the public origin so a presigned URL can be replayed against the router.
fn local_path(url: &str) -> &str {
    url.strip_prefix(BASE_URL).unwrap()
}

async fn upload(app: &Router, content: &str) -> String {
    let (status, _, body) = send(app, multipart_upload("notes.txt", content)).await;
    assert_eq!(status, StatusCode::OK);
    as_json(&body)["uuid"].as_str().unwrap().to_string()
}

async fn download_token(app: &Router, body: Value) -> (StatusCode, Value) {
    let (status, _, body) = send(app, json_request("POST", "/genDownloadPresignedURL", body)).await;
    (status, as_json(&body))
}

#[tokio::test]
async fn health_and_readiness() {
    let (app, objects) = memory_app();
    let (status, _, body) = send(&app, request("GET", "/healthz", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "ok");

    let (status, _, _) = send(&app, request("GET", "/readyz", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);

    objects.set_unavailable(true);
    let (status, _, body) = send(&app, request("GET", "/readyz", Body::empty())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(as_json(&body)["checks"]["memory"]["ok"], false);
}

#[tokio::test]
async fn multipart_upload_then_stream_download() {
    let (app, _) = memory_app();
    let (status, _, body) = send(&app, multipart_upload("notes.txt", "hello world")).await;
    assert_eq!(status, StatusCode::OK);
    let uploaded = as_json(&body);
    assert_eq!(uploaded["status"], "UPLOADED");
    assert_eq!(uploaded["size"], 11);
    assert_eq!(uploaded["filename"], "notes.txt");
    let uuid = uploaded["uuid"].as_str().unwrap();
    assert_eq!(
        uploaded["download_url"],
        format!("{BASE_URL}/artifact-service/v1/artifacts/{uuid}/action/downloadFile")
    );

    let uri = format!("/artifact-service/v1/artifacts/{uuid}/action/downloadFile");
    let (status, headers, body) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hello world");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"notes.txt\""
    );
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain");

    let (status, _, body) = send(&app, request("GET", "/artifact-service/v1/artifacts/", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body).as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let (app, _) = memory_app();
    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{BOUNDARY}--\r\n"
    );
    let mut req = request("POST", "/artifact-service/v1/artifacts/", Body::from(body));
    req.headers_mut().insert(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}").parse().unwrap(),
    );
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(as_json(&body)["error"], "invalid_request");
}

// The client disconnects halfway through the file part.
#[tokio::test]
async fn truncated_multipart_upload_is_a_client_error() {
    let (app, _) = memory_app();
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"cut.bin\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         first half of the payload and no closing boundary"
    );
    let mut req = request("POST", "/artifact-service/v1/artifacts/", Body::from(body));
    req.headers_mut().insert(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}").parse().unwrap(),
    );
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!headers.contains_key(header::RETRY_AFTER));
    assert_eq!(as_json(&body)["error"], "invalid_request");

    let (status, _, body) = send(
        &app,
        request("GET", "/artifact-service/v1/artifacts/", Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body), json!([]));
}

#[tokio::test]
async fn download_token_redirects_until_quota_is_spent() {
    let (app, _) = memory_app();
    let uuid = upload(&app, "abc").await;

    let (status, issued) = download_token(&app, json!({ "artifact_uuid": uuid, "max_downloads": 1 })).await;
    assert_eq!(status, StatusCode::OK);
    let access = issued["presigned_url"].as_str().unwrap();
    let token = issued["token"].as_str().unwrap();
    assert_eq!(access, format!("{BASE_URL}/artifacts/{token}"));

    let (status, headers, _) = send(&app, request("GET", local_path(access), Body::empty())).await;
    assert_eq!(status, StatusCode::FOUND);
    let location = headers[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with(&format!("memory://objects/{uuid}")));
    assert!(location.contains("method=GET"));

    let (status, _, body) = send(&app, request("GET", local_path(access), Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let err = as_json(&body);
    assert_eq!(err["error"], "quota_exceeded");
    assert_eq!(err["status"], 403);
}

#[tokio::test]
async fn declined_redemptions_are_distinguishable() {
    let (app, _) = memory_app();
    let uuid = upload(&app, "abc").await;

    let (status, _, body) = send(&app, request("GET", "/artifacts/nope", Body::empty())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(as_json(&body)["error"], "invalid_token");

    let (_, expired) = download_token(
        &app,
        json!({ "artifact_uuid": uuid, "valid_to": "2000-01-01T00:00:00Z" }),
    )
    .await;
    let uri = format!("/artifacts/{}", expired["token"].as_str().unwrap());
    let (status, _, body) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(as_json(&body)["error"], "expired");

    let (_, future) = download_token(
        &app,
        json!({ "artifact_uuid": uuid, "valid_from": "2999-01-01T00:00:00Z" }),
    )
    .await;
    let uri = format!("/artifacts/{}", future["token"].as_str().unwrap());
    let (status, _, body) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "not_yet_valid");

    let (status, body) = download_token(
        &app,
        json!({ "artifact_uuid": "00000000-0000-0000-0000-000000000000" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn origin_restriction_uses_peer_or_trusted_forwarded_address() {
    let (app, _) = memory_app();
    let uuid = upload(&app, "abc").await;
    let (_, issued) = download_token(
        &app,
        json!({ "artifact_uuid": uuid, "allowed_cidr": "192.168.0.0/16" }),
    )
    .await;
    let uri = format!("/artifacts/{}", issued["token"].as_str().unwrap());

    let (status, _, body) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "origin_not_allowed");

    let (status, _, _) = send(&app, request_from("GET", &uri, Body::empty(), [192, 168, 4, 2])).await;
    assert_eq!(status, StatusCode::FOUND);

    // Forwarded headers are ignored unless trusted.
    let mut spoofed = request("GET", &uri, Body::empty());
    spoofed
        .headers_mut()
        .insert("x-forwarded-for", "192.168.1.1".parse().unwrap());
    let (status, _, _) = send(&app, spoofed).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (trusting, _) = memory_app_with(HttpSettings {
        trust_forwarded_for: true,
        ..settings()
    });
    let uuid = upload(&trusting, "abc").await;
    let (_, issued) = download_token(
        &trusting,
        json!({ "artifact_uuid": uuid, "allowed_cidr": "192.168.0.0/16" }),
    )
    .await;
    let uri = format!("/artifacts/{}", issued["token"].as_str().unwrap());
    let mut proxied = request("GET", &uri, Body::empty());
    proxied
        .headers_mut()
        .insert("x-forwarded-for", "192.168.1.1, 10.0.0.7".parse().unwrap());
    let (status, _, _) = send(&trusting, proxied).await;
    assert_eq!(status, StatusCode::FOUND);
}

#[tokio::test]
async fn store_outage_is_retryable() {
    let (app, objects) = memory_app();
    let uuid = upload(&app, "abc").await;
    let (_, issued) = download_token(&app, json!({ "artifact_uuid": uuid, "max_downloads": 1 })).await;
    let uri = format!("/artifacts/{}", issued["token"].as_str().unwrap());

    objects.set_presign_fails(true);
    let (status, headers, body) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.contains_key(header::RETRY_AFTER));
    assert_eq!(as_json(&body)["error"], "store_unavailable");

    // The failed attempt did not spend the only use.
    objects.set_presign_fails(false);
    let (status, _, _) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::FOUND);
}

#[tokio::test]
async fn presigned_upload_flow_through_fs_gateway() {
    let dir = TempDir::new().unwrap();
    let app = fs_app(&dir);

    let (status, _, body) = send(
        &app,
        json_request(
            "POST",
            "/artifact-service/v1/artifacts/pending",
            json!({ "filename": "bundle.zip", "size": 9 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let pending = as_json(&body);
    assert_eq!(pending["status"], "PENDING");
    assert_eq!(pending["method"], "PUT");
    let uuid = pending["uuid"].as_str().unwrap().to_string();
    let upload_url = pending["upload_url"].as_str().unwrap().to_string();

    let complete = format!("/artifact-service/v1/artifacts/{uuid}/action/complete");
    let (status, _, body) = send(&app, request("POST", &complete, Body::empty())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(as_json(&body)["error"], "upload_incomplete");

    // A GET signature cannot be used to write.
    let forged = local_path(&upload_url).to_string();
    let (status, _, _) = send(&app, request("GET", &forged, Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(&app, request("PUT", local_path(&upload_url), Body::from("zip-bytes"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, request("POST", &complete, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "UPLOADED");
    let (status, _, body) = send(&app, request("POST", &complete, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "UPLOADED");

    // The PUT URL is still unexpired but cannot replace the confirmed bytes.
    let (status, _, body) = send(&app, request("PUT", local_path(&upload_url), Body::from("swapped"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(as_json(&body)["error"], "object_exists");

    let (status, _, body) = send(
        &app,
        request("GET", &format!("/artifact-service/v1/artifacts/{uuid}"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["stored_size"], 9);

    let (_, issued) = download_token(&app, json!({ "artifact_uuid": uuid })).await;
    let (status, headers, _) = send(
        &app,
        request("GET", local_path(issued["presigned_url"].as_str().unwrap()), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::FOUND);
    let location = headers[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with(&format!("{BASE_URL}/objects/{uuid}?expires=")));

    let (status, _, body) = send(&app, request("GET", local_path(&location), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"zip-bytes");

    let tampered = local_path(&location).replace("signature=", "signature=00");
    let (status, _, body) = send(&app, request("GET", &tampered, Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "invalid_signature");
}

#[tokio::test]
async fn upload_token_grants_presigned_put() {
    let dir = TempDir::new().unwrap();
    let app = fs_app(&dir);
    let (_, _, body) = send(
        &app,
        json_request(
            "POST",
            "/artifact-service/v1/artifacts/pending",
            json!({ "filename": "later.bin", "size": 4 }),
        ),
    )
    .await;
    let uuid = as_json(&body)["uuid"].as_str().unwrap().to_string();

    let (status, _, body) = send(
        &app,
        json_request(
            "POST",
            "/genUploadPresignedURL",
            json!({ "artifact_uuid": uuid, "max_uploads": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let access = as_json(&body)["presigned_url"].as_str().unwrap().to_string();
    assert!(access.starts_with(&format!("{BASE_URL}/artifacts/upload/")));

    let (status, _, body) = send(&app, request("POST", local_path(&access), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let grant = as_json(&body);
    assert_eq!(grant["method"], "PUT");
    let put_url = grant["upload_url"].as_str().unwrap().to_string();

    let (status, _, _) = send(&app, request("PUT", local_path(&put_url), Body::from("data"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, request("POST", local_path(&access), Body::empty())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(as_json(&body)["error"], "quota_exceeded");
}

#[tokio::test]
async fn usage_and_delete() {
    let (app, objects) = memory_app();
    let uuid = upload(&app, "0123456789").await;

    let (status, _, body) = send(&app, request("GET", "/artifact-service/v1/storage/usage", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let usage = as_json(&body);
    assert_eq!(usage["total_space"], 1000);
    assert_eq!(usage["used_space"], 10);
    assert_eq!(usage["remaining_space"], 990);
    assert_eq!(usage["usage_percent"], 1.0);
    assert_eq!(usage["file_count"], 1);

    let (_, issued) = download_token(&app, json!({ "artifact_uuid": uuid })).await;
    let uri = format!("/artifact-service/v1/artifacts/{uuid}");
    let (status, _, _) = send(&app, request("DELETE", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!objects.contains(&uuid));

    let (status, _, body) = send(&app, request("GET", &uri, Body::empty())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(as_json(&body)["error"], "not_found");

    // Tokens go with their artifact.
    let token_uri = format!("/artifacts/{}", issued["token"].as_str().unwrap());
    let (status, _, _) = send(&app, request("GET", &token_uri, Body::empty())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
