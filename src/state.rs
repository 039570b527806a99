//! Shared handler state and request-context extractors.

use crate::{
    audit::AuditSink,
    errors::AppError,
    object_store::{FsObjectStore, ObjectStore},
    services::{ArtifactService, CoreConfig, TokenEngine},
    store::MetadataStore,
};
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

/// HTTP-layer settings that do not belong to the core.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub public_base_url: Option<String>,
    pub trust_forwarded_for: bool,
    pub storage_quota: i64,
    pub max_upload_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            public_base_url: None,
            trust_forwarded_for: false,
            storage_quota: 10 * 1024 * 1024 * 1024,
            max_upload_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub artifacts: ArtifactService,
    pub tokens: TokenEngine,
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    /// Set when the fs backend is active; serves its presigned URLs.
    pub fs_gateway: Option<FsObjectStore>,
    pub audit: AuditSink,
    pub http: HttpSettings,
}

impl AppState {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        core: CoreConfig,
        http: HttpSettings,
        audit: AuditSink,
    ) -> Self {
        Self {
            artifacts: ArtifactService::new(metadata.clone(), objects.clone(), core),
            tokens: TokenEngine::new(metadata.clone(), objects.clone(), core),
            metadata,
            objects,
            fs_gateway: None,
            audit,
            http,
        }
    }

    pub fn with_fs_gateway(mut self, fs: FsObjectStore) -> Self {
        self.fs_gateway = Some(fs);
        self
    }
}

/// Address of the calling client.
///
/// The socket peer by default; the first parsable `X-Forwarded-For` entry
/// when the deployment sits behind a trusted proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.http.trust_forwarded_for {
            if let Some(ip) = forwarded_for(&parts.headers) {
                return Ok(ClientIp(ip));
            }
        }
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| ClientIp(addr.ip()))
            .ok_or_else(|| AppError::internal("client address unavailable"))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .find_map(|part| part.trim().parse().ok())
}

/// Externally visible `scheme://host` used to build access URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl(pub String);

impl FromRequestParts<AppState> for BaseUrl {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(base) = &state.http.public_base_url {
            return Ok(BaseUrl(base.clone()));
        }
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::bad_request("missing Host header"))?;
        let scheme = parts
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .filter(|v| matches!(*v, "http" | "https"))
            .unwrap_or("http");
        Ok(BaseUrl(format!("{scheme}://{host}")))
    }
}
