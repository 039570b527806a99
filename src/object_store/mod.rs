//! Object store: binary payloads keyed by artifact uuid.
//!
//! The service never assumes the object store agrees with the metadata store.
//! Presigned URLs let clients read and write payloads directly, so an object
//! can appear (or never appear) without this process observing it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::{fmt, io, time::Duration};
use thiserror::Error;

pub mod fs;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use fs::{FsObjectStore, UrlSigner};
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key")]
    InvalidKey,
    /// Network, auth or backend failure whose outcome is unknown.
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    /// The inbound payload stream broke off; nothing was stored.
    #[error("request body could not be read: {0}")]
    Body(io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectResult<T> = Result<T, ObjectStoreError>;

/// Streamed payload, either inbound (put) or outbound (get).
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// An object opened for reading.
pub struct ObjectBody {
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub stream: ByteStream<'static>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }
}

/// A time-boxed URL granting direct access to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub method: PresignMethod,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Short backend identifier for logs and readiness output.
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> ObjectResult<()>;

    /// Write `body` under `key`, replacing any previous object. Returns the
    /// number of bytes stored.
    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: ByteStream<'_>,
    ) -> ObjectResult<u64>;

    async fn get_object(&self, key: &str) -> ObjectResult<ObjectBody>;

    /// Stored size of `key`. `Ok(None)` only when the backend positively
    /// reports absence.
    async fn object_size(&self, key: &str) -> ObjectResult<Option<u64>>;

    /// Delete `key`. Deleting a missing object succeeds.
    async fn delete_object(&self, key: &str) -> ObjectResult<()>;

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> ObjectResult<PresignedUrl>;
}

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Basic key validation to avoid trivial path traversal vectors.
pub(crate) fn ensure_key_safe(key: &str) -> ObjectResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(ObjectStoreError::InvalidKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(ObjectStoreError::InvalidKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(ObjectStoreError::InvalidKey);
    }
    Ok(())
}

pub(crate) fn expiry_from_now(expires_in: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
