//! S3 / Ceph RGW object store (`s3` feature).
//!
//! Objects are keyed by artifact uuid in a single bucket. Custom endpoints
//! (Ceph, MinIO) use path-style addressing.

use super::{
    ByteStream, ObjectBody, ObjectResult, ObjectStore, ObjectStoreError, PresignMethod,
    PresignedUrl, ensure_key_safe, expiry_from_now,
};
use async_trait::async_trait;
use aws_sdk_s3::{presigning::PresigningConfig, primitives::ByteStream as S3ByteStream};
use futures::StreamExt;
use std::{fmt, time::Duration};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// S3 caps presigned URL lifetimes at seven days.
const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3ObjectStore {
    pub async fn connect(bucket: String, endpoint: Option<String>, region: String) -> Self {
        use aws_config::BehaviorVersion;
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        info!(bucket = %bucket, "s3 object store initialised");
        Self { client, bucket }
    }
}

fn unavailable(err: impl fmt::Display) -> ObjectStoreError {
    ObjectStoreError::Unavailable(err.to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn ping(&self) -> ObjectResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        mut body: ByteStream<'_>,
    ) -> ObjectResult<u64> {
        ensure_key_safe(key)?;
        // The SDK needs a sized, replayable body for signing; buffer it.
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.map_err(ObjectStoreError::Body)?);
        }
        let size = buf.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(S3ByteStream::from(buf))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(size)
    }

    async fn get_object(&self, key: &str) -> ObjectResult<ObjectBody> {
        ensure_key_safe(key)?;
        let out = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => out,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(ObjectStoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(unavailable(err)),
        };
        let size = out.content_length().and_then(|len| u64::try_from(len).ok());
        let content_type = out.content_type().map(str::to_string);
        let reader = out.body.into_async_read();
        Ok(ObjectBody {
            size,
            content_type,
            stream: ReaderStream::new(reader).boxed(),
        })
    }

    async fn object_size(&self, key: &str) -> ObjectResult<Option<u64>> {
        ensure_key_safe(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(
                out.content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
            )),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => {
                warn!(error = ?err, key, "s3 head_object failed");
                Err(unavailable(err))
            }
        }
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        ensure_key_safe(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> ObjectResult<PresignedUrl> {
        ensure_key_safe(key)?;
        let expires_in = expires_in.min(MAX_PRESIGN_EXPIRY);
        let config = PresigningConfig::expires_in(expires_in).map_err(unavailable)?;
        let request = match method {
            PresignMethod::Get => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(unavailable)?,
            PresignMethod::Put => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(unavailable)?,
        };
        Ok(PresignedUrl {
            url: request.uri().to_string(),
            method,
            expires_at: expiry_from_now(expires_in),
        })
    }
}
