//! Local-disk object store.
//!
//! Payloads are sharded beneath `base_path/{shard}/{shard}/{key}` and written
//! through a temp file + rename so readers never observe partial objects.
//! Presigned URLs point back at this service's `/objects/{key}` route and
//! carry an HMAC-SHA256 signature over method, key and expiry.

use super::{
    ByteStream, ObjectBody, ObjectResult, ObjectStore, ObjectStoreError, PresignMethod,
    PresignedUrl, ensure_key_safe, expiry_from_now,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use md5::Context;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies presigned object URLs.
#[derive(Clone)]
pub struct UrlSigner {
    key: Arc<[u8]>,
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Arc::from(key.as_ref()),
        }
    }

    /// A signer with a fresh random key; URLs do not survive a restart.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    fn mac(&self, method: PresignMethod, key: &str, expires: i64) -> Option<HmacSha256> {
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return None,
        };
        mac.update(method.as_str().as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Some(mac)
    }

    pub fn sign(&self, method: PresignMethod, key: &str, expires: i64) -> Option<String> {
        self.mac(method, key, expires)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time signature check plus expiry check (`now` must be before `expires`).
    pub fn verify(
        &self,
        method: PresignMethod,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if now.timestamp() >= expires {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        self.mac(method, key, expires)
            .is_some_and(|mac| mac.verify_slice(&provided).is_ok())
    }
}

#[derive(Clone, Debug)]
pub struct FsObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Externally reachable origin of this service, used in presigned URLs.
    public_base_url: String,

    signer: UrlSigner,
}

impl FsObjectStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signer,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase hex (00–ff)
    /// to keep the file count per directory small.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Recursively remove empty shard directories up to `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn backend_name(&self) -> &'static str {
        "fs"
    }

    /// Best-effort write/read/delete of a probe file under `base_path`.
    async fn ping(&self) -> ObjectResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let bytes = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if bytes? != b"readyz" {
            return Err(ObjectStoreError::Unavailable(
                "probe file content mismatch".into(),
            ));
        }
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        _content_type: Option<&str>,
        mut body: ByteStream<'_>,
    ) -> ObjectResult<u64> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ObjectStoreError::Body(err));
                }
            };
            size += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        debug!(key, size, etag = %format!("{:x}", digest.compute()), "object stored");
        Ok(size)
    }

    async fn get_object(&self, key: &str) -> ObjectResult<ObjectBody> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(key.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok(ObjectBody {
            size: Some(size),
            content_type: None,
            stream: ReaderStream::new(file).boxed(),
        })
    }

    async fn object_size(&self, key: &str) -> ObjectResult<Option<u64>> {
        ensure_key_safe(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> ObjectResult<PresignedUrl> {
        ensure_key_safe(key)?;
        let expires_at = expiry_from_now(expires_in);
        let expires = expires_at.timestamp();
        let signature = self.signer.sign(method, key, expires).ok_or_else(|| {
            ObjectStoreError::Unavailable("could not initialise url signer".into())
        })?;
        Ok(PresignedUrl {
            url: format!(
                "{}/objects/{}?expires={}&signature={}",
                self.public_base_url, key, expires, signature
            ),
            method,
            expires_at,
        })
    }
}
