//! In-memory object store with fault injection, for tests and local runs.

use super::{
    ByteStream, ObjectBody, ObjectResult, ObjectStore, ObjectStoreError, PresignMethod,
    PresignedUrl, ensure_key_safe, expiry_from_now,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

#[derive(Debug, Default)]
struct Faults {
    /// Keys whose existence checks fail as if the backend were unreachable.
    failing_keys: HashSet<String>,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, Option<String>)>>,
    faults: Mutex<Faults>,
    hang: AtomicBool,
    presign_fails: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object directly, as a client holding a presigned PUT would.
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Bytes>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.into(), (bytes.into(), None));
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    /// Make every operation on `key` fail with `Unavailable` until healed.
    pub fn fail_key(&self, key: impl Into<String>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_keys.insert(key.into());
        }
    }

    pub fn heal_key(&self, key: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_keys.remove(key);
        }
    }

    /// Make every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable = unavailable;
        }
    }

    /// Make existence checks and presigning stall far beyond any sane timeout.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_presign_fails(&self, fails: bool) {
        self.presign_fails.store(fails, Ordering::SeqCst);
    }

    fn objects(&self) -> ObjectResult<MutexGuard<'_, HashMap<String, (Bytes, Option<String>)>>> {
        self.objects
            .lock()
            .map_err(|_| ObjectStoreError::Unavailable("memory object store poisoned".into()))
    }

    fn check_faults(&self, key: &str) -> ObjectResult<()> {
        let faults = self
            .faults
            .lock()
            .map_err(|_| ObjectStoreError::Unavailable("memory object store poisoned".into()))?;
        if faults.unavailable || faults.failing_keys.contains(key) {
            return Err(ObjectStoreError::Unavailable(format!(
                "injected failure for `{key}`"
            )));
        }
        Ok(())
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> ObjectResult<()> {
        self.check_faults("")
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: Option<&str>,
        mut body: ByteStream<'_>,
    ) -> ObjectResult<u64> {
        ensure_key_safe(key)?;
        self.check_faults(key)?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.map_err(ObjectStoreError::Body)?);
        }
        let size = buf.len() as u64;
        self.objects()?.insert(
            key.to_string(),
            (buf.freeze(), content_type.map(str::to_string)),
        );
        Ok(size)
    }

    async fn get_object(&self, key: &str) -> ObjectResult<ObjectBody> {
        self.check_faults(key)?;
        let (bytes, content_type) = self
            .objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(ObjectBody {
            size: Some(bytes.len() as u64),
            content_type,
            stream: stream::once(async move { Ok(bytes) }).boxed(),
        })
    }

    async fn object_size(&self, key: &str) -> ObjectResult<Option<u64>> {
        self.maybe_hang().await;
        self.check_faults(key)?;
        Ok(self
            .objects()?
            .get(key)
            .map(|(bytes, _)| bytes.len() as u64))
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        self.check_faults(key)?;
        self.objects()?.remove(key);
        Ok(())
    }

    async fn presign(
        &self,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> ObjectResult<PresignedUrl> {
        ensure_key_safe(key)?;
        self.maybe_hang().await;
        self.check_faults(key)?;
        if self.presign_fails.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable("presign rejected".into()));
        }
        let expires_at = expiry_from_now(expires_in);
        Ok(PresignedUrl {
            url: format!(
                "memory://objects/{key}?method={}&expires={}",
                method.as_str(),
                expires_at.timestamp()
            ),
            method,
            expires_at,
        })
    }
}
