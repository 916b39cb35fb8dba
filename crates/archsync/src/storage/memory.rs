//! In-memory object store
//!
//! Behaves like a bucket for the operations the pipeline uses, counts puts per
//! key and can be told to fail upcoming requests. Used by tests and handy
//! for exercising the pipeline without a network.

use super::{ObjectMeta, ObjectStore, PutOutcome, StoreError, StoreResult, SHA256_METADATA_KEY};
use archsync_common::checksum::{compute_checksum, md5_base64, ContentDigests};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    etag: String,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    put_counts: HashMap<String, usize>,
    put_failures: VecDeque<StoreError>,
    unreachable: bool,
    no_credentials: bool,
    stale_uploads: usize,
}

#[derive(Debug)]
pub struct MemoryStore {
    bucket: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicked test thread must not hide the store from the others
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Fault injection and inspection
    // ------------------------------------------------------------------------

    /// Make the next put fail with `err`; calls queue up in order
    pub fn fail_next_put(&self, err: StoreError) {
        self.lock().put_failures.push_back(err);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub fn set_credentials(&self, present: bool) {
        self.lock().no_credentials = !present;
    }

    /// Pretend `count` stale multipart uploads exist
    pub fn set_stale_uploads(&self, count: usize) {
        self.lock().stale_uploads = count;
    }

    /// Successful puts for `key` so far
    pub fn put_count(&self, key: &str) -> usize {
        self.lock().put_counts.get(key).copied().unwrap_or(0)
    }

    pub fn total_puts(&self) -> usize {
        self.lock().put_counts.values().sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).map(|o| o.data.clone())
    }

    /// Store raw bytes without metadata, as a foreign writer would
    pub fn insert_raw(&self, key: &str, data: Vec<u8>) {
        let etag = format!("\"{}\"", md5_base64(&data));
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: HashMap::new(),
                etag,
            },
        );
    }

    /// Flip the byte at `offset` of an object, keeping its user metadata.
    /// The etag follows the new content, as it would after a rewrite.
    pub fn corrupt(&self, key: &str, offset: usize) -> bool {
        let mut inner = self.lock();
        let Some(object) = inner.objects.get_mut(key) else {
            return false;
        };
        let Some(byte) = object.data.get_mut(offset) else {
            return false;
        };
        *byte ^= 0xFF;
        object.etag = format!("\"{}\"", md5_base64(&object.data));
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().objects.remove(key).is_some()
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.lock().unreachable {
            return Err(StoreError::Transient(format!(
                "bucket '{}' is unreachable",
                self.bucket
            )));
        }
        Ok(())
    }

    fn store(&self, key: &str, data: Vec<u8>, sha256: Option<String>) -> StoreResult<PutOutcome> {
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(StoreError::Transient(format!("bucket '{}' is unreachable", self.bucket)));
        }
        if let Some(err) = inner.put_failures.pop_front() {
            return Err(err);
        }

        let etag = format!("\"{}\"", md5_base64(&data));
        let mut metadata = HashMap::new();
        if let Some(sha) = sha256 {
            metadata.insert(SHA256_METADATA_KEY.to_string(), sha);
        }
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata,
                etag: etag.clone(),
            },
        );
        *inner.put_counts.entry(key.to_string()).or_insert(0) += 1;

        Ok(PutOutcome { etag: Some(etag) })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn describe(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        digests: &ContentDigests,
    ) -> StoreResult<PutOutcome> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Permanent(format!("cannot read {}: {e}", path.display())))?;

        // what S3 does with a Content-MD5 that does not match the body
        if md5_base64(&data) != digests.md5_base64 {
            return Err(StoreError::Permanent(format!("BadDigest for '{key}'")));
        }

        self.store(key, data, Some(digests.sha256_hex.clone()))
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        let sha = compute_checksum(&data);
        self.store(key, data, Some(sha)).map(|_| ())
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        self.check_reachable()?;
        Ok(self.lock().objects.get(key).map(|o| ObjectMeta {
            key: key.to_string(),
            size: o.data.len() as u64,
            sha256: o.metadata.get(SHA256_METADATA_KEY).cloned(),
            etag: Some(o.etag.clone()),
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectMeta {
                key: k.clone(),
                size: o.data.len() as u64,
                sha256: None,
                etag: Some(o.etag.clone()),
            })
            .collect())
    }

    async fn read_range(&self, key: &str, start: u64, len: u64) -> StoreResult<Vec<u8>> {
        self.check_reachable()?;
        let inner = self.lock();
        let object = inner
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let start = (start as usize).min(object.data.len());
        let end = start.saturating_add(len as usize).min(object.data.len());
        Ok(object.data[start..end].to_vec())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_reachable()?;
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn check_credentials(&self) -> StoreResult<()> {
        if self.lock().no_credentials {
            return Err(StoreError::Permanent("no credentials configured".to_string()));
        }
        Ok(())
    }

    async fn check_destination(&self) -> StoreResult<()> {
        self.check_reachable()
    }

    async fn abort_stale_uploads(
        &self,
        _prefix: &str,
        _max_age: std::time::Duration,
    ) -> StoreResult<usize> {
        self.check_reachable()?;
        Ok(std::mem::take(&mut self.lock().stale_uploads))
    }
}
