//! In-process versioned store used by tests and dry experiments.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pit_restore_core::{
    DeleteMarkerEntry, HistoryPage, PageToken, RetrievalStatus, StorageClass, VersionEntry,
};

use super::{CopyRequest, ObjectStore, RetrievalError, StoreError};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct Stored {
    key: String,
    version_id: String,
    last_modified: DateTime<Utc>,
    /// `None` for a delete marker.
    body: Option<Vec<u8>>,
    storage_class: StorageClass,
    retain_until: Option<DateTime<Utc>>,
    retrieval: RetrievalStatus,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, Vec<Stored>>,
    seq: u64,
    failing: HashSet<String>,
    failing_retention: HashSet<String>,
    failing_status: HashSet<String>,
    retrieval_conflict: bool,
    retrieval_requests: Vec<(String, String, String)>,
    copies: Vec<CopyRequest>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push(
        &mut self,
        bucket: &str,
        key: &str,
        body: Option<Vec<u8>>,
        storage_class: StorageClass,
        at: DateTime<Utc>,
    ) -> String {
        let seq = self.next_seq();
        let version_id = format!("{seq:08x}");
        self.buckets.entry(bucket.to_string()).or_default().push(Stored {
            key: key.to_string(),
            version_id: version_id.clone(),
            last_modified: at,
            body,
            storage_class,
            retain_until: None,
            retrieval: RetrievalStatus::NotRequested,
            seq,
        });
        version_id
    }

    fn find(&self, bucket: &str, key: &str, version_id: &str) -> Option<&Stored> {
        self.buckets
            .get(bucket)?
            .iter()
            .find(|s| s.key == key && s.version_id == version_id)
    }

    fn find_mut(&mut self, bucket: &str, key: &str, version_id: &str) -> Option<&mut Stored> {
        self.buckets
            .get_mut(bucket)?
            .iter_mut()
            .find(|s| s.key == key && s.version_id == version_id)
    }

    /// Everything under `prefix` in listing order.
    fn ordered(&self, bucket: &str, prefix: &str) -> Vec<Stored> {
        let mut all: Vec<Stored> = self
            .buckets
            .get(bucket)
            .map(|v| {
                v.iter()
                    .filter(|s| s.key.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        all.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(b.last_modified.cmp(&a.last_modified))
                .then(b.seq.cmp(&a.seq))
        });
        all
    }

    fn check_failing(&self, op: &'static str, key: &str) -> Result<(), StoreError> {
        if self.failing.contains(key) {
            return Err(StoreError::service(op, format!("injected failure for '{key}'")));
        }
        Ok(())
    }
}

/// Versioned buckets held in memory.
///
/// Listing follows the service contract: key ascending, newest first within
/// a key, and pages of at most `page_size` entries counted over versions and
/// delete markers together.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: usize,
    latency: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: DEFAULT_PAGE_SIZE,
            latency: Duration::ZERO,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delays every download, copy and delete by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Writes a new STANDARD version, returning its version id.
    pub fn put(&self, bucket: &str, key: &str, body: &[u8], at: DateTime<Utc>) -> String {
        self.put_with_class(bucket, key, body, StorageClass::Standard, at)
    }

    pub fn put_with_class(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        class: StorageClass,
        at: DateTime<Utc>,
    ) -> String {
        self.lock()
            .push(bucket, key, Some(body.to_vec()), class, at)
    }

    /// Places a delete marker, returning its version id.
    pub fn delete(&self, bucket: &str, key: &str, at: DateTime<Utc>) -> String {
        self.lock()
            .push(bucket, key, None, StorageClass::Standard, at)
    }

    pub fn set_retention(&self, bucket: &str, key: &str, version_id: &str, until: DateTime<Utc>) {
        if let Some(s) = self.lock().find_mut(bucket, key, version_id) {
            s.retain_until = Some(until);
        }
    }

    pub fn set_retrieval(&self, bucket: &str, key: &str, version_id: &str, status: RetrievalStatus) {
        if let Some(s) = self.lock().find_mut(bucket, key, version_id) {
            s.retrieval = status;
        }
    }

    /// Makes every retrieval request answer "already in progress".
    pub fn reject_retrievals_as_in_progress(&self) {
        self.lock().retrieval_conflict = true;
    }

    /// Makes downloads and copies of `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.lock().failing.insert(key.to_string());
    }

    /// Makes retention lookups for `key` fail.
    pub fn fail_retention(&self, key: &str) {
        self.lock().failing_retention.insert(key.to_string());
    }

    /// Makes retrieval status lookups for `key` fail.
    pub fn fail_retrieval_status(&self, key: &str) {
        self.lock().failing_status.insert(key.to_string());
    }

    /// Body of the current version, `None` when absent or deleted.
    pub fn current(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        let newest = inner
            .buckets
            .get(bucket)?
            .iter()
            .filter(|s| s.key == key)
            .max_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then(a.seq.cmp(&b.seq))
            })?;
        newest.body.clone()
    }

    /// Number of versions and delete markers in `bucket`.
    pub fn entry_count(&self, bucket: &str) -> usize {
        self.lock().buckets.get(bucket).map_or(0, Vec::len)
    }

    /// `(bucket, key, version_id)` of every retrieval request received.
    pub fn retrieval_requests(&self) -> Vec<(String, String, String)> {
        self.lock().retrieval_requests.clone()
    }

    pub fn copies(&self) -> Vec<CopyRequest> {
        self.lock().copies.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_versions_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&PageToken>,
    ) -> Result<HistoryPage, StoreError> {
        let ordered = self.lock().ordered(bucket, prefix);

        let start = match token {
            None => 0,
            Some(PageToken {
                key_marker,
                version_id_marker: Some(vid),
            }) => ordered
                .iter()
                .position(|s| &s.key == key_marker && &s.version_id == vid)
                .map(|p| p + 1)
                .ok_or_else(|| StoreError::service("list_object_versions", "unknown version id marker"))?,
            Some(PageToken {
                key_marker,
                version_id_marker: None,
            }) => ordered.partition_point(|s| s.key.as_str() <= key_marker.as_str()),
        };
        let end = (start + self.page_size).min(ordered.len());

        let mut page = HistoryPage::default();
        for (idx, s) in ordered.iter().enumerate().take(end).skip(start) {
            let is_latest = idx == 0 || ordered[idx - 1].key != s.key;
            match &s.body {
                Some(body) => page.versions.push(VersionEntry {
                    key: s.key.clone(),
                    version_id: s.version_id.clone(),
                    last_modified: s.last_modified,
                    size: body.len() as u64,
                    storage_class: s.storage_class.clone(),
                    is_latest,
                }),
                None => page.delete_markers.push(DeleteMarkerEntry {
                    key: s.key.clone(),
                    version_id: s.version_id.clone(),
                    last_modified: s.last_modified,
                }),
            }
        }
        if end < ordered.len() {
            let last = &ordered[end - 1];
            page.next = Some(PageToken {
                key_marker: last.key.clone(),
                version_id_marker: Some(last.version_id.clone()),
            });
        }
        Ok(page)
    }

    async fn retention(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.lock();
        if inner.failing_retention.contains(key) {
            return Err(StoreError::service("get_object_retention", "AccessDenied"));
        }
        let stored = inner
            .find(bucket, key, version_id)
            .ok_or_else(|| StoreError::service("get_object_retention", "no such version"))?;
        Ok(stored.retain_until)
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
        path: &Path,
    ) -> Result<(), StoreError> {
        self.pause().await;
        let body = {
            let inner = self.lock();
            inner.check_failing("get_object", key)?;
            let stored = inner
                .find(bucket, key, version_id)
                .ok_or_else(|| StoreError::service("get_object", "no such version"))?;
            if stored.storage_class.requires_retrieval()
                && stored.retrieval != RetrievalStatus::Complete
            {
                return Err(StoreError::service("get_object", "InvalidObjectState"));
            }
            stored
                .body
                .clone()
                .ok_or_else(|| StoreError::service("get_object", "version is a delete marker"))?
        };
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    async fn copy_object(&self, req: &CopyRequest) -> Result<(), StoreError> {
        self.pause().await;
        let mut inner = self.lock();
        inner.check_failing("copy_object", &req.source_key)?;
        let body = inner
            .find(&req.source_bucket, &req.source_key, &req.source_version_id)
            .and_then(|s| s.body.clone())
            .ok_or_else(|| StoreError::service("copy_object", "no such source version"))?;
        inner.push(
            &req.dest_bucket,
            &req.dest_key,
            Some(body),
            StorageClass::Standard,
            Utc::now(),
        );
        inner.copies.push(req.clone());
        Ok(())
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.pause().await;
        let mut inner = self.lock();
        match version_id {
            Some(vid) => {
                if let Some(entries) = inner.buckets.get_mut(bucket) {
                    entries.retain(|s| !(s.key == key && s.version_id == vid));
                }
            }
            None => {
                inner.push(bucket, key, None, StorageClass::Standard, Utc::now());
            }
        }
        Ok(())
    }

    async fn request_retrieval(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
        _days: i32,
    ) -> Result<(), RetrievalError> {
        let mut inner = self.lock();
        inner
            .retrieval_requests
            .push((bucket.to_string(), key.to_string(), version_id.to_string()));
        if inner.retrieval_conflict {
            return Err(RetrievalError::AlreadyInProgress);
        }
        let stored = inner
            .find_mut(bucket, key, version_id)
            .ok_or_else(|| StoreError::service("restore_object", "no such version"))?;
        if stored.retrieval == RetrievalStatus::InProgress {
            return Err(RetrievalError::AlreadyInProgress);
        }
        stored.retrieval = RetrievalStatus::InProgress;
        Ok(())
    }

    async fn retrieval_status(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<RetrievalStatus, StoreError> {
        let inner = self.lock();
        if inner.failing_status.contains(key) {
            return Err(StoreError::service("head_object", "SlowDown"));
        }
        inner
            .find(bucket, key, version_id)
            .map(|s| s.retrieval)
            .ok_or_else(|| StoreError::service("head_object", "no such version"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, m, 0).unwrap()
    }

    async fn all_pages(store: &MemoryStore, bucket: &str) -> Vec<HistoryPage> {
        let mut pages = Vec::new();
        let mut token = None;
        loop {
            let page = store.list_versions_page(bucket, "", token.as_ref()).await.unwrap();
            token = page.next.clone();
            pages.push(page);
            if token.is_none() {
                return pages;
            }
        }
    }

    #[tokio::test]
    async fn listing_orders_by_key_then_newest() {
        let store = MemoryStore::new();
        store.put("b", "z", b"1", t(0));
        store.put("b", "a", b"1", t(0));
        store.delete("b", "a", t(2));
        store.put("b", "a", b"22", t(1));

        let page = store.list_versions_page("b", "", None).await.unwrap();
        let keys: Vec<_> = page.versions.iter().map(|v| (v.key.as_str(), v.size)).collect();
        assert_eq!(keys, vec![("a", 2), ("a", 1), ("z", 1)]);
        assert_eq!(page.delete_markers.len(), 1);
        assert!(!page.versions[0].is_latest, "marker is the latest for 'a'");
        assert!(page.versions[2].is_latest);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn pages_cover_everything_once() {
        let store = MemoryStore::new().with_page_size(2);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            store.put("b", key, b"x", t(i as u32));
            store.delete("b", key, t(i as u32 + 10));
        }
        let pages = all_pages(&store, "b").await;
        assert_eq!(pages.len(), 3);
        let total: usize = pages
            .iter()
            .map(|p| p.versions.len() + p.delete_markers.len())
            .sum();
        assert_eq!(total, 6);
        for (page, key) in pages.iter().zip(["a", "b", "c"]) {
            assert_eq!(page.delete_markers[0].key, key);
            assert_eq!(page.versions[0].key, key);
        }
    }

    #[tokio::test]
    async fn prefix_filters_keys() {
        let store = MemoryStore::new();
        store.put("b", "logs/1", b"x", t(0));
        store.put("b", "data/1", b"x", t(0));
        let page = store.list_versions_page("b", "logs/", None).await.unwrap();
        assert_eq!(page.versions.len(), 1);
        assert_eq!(page.versions[0].key, "logs/1");
    }

    #[tokio::test]
    async fn archival_download_needs_completed_retrieval() {
        let store = MemoryStore::new();
        let vid = store.put_with_class("b", "cold", b"ice", StorageClass::Glacier, t(0));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cold");

        assert!(store.download("b", "cold", &vid, &path).await.is_err());
        store.request_retrieval("b", "cold", &vid, 3).await.unwrap();
        assert!(matches!(
            store.request_retrieval("b", "cold", &vid, 3).await,
            Err(RetrievalError::AlreadyInProgress)
        ));
        store.set_retrieval("b", "cold", &vid, RetrievalStatus::Complete);
        store.download("b", "cold", &vid, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ice");
    }

    #[tokio::test]
    async fn unversioned_delete_hides_key() {
        let store = MemoryStore::new();
        store.put("b", "k", b"v", t(0));
        store.delete_object("b", "k", None).await.unwrap();
        assert_eq!(store.current("b", "k"), None);
        assert_eq!(store.entry_count("b"), 2);
    }

    #[tokio::test]
    async fn lookup_faults_are_per_key() {
        let store = MemoryStore::new();
        let cold = store.put_with_class("b", "cold", b"ice", StorageClass::Glacier, t(0));
        let warm = store.put("b", "warm", b"sun", t(0));
        store.fail_retention("cold");
        store.fail_retrieval_status("cold");

        assert!(store.retention("b", "cold", &cold).await.is_err());
        assert!(store.retrieval_status("b", "cold", &cold).await.is_err());
        assert_eq!(store.retention("b", "warm", &warm).await.unwrap(), None);
        assert!(store.retrieval_status("b", "warm", &warm).await.is_ok());
    }
}
