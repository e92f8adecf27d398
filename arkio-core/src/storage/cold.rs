use crate::{ArkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutOptions, PutPayload, TagSet};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Metadata tags attached to every cold-storage upload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ColdTags {
    pub from_node: String,
    pub transfer_id: String,
    pub member: String,
    pub local_id: String,
    pub version: String,
}

impl ColdTags {
    fn pairs(&self) -> [(&'static str, &str); 5] {
        [
            ("from_node", &self.from_node),
            ("transfer_id", &self.transfer_id),
            ("member", &self.member),
            ("local_id", &self.local_id),
            ("version", &self.version),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Content is warm and can be retrieved now.
    AlreadyAvailable,
    /// Recall accepted; content becomes retrievable around the estimate,
    /// typically hours later and outside the requesting worker's lifetime.
    Accepted {
        estimated_available_at: DateTime<Utc>,
    },
    /// The object does not exist in cold storage at all.
    NotFound,
}

/// Archival object storage with retrieval latency.
#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn put(&self, key: &str, local_path: &Path, tags: &ColdTags) -> Result<()>;

    async fn restore_request(&self, key: &str) -> Result<RestoreStatus>;

    /// Downloads a warm object to `dest`, returning the byte count.
    async fn retrieve(&self, key: &str, dest: &Path) -> Result<u64>;

    async fn available(&self, key: &str) -> Result<bool>;
}

/// Cold store backed by an [`object_store::ObjectStore`] (S3 and friends).
///
/// `object_store` has no RestoreObject call, so warmth is probed with a
/// one-byte ranged GET: success means warm, a non-missing failure means the
/// object is still frozen or thawing. The recall request itself happens at
/// the provider boundary; we report the configured lead time as the estimate.
pub struct ObjectColdStore {
    store: Arc<dyn ObjectStore>,
    restore_lead: chrono::Duration,
}

impl ObjectColdStore {
    pub fn new(store: Arc<dyn ObjectStore>, restore_lead: chrono::Duration) -> Self {
        Self {
            store,
            restore_lead,
        }
    }
}

#[async_trait]
impl ColdStore for ObjectColdStore {
    async fn put(&self, key: &str, local_path: &Path, tags: &ColdTags) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;

        let mut tag_set = TagSet::default();
        for (name, value) in tags.pairs() {
            tag_set.push(name, value);
        }
        let options = PutOptions {
            tags: tag_set,
            ..PutOptions::default()
        };

        self.store
            .put_opts(&ObjectPath::from(key), PutPayload::from(data), options)
            .await?;
        tracing::debug!("Uploaded {} to cold storage", key);
        Ok(())
    }

    async fn restore_request(&self, key: &str) -> Result<RestoreStatus> {
        let path = ObjectPath::from(key);
        match self.store.head(&path).await {
            Err(object_store::Error::NotFound { .. }) => return Ok(RestoreStatus::NotFound),
            Err(error) => return Err(error.into()),
            Ok(_) => {}
        }

        match self.store.get_range(&path, 0..1).await {
            Ok(_) => Ok(RestoreStatus::AlreadyAvailable),
            Err(object_store::Error::NotFound { .. }) => Ok(RestoreStatus::NotFound),
            Err(error) => {
                tracing::info!("Object {} not yet warm: {}", key, error);
                Ok(RestoreStatus::Accepted {
                    estimated_available_at: Utc::now() + self.restore_lead,
                })
            }
        }
    }

    async fn retrieve(&self, key: &str, dest: &Path) -> Result<u64> {
        let result = self.store.get(&ObjectPath::from(key)).await.map_err(|error| {
            match error {
                object_store::Error::NotFound { .. } => {
                    ArkError::NotFound(format!("cold object {}", key))
                }
                other => other.into(),
            }
        })?;

        let bytes = result.bytes().await?;
        let len = bytes.len() as u64;
        tokio::fs::write(dest, &bytes).await?;
        Ok(len)
    }

    async fn available(&self, key: &str) -> Result<bool> {
        let path = ObjectPath::from(key);
        match self.store.head(&path).await {
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(error) => return Err(error.into()),
            Ok(_) => {}
        }

        // The object exists, so a failed ranged read means frozen or thawing.
        match self.store.get_range(&path, 0..1).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// Directory-backed cold store for tests and local clusters.
///
/// Keys can be frozen; a restore request schedules a thaw after the
/// configured delay, which models the hours-long Glacier recall at second
/// scale. Tags are written to a JSON sidecar so uploads can be inspected.
pub struct FsColdStore {
    base_path: PathBuf,
    thaw_delay: chrono::Duration,
    frozen: Mutex<HashSet<String>>,
    thawing: Mutex<HashMap<String, DateTime<Utc>>>,
    put_calls: AtomicUsize,
    retrieve_calls: AtomicUsize,
}

impl FsColdStore {
    pub fn new(base_path: PathBuf, thaw_delay: chrono::Duration) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            thaw_delay,
            frozen: Mutex::new(HashSet::new()),
            thawing: Mutex::new(HashMap::new()),
            put_calls: AtomicUsize::new(0),
            retrieve_calls: AtomicUsize::new(0),
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn tags_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.tags.json", key))
    }

    /// Marks an existing key as requiring a restore before retrieval.
    pub fn freeze(&self, key: &str) {
        if let Ok(mut frozen) = self.frozen.lock() {
            frozen.insert(key.to_string());
        }
    }

    fn is_frozen(&self, key: &str) -> bool {
        self.frozen
            .lock()
            .map(|frozen| frozen.contains(key))
            .unwrap_or(false)
    }

    fn thaw_if_due(&self, key: &str) -> Option<DateTime<Utc>> {
        let mut thawing = self.thawing.lock().ok()?;
        let eta = *thawing.get(key)?;
        if eta <= Utc::now() {
            thawing.remove(key);
            if let Ok(mut frozen) = self.frozen.lock() {
                frozen.remove(key);
            }
            None
        } else {
            Some(eta)
        }
    }

    pub fn put_count(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn retrieve_count(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    pub fn stored_tags(&self, key: &str) -> Result<ColdTags> {
        let raw = std::fs::read_to_string(self.tags_path(key))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl ColdStore for FsColdStore {
    async fn put(&self, key: &str, local_path: &Path, tags: &ColdTags) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(local_path, self.object_path(key)).await?;
        tokio::fs::write(self.tags_path(key), serde_json::to_vec(tags)?).await?;
        Ok(())
    }

    async fn restore_request(&self, key: &str) -> Result<RestoreStatus> {
        if !self.object_path(key).exists() {
            return Ok(RestoreStatus::NotFound);
        }

        if !self.is_frozen(key) {
            return Ok(RestoreStatus::AlreadyAvailable);
        }

        if let Some(eta) = self.thaw_if_due(key) {
            return Ok(RestoreStatus::Accepted {
                estimated_available_at: eta,
            });
        }
        if !self.is_frozen(key) {
            return Ok(RestoreStatus::AlreadyAvailable);
        }

        let eta = Utc::now() + self.thaw_delay;
        if let Ok(mut thawing) = self.thawing.lock() {
            thawing.insert(key.to_string(), eta);
        }
        Ok(RestoreStatus::Accepted {
            estimated_available_at: eta,
        })
    }

    async fn retrieve(&self, key: &str, dest: &Path) -> Result<u64> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let source = self.object_path(key);
        if !source.exists() {
            return Err(ArkError::NotFound(format!("cold object {}", key)));
        }
        if self.is_frozen(key) {
            return Err(ArkError::Storage(format!(
                "object {} is in cold storage and not yet restored",
                key
            )));
        }
        Ok(tokio::fs::copy(&source, dest).await?)
    }

    async fn available(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key).exists() && !self.is_frozen(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOpts,
        PutResult,
    };

    /// Object store whose every request fails like a dropped connection.
    #[derive(Debug)]
    struct DownStore;

    impl std::fmt::Display for DownStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "DownStore")
        }
    }

    fn connection_error() -> object_store::Error {
        object_store::Error::Generic {
            store: "DownStore",
            source: "connection reset".into(),
        }
    }

    #[async_trait]
    impl ObjectStore for DownStore {
        async fn put_opts(
            &self,
            _location: &ObjectPath,
            _payload: PutPayload,
            _opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            Err(connection_error())
        }

        async fn put_multipart_opts(
            &self,
            _location: &ObjectPath,
            _opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            Err(connection_error())
        }

        async fn get_opts(
            &self,
            _location: &ObjectPath,
            _options: GetOptions,
        ) -> object_store::Result<GetResult> {
            Err(connection_error())
        }

        async fn delete(&self, _location: &ObjectPath) -> object_store::Result<()> {
            Err(connection_error())
        }

        fn list(
            &self,
            _prefix: Option<&ObjectPath>,
        ) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            Box::pin(futures_util::stream::empty())
        }

        async fn list_with_delimiter(
            &self,
            _prefix: Option<&ObjectPath>,
        ) -> object_store::Result<ListResult> {
            Err(connection_error())
        }

        async fn copy(&self, _from: &ObjectPath, _to: &ObjectPath) -> object_store::Result<()> {
            Err(connection_error())
        }

        async fn copy_if_not_exists(
            &self,
            _from: &ObjectPath,
            _to: &ObjectPath,
        ) -> object_store::Result<()> {
            Err(connection_error())
        }
    }

    fn tags() -> ColdTags {
        ColdTags {
            from_node: "aptrust".to_string(),
            transfer_id: "xfer-1".to_string(),
            member: "member-1".to_string(),
            local_id: "photos-2020".to_string(),
            version: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_retrieve_round_trip_with_tags() {
        let dir = tempfile::tempdir().unwrap();
        let cold = FsColdStore::new(dir.path().join("cold"), chrono::Duration::zero()).unwrap();

        let source = dir.path().join("bag.tar");
        tokio::fs::write(&source, b"tar bytes").await.unwrap();
        cold.put("abc.tar", &source, &tags()).await.unwrap();

        assert!(cold.available("abc.tar").await.unwrap());
        assert_eq!(cold.stored_tags("abc.tar").unwrap().from_node, "aptrust");

        let dest = dir.path().join("out.tar");
        let len = cold.retrieve("abc.tar", &dest).await.unwrap();
        assert_eq!(len, 9);
    }

    #[tokio::test]
    async fn test_frozen_object_requires_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cold = FsColdStore::new(dir.path().join("cold"), chrono::Duration::zero()).unwrap();

        let source = dir.path().join("bag.tar");
        tokio::fs::write(&source, b"x").await.unwrap();
        cold.put("k.tar", &source, &tags()).await.unwrap();
        cold.freeze("k.tar");

        assert!(!cold.available("k.tar").await.unwrap());
        let dest = dir.path().join("out.tar");
        assert!(cold.retrieve("k.tar", &dest).await.is_err());

        // Zero thaw delay: first request schedules the thaw, second sees it done.
        let first = cold.restore_request("k.tar").await.unwrap();
        assert!(matches!(first, RestoreStatus::Accepted { .. }));
        let second = cold.restore_request("k.tar").await.unwrap();
        assert_eq!(second, RestoreStatus::AlreadyAvailable);

        cold.retrieve("k.tar", &dest).await.unwrap();
    }

    #[tokio::test]
    async fn test_object_store_availability_probe() {
        let store = Arc::new(InMemory::new());
        store
            .put(&ObjectPath::from("warm.tar"), PutPayload::from_static(b"x"))
            .await
            .unwrap();
        let cold = ObjectColdStore::new(store, chrono::Duration::hours(1));

        assert!(cold.available("warm.tar").await.unwrap());
        assert!(!cold.available("missing.tar").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_store_surfaces_error_instead_of_parking() {
        let cold = ObjectColdStore::new(Arc::new(DownStore), chrono::Duration::hours(1));

        let error = cold.available("bag.tar").await.unwrap_err();
        assert!(matches!(error, ArkError::ObjectStore(_)));
        assert!(!error.is_fatal());

        let error = cold.restore_request("bag.tar").await.unwrap_err();
        assert!(matches!(error, ArkError::ObjectStore(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cold = FsColdStore::new(dir.path().join("cold"), chrono::Duration::zero()).unwrap();

        assert_eq!(
            cold.restore_request("nope.tar").await.unwrap(),
            RestoreStatus::NotFound
        );
        let error = cold
            .retrieve("nope.tar", &dir.path().join("out.tar"))
            .await
            .unwrap_err();
        assert!(error.is_fatal());
    }
}
