use crate::{ArkError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Staging area with byte-capacity accounting.
///
/// Capacity is reserved before a copy or download starts, never during one;
/// a failed reservation defers the work instead of proceeding optimistically.
pub struct StagingStore {
    base_path: PathBuf,
    capacity_bytes: u64,
    reserved: Mutex<HashMap<Uuid, u64>>,
}

impl StagingStore {
    pub fn new(base_path: PathBuf, capacity_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            capacity_bytes,
            reserved: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of a bag's staged tar: `<staging>/<uuid>.tar`.
    pub fn tar_path(&self, bag: Uuid) -> PathBuf {
        self.base_path.join(format!("{}.tar", bag))
    }

    /// Reserves `size` bytes for a bag. Re-reserving the same bag replaces
    /// the previous reservation, so redelivered tasks do not double-count.
    pub fn reserve(&self, bag: Uuid, size: u64) -> Result<()> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| ArkError::Internal("staging lock poisoned".to_string()))?;

        let others: u64 = reserved
            .iter()
            .filter(|(uuid, _)| **uuid != bag)
            .map(|(_, bytes)| bytes)
            .sum();

        if others + size > self.capacity_bytes {
            return Err(ArkError::CapacityExhausted {
                needed: size,
                available: self.capacity_bytes.saturating_sub(others),
            });
        }

        reserved.insert(bag, size);
        Ok(())
    }

    pub fn release(&self, bag: Uuid) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.remove(&bag);
        }
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved
            .lock()
            .map(|reserved| reserved.values().sum())
            .unwrap_or(0)
    }

    /// Byte-for-byte size check backing resumable retrieval: a correctly
    /// sized local copy means zero download calls.
    pub fn has_sized_copy(&self, bag: Uuid, size: u64) -> bool {
        std::fs::metadata(self.tar_path(bag))
            .map(|meta| meta.is_file() && meta.len() == size)
            .unwrap_or(false)
    }

    pub async fn delete_tar(&self, bag: Uuid) -> Result<()> {
        let path = self.tar_path(bag);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            tracing::debug!("Deleted staged tar for bag {}", bag);
        }
        self.release(bag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_within_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path().to_path_buf(), 1000).unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        staging.reserve(a, 600).unwrap();

        let error = staging.reserve(b, 500).unwrap_err();
        assert!(matches!(
            error,
            ArkError::CapacityExhausted {
                needed: 500,
                available: 400
            }
        ));

        staging.release(a);
        staging.reserve(b, 500).unwrap();
        assert_eq!(staging.reserved_bytes(), 500);
    }

    #[test]
    fn test_re_reserving_same_bag_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path().to_path_buf(), 1000).unwrap();

        let bag = Uuid::new_v4();
        staging.reserve(bag, 800).unwrap();
        staging.reserve(bag, 800).unwrap();
        assert_eq!(staging.reserved_bytes(), 800);
    }

    #[tokio::test]
    async fn test_sized_copy_check_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingStore::new(dir.path().to_path_buf(), 10_000).unwrap();

        let bag = Uuid::new_v4();
        assert!(!staging.has_sized_copy(bag, 9));

        tokio::fs::write(staging.tar_path(bag), b"123456789")
            .await
            .unwrap();
        assert!(staging.has_sized_copy(bag, 9));
        assert!(!staging.has_sized_copy(bag, 10));

        staging.delete_tar(bag).await.unwrap();
        assert!(!staging.tar_path(bag).exists());
    }
}
