//! Content copy boundary between nodes.
//!
//! Copy failures are transient by contract: a non-zero exit from the copy
//! command is a network or configuration issue and must never by itself
//! cancel a transfer.

use crate::{ArkError, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

#[async_trait]
pub trait Copier: Send + Sync {
    /// Copies bag content from a protocol-qualified transfer link
    /// (e.g. `user@host:outbound/<uuid>.tar`) to `dest`.
    async fn copy(&self, link: &str, dest: &Path) -> Result<()>;
}

/// Copier shelling out to an authenticated rsync.
pub struct RsyncCopier {
    extra_args: Vec<String>,
}

impl RsyncCopier {
    pub fn new(extra_args: Vec<String>) -> Self {
        Self { extra_args }
    }
}

#[async_trait]
impl Copier for RsyncCopier {
    async fn copy(&self, link: &str, dest: &Path) -> Result<()> {
        let status = Command::new("rsync")
            .arg("-aq")
            .args(&self.extra_args)
            .arg(link)
            .arg(dest)
            .status()
            .await
            .map_err(|error| ArkError::Copy(format!("failed to spawn rsync: {}", error)))?;

        if !status.success() {
            return Err(ArkError::Copy(format!(
                "rsync exited with {} for {}",
                status, link
            )));
        }
        Ok(())
    }
}

/// Copier for local clusters and tests: the link is a plain filesystem path.
pub struct LocalCopier;

#[async_trait]
impl Copier for LocalCopier {
    async fn copy(&self, link: &str, dest: &Path) -> Result<()> {
        tokio::fs::copy(link, dest)
            .await
            .map_err(|error| ArkError::Copy(format!("copy of {} failed: {}", link, error)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_copier_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.tar");
        let dest = dir.path().join("dst.tar");
        tokio::fs::write(&source, b"payload").await.unwrap();

        LocalCopier
            .copy(source.to_str().unwrap(), &dest)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_missing_source_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let error = LocalCopier
            .copy("/no/such/file.tar", &dir.path().join("dst.tar"))
            .await
            .unwrap_err();
        assert!(!error.is_fatal());
    }
}
