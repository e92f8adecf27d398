//! Bag packaging and validation boundary.
//!
//! Full bag-format semantics belong to a separate library; arkio needs just
//! enough structure to package local objects into the network's bag layout,
//! verify a received bag's payload manifest, and expose the per-file digest
//! store that the fixity pipeline reads the tag-manifest digest from.

use crate::{ArkError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub const TAG_MANIFEST_NAME: &str = "tagmanifest-sha256.txt";
pub const PAYLOAD_MANIFEST_NAME: &str = "manifest-sha256.txt";
pub const BAG_DECLARATION_NAME: &str = "bagit.txt";

/// Compute the hex SHA256 digest of a byte slice.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Per-file digest store plus structural errors for one validated bag.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub file_digests: HashMap<String, String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Digest of the bag's tag-manifest file, the value exchanged between
    /// nodes during replication.
    pub fn tag_manifest_digest(&self) -> Option<&str> {
        self.file_digests.get(TAG_MANIFEST_NAME).map(String::as_str)
    }
}

#[async_trait]
pub trait BagValidator: Send + Sync {
    async fn validate(&self, tar_path: &Path) -> Result<ValidationReport>;
}

#[async_trait]
pub trait BagPackager: Send + Sync {
    /// Packages `source_dir` into the network's bag layout at `dest_tar`.
    async fn package(&self, bag: Uuid, source_dir: &Path, dest_tar: &Path) -> Result<()>;
}

/// Validator over the standard `.tar` bag serialization.
pub struct TarBagValidator;

#[async_trait]
impl BagValidator for TarBagValidator {
    async fn validate(&self, tar_path: &Path) -> Result<ValidationReport> {
        let path = tar_path.to_path_buf();
        tokio::task::spawn_blocking(move || validate_tar(&path))
            .await
            .map_err(|error| ArkError::Internal(format!("validator task failed: {}", error)))?
    }
}

/// Reads just the tag-manifest digest out of a bag tar, used by the copy
/// stage to report the received digest back to the sender.
pub async fn tag_manifest_digest(tar_path: &Path) -> Result<String> {
    let path = tar_path.to_path_buf();
    let report = tokio::task::spawn_blocking(move || scan_tar(&path))
        .await
        .map_err(|error| ArkError::Internal(format!("digest task failed: {}", error)))??;

    report
        .digests
        .get(TAG_MANIFEST_NAME)
        .cloned()
        .ok_or_else(|| {
            ArkError::Validation(format!(
                "bag {} has no {}",
                tar_path.display(),
                TAG_MANIFEST_NAME
            ))
        })
}

struct TarScan {
    /// Digests keyed by entry path with the wrapper directory stripped.
    digests: HashMap<String, String>,
    payload_manifest: Option<String>,
}

fn scan_tar(tar_path: &Path) -> Result<TarScan> {
    let file = std::fs::File::open(tar_path)?;
    let mut archive = tar::Archive::new(file);

    let mut raw_digests: Vec<(String, String)> = Vec::new();
    let mut payload_manifest = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path()?.to_string_lossy().into_owned();
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut contents = Vec::new();
        let keep_contents = name.ends_with(PAYLOAD_MANIFEST_NAME);
        loop {
            let read = entry.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            if keep_contents {
                contents.extend_from_slice(&buffer[..read]);
            }
        }

        if keep_contents {
            payload_manifest = Some(String::from_utf8_lossy(&contents).into_owned());
        }
        raw_digests.push((name, hex::encode(hasher.finalize())));
    }

    // Bags are usually wrapped in a single top-level directory named after
    // the bag; strip it when every entry shares one.
    let wrapper = common_wrapper(raw_digests.iter().map(|(name, _)| name.as_str()));
    let digests = raw_digests
        .into_iter()
        .map(|(name, digest)| (strip_wrapper(&name, wrapper.as_deref()), digest))
        .collect();

    Ok(TarScan {
        digests,
        payload_manifest,
    })
}

fn common_wrapper<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut wrapper: Option<&str> = None;
    for name in names {
        let (first, rest) = name.split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        match wrapper {
            None => wrapper = Some(first),
            Some(existing) if existing == first => {}
            Some(_) => return None,
        }
    }
    wrapper.map(str::to_string)
}

fn strip_wrapper(name: &str, wrapper: Option<&str>) -> String {
    match wrapper {
        Some(prefix) => name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(name)
            .to_string(),
        None => name.to_string(),
    }
}

fn validate_tar(tar_path: &Path) -> Result<ValidationReport> {
    let scan = scan_tar(tar_path)?;
    let mut report = ValidationReport {
        file_digests: scan.digests,
        errors: Vec::new(),
    };

    if !report.file_digests.contains_key(BAG_DECLARATION_NAME) {
        report
            .errors
            .push(format!("missing {}", BAG_DECLARATION_NAME));
    }
    if !report.file_digests.contains_key(TAG_MANIFEST_NAME) {
        report.errors.push(format!("missing {}", TAG_MANIFEST_NAME));
    }
    if !report.file_digests.keys().any(|name| name.starts_with("data/")) {
        report.errors.push("bag has no payload files".to_string());
    }

    match scan.payload_manifest {
        None => report.errors.push(format!("missing {}", PAYLOAD_MANIFEST_NAME)),
        Some(manifest) => {
            for line in manifest.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((expected, path)) = line.split_once(char::is_whitespace) else {
                    report.errors.push(format!("malformed manifest line: {}", line));
                    continue;
                };
                let path = path.trim();
                match report.file_digests.get(path) {
                    None => report
                        .errors
                        .push(format!("file in manifest but not in bag: {}", path)),
                    Some(actual) if actual != expected.trim() => report
                        .errors
                        .push(format!("checksum mismatch for {}", path)),
                    Some(_) => {}
                }
            }
        }
    }

    Ok(report)
}

/// Packages a source directory into a wrapped `.tar` bag.
pub struct TarBagPackager;

#[async_trait]
impl BagPackager for TarBagPackager {
    async fn package(&self, bag: Uuid, source_dir: &Path, dest_tar: &Path) -> Result<()> {
        let source = source_dir.to_path_buf();
        let dest = dest_tar.to_path_buf();
        tokio::task::spawn_blocking(move || package_tar(bag, &source, &dest))
            .await
            .map_err(|error| ArkError::Internal(format!("packager task failed: {}", error)))?
    }
}

fn package_tar(bag: Uuid, source_dir: &Path, dest_tar: &Path) -> Result<()> {
    let files = collect_files(source_dir)?;
    if files.is_empty() {
        return Err(ArkError::Validation(format!(
            "source {} has no files to package",
            source_dir.display()
        )));
    }

    let file = std::fs::File::create(dest_tar)?;
    let mut builder = tar::Builder::new(file);
    let wrapper = bag.to_string();

    let mut payload_manifest = String::new();
    for relative in &files {
        let full = source_dir.join(relative);
        let data = std::fs::read(&full)?;
        let entry_path = format!("data/{}", path_to_unix(relative));
        payload_manifest.push_str(&format!("{}  {}\n", compute_hash(&data), entry_path));
        append_bytes(&mut builder, &format!("{}/{}", wrapper, entry_path), &data)?;
    }

    let declaration = "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";
    append_bytes(
        &mut builder,
        &format!("{}/{}", wrapper, BAG_DECLARATION_NAME),
        declaration.as_bytes(),
    )?;
    append_bytes(
        &mut builder,
        &format!("{}/{}", wrapper, PAYLOAD_MANIFEST_NAME),
        payload_manifest.as_bytes(),
    )?;

    let tag_manifest = format!(
        "{}  {}\n{}  {}\n",
        compute_hash(declaration.as_bytes()),
        BAG_DECLARATION_NAME,
        compute_hash(payload_manifest.as_bytes()),
        PAYLOAD_MANIFEST_NAME,
    );
    append_bytes(
        &mut builder,
        &format!("{}/{}", wrapper, TAG_MANIFEST_NAME),
        tag_manifest.as_bytes(),
    )?;

    builder.into_inner()?.sync_all()?;
    Ok(())
}

fn append_bytes(
    builder: &mut tar::Builder<std::fs::File>,
    path: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}

fn path_to_unix(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Provenance boundary on the source registry: ingest stamps the source
/// object with its new bag identifier and records events against it.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn record_event(&self, local_id: &str, event: &str) -> Result<()>;
    async fn stamp_bag_identifier(&self, local_id: &str, bag: Uuid) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCatalog {
    events: Mutex<Vec<(String, String)>>,
    stamps: Mutex<HashMap<String, Uuid>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, local_id: &str) -> Vec<String> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|(id, _)| id == local_id)
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stamped_bag(&self, local_id: &str) -> Option<Uuid> {
        self.stamps
            .lock()
            .ok()
            .and_then(|stamps| stamps.get(local_id).copied())
    }
}

#[async_trait]
impl SourceCatalog for MemoryCatalog {
    async fn record_event(&self, local_id: &str, event: &str) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| ArkError::Internal("catalog lock poisoned".to_string()))?
            .push((local_id.to_string(), event.to_string()));
        Ok(())
    }

    async fn stamp_bag_identifier(&self, local_id: &str, bag: Uuid) -> Result<()> {
        self.stamps
            .lock()
            .map_err(|_| ArkError::Internal("catalog lock poisoned".to_string()))?
            .insert(local_id.to_string(), bag);
        Ok(())
    }
}
