use arkio_core::operations::PipelineSettings;
use arkio_core::{ArkError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub staging: StagingConfig,
    pub cold: ColdConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub audit: AuditConfig,
    #[serde(default)]
    pub copier: CopierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's namespace, e.g. `chron`.
    pub namespace: String,
    /// Member that owns content ingested by this node.
    pub member: uuid::Uuid,
    /// Directory of source objects awaiting ingest, one subdirectory per
    /// local id.
    pub source_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub api_root: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Http,
    Memory,
}

impl RegistryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryBackend::Http => "http",
            RegistryBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub namespace: String,
    pub api_root: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub path: PathBuf,
    #[serde(default = "default_staging_capacity")]
    pub capacity_bytes: u64,
}

fn default_staging_capacity() -> u64 {
    500 * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdConfig {
    pub backend: ColdBackend,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub fs: Option<FsColdConfig>,
    /// How long a cold-storage recall is expected to take.
    #[serde(default = "default_restore_lead_hours")]
    pub restore_lead_hours: i64,
}

fn default_restore_lead_hours() -> i64 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColdBackend {
    S3,
    Fs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsColdConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_workers_per_stage")]
    pub workers_per_stage: usize,
    #[serde(default = "default_store_attempts")]
    pub max_store_attempts: u32,
    #[serde(default = "default_store_attempts")]
    pub max_retrieve_attempts: u32,
    #[serde(default = "default_requeue_delay_secs")]
    pub requeue_delay_secs: u64,
    #[serde(default = "default_restore_poll_secs")]
    pub restore_poll_secs: u64,
    #[serde(default = "default_visibility_extension_secs")]
    pub visibility_extension_secs: u64,
    #[serde(default = "default_claim_staleness_secs")]
    pub claim_staleness_secs: i64,
    #[serde(default = "default_replication_count")]
    pub replication_count: usize,
    #[serde(default = "default_fixity_algorithm")]
    pub fixity_algorithm: String,
    /// How often the sender-side fixity sweep runs.
    #[serde(default = "default_confirm_interval_secs")]
    pub confirm_interval_secs: u64,
    /// How often the source root is scanned for new objects to ingest.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_workers_per_stage() -> usize {
    2
}

fn default_store_attempts() -> u32 {
    3
}

fn default_requeue_delay_secs() -> u64 {
    5 * 60
}

fn default_restore_poll_secs() -> u64 {
    30 * 60
}

fn default_visibility_extension_secs() -> u64 {
    60 * 60
}

fn default_claim_staleness_secs() -> i64 {
    2 * 60 * 60
}

fn default_replication_count() -> usize {
    2
}

fn default_fixity_algorithm() -> String {
    "sha256".to_string()
}

fn default_confirm_interval_secs() -> u64 {
    5 * 60
}

fn default_scan_interval_secs() -> u64 {
    5 * 60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers_per_stage: default_workers_per_stage(),
            max_store_attempts: default_store_attempts(),
            max_retrieve_attempts: default_store_attempts(),
            requeue_delay_secs: default_requeue_delay_secs(),
            restore_poll_secs: default_restore_poll_secs(),
            visibility_extension_secs: default_visibility_extension_secs(),
            claim_staleness_secs: default_claim_staleness_secs(),
            replication_count: default_replication_count(),
            fixity_algorithm: default_fixity_algorithm(),
            confirm_interval_secs: default_confirm_interval_secs(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers_per_stage: self.workers_per_stage,
            max_store_attempts: self.max_store_attempts,
            max_retrieve_attempts: self.max_retrieve_attempts,
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
            restore_poll_delay: Duration::from_secs(self.restore_poll_secs),
            visibility_extension: Duration::from_secs(self.visibility_extension_secs),
            claim_staleness: chrono::Duration::seconds(self.claim_staleness_secs),
            replication_count: self.replication_count,
            fixity_algorithm: self.fixity_algorithm.clone(),
            ..PipelineSettings::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sync_page_size")]
    pub page_size: usize,
}

fn default_sync_interval_secs() -> u64 {
    60 * 60
}

fn default_sync_page_size() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            page_size: default_sync_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierConfig {
    #[serde(default)]
    pub backend: CopierBackend,
    /// Extra arguments passed to rsync, e.g. an ssh identity file.
    #[serde(default)]
    pub rsync_args: Vec<String>,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            backend: CopierBackend::Rsync,
            rsync_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopierBackend {
    #[default]
    Rsync,
    Local,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                // Nested fields map as ARKIO__NODE__NAMESPACE and so on.
                ::config::Environment::with_prefix("ARKIO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ArkError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ArkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node.namespace.trim().is_empty() {
            return Err(ArkError::Config("node.namespace cannot be empty".to_string()));
        }
        match self.cold.backend {
            ColdBackend::S3 if self.cold.s3.is_none() => Err(ArkError::Config(
                "cold.s3 configuration is required for the s3 backend".to_string(),
            )),
            ColdBackend::Fs if self.cold.fs.is_none() => Err(ArkError::Config(
                "cold.fs configuration is required for the fs backend".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arkio.yaml");
        std::fs::write(
            &path,
            r#"
node:
  namespace: chron
  member: 1f6f2f2e-8c59-4a6b-9d2e-0a4c9d1e2f3a
  source_root: /var/arkio/source
registry:
  backend: memory
staging:
  path: /var/arkio/staging
cold:
  backend: fs
  fs:
    path: /var/arkio/cold
audit:
  path: /var/arkio/audit.jsonl
"#,
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.node.namespace, "chron");
        assert_eq!(config.pipeline.replication_count, 2);
        assert_eq!(config.sync.interval_secs, 3600);
        assert_eq!(config.pipeline.settings().fixity_algorithm, "sha256");
    }

    #[test]
    fn test_environment_overrides_nested_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arkio.yaml");
        std::fs::write(
            &path,
            r#"
node:
  namespace: chron
  member: 1f6f2f2e-8c59-4a6b-9d2e-0a4c9d1e2f3a
  source_root: /var/arkio/source
registry:
  backend: memory
staging:
  path: /var/arkio/staging
cold:
  backend: fs
  fs:
    path: /var/arkio/cold
audit:
  path: /var/arkio/audit.jsonl
"#,
        )
        .unwrap();

        // Overrides a field no other test asserts on; tests share the
        // process environment.
        unsafe { std::env::set_var("ARKIO__NODE__SOURCE_ROOT", "/srv/arkio/incoming") };
        let config = Config::from_file(path.to_str().unwrap());
        unsafe { std::env::remove_var("ARKIO__NODE__SOURCE_ROOT") };

        assert_eq!(
            config.unwrap().node.source_root,
            PathBuf::from("/srv/arkio/incoming")
        );
    }

    #[test]
    fn test_s3_backend_requires_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arkio.yaml");
        std::fs::write(
            &path,
            r#"
node:
  namespace: chron
  member: 1f6f2f2e-8c59-4a6b-9d2e-0a4c9d1e2f3a
  source_root: /var/arkio/source
registry:
  backend: memory
staging:
  path: /var/arkio/staging
cold:
  backend: s3
audit:
  path: /var/arkio/audit.jsonl
"#,
        )
        .unwrap();

        let error = Config::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(error, ArkError::Config(_)));
    }
}
