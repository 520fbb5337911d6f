//! Broker configuration.
//!
//! Loaded from a JSON file; a default configuration (a single libsql
//! backend, no extra pools) is written to disk on first run if the file is
//! absent, mirroring the load-or-initialize pattern used throughout the
//! teacher's services.

use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use queue_core::backoff::BackoffConfig;
use queue_core::validation::Limits;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Socket address the HTTP listener binds to, e.g. `"0.0.0.0:8080"`.
    pub listen_address: String,
    /// Backend holding the catalogue and pool registry. Also serves as the
    /// implicit "default" pool's shard when `pools` is empty.
    pub control_backend: BackendConfig,
    /// Additional pools a queue may be placed on. The control backend
    /// itself is always registered as a pool named `"default"` with
    /// `default_pool_weight`, so a deployment with no extra pools behaves
    /// as a single-backend broker without special-casing the router.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default = "default_pool_weight")]
    pub default_pool_weight: u32,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub backoff: BackoffConfigFile,
    pub log_file: Utf8PathBuf,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_pool_weight() -> u32 {
    1
}

fn default_log_filter() -> String {
    "info".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", tag = "Kind")]
pub enum BackendConfig {
    Libsql { path: Utf8PathBuf },
    Postgres { dsn: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolConfig {
    pub id: String,
    #[serde(default = "default_pool_weight")]
    pub weight: u32,
    #[serde(default)]
    pub group: Option<String>,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LimitsConfig {
    pub max_message_size: usize,
    pub max_messages_per_page: usize,
    pub max_project_id_length: usize,
    pub message_ttl_min: i64,
    pub message_ttl_max: i64,
    pub claim_ttl_min: i64,
    pub claim_ttl_max: i64,
    pub claim_grace_min: i64,
    pub claim_grace_max: i64,
    pub max_bulk_get_ids: usize,
    pub max_bulk_delete_ids: usize,
    pub min_list_limit: usize,
    pub max_list_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let defaults = Limits::default();
        Self {
            max_message_size: defaults.max_message_size,
            max_messages_per_page: defaults.max_messages_per_page,
            max_project_id_length: defaults.max_project_id_length,
            message_ttl_min: *defaults.message_ttl.start(),
            message_ttl_max: *defaults.message_ttl.end(),
            claim_ttl_min: *defaults.claim_ttl.start(),
            claim_ttl_max: *defaults.claim_ttl.end(),
            claim_grace_min: *defaults.claim_grace.start(),
            claim_grace_max: *defaults.claim_grace.end(),
            max_bulk_get_ids: defaults.max_bulk_get_ids,
            max_bulk_delete_ids: defaults.max_bulk_delete_ids,
            min_list_limit: defaults.min_list_limit,
            max_list_limit: defaults.max_list_limit,
        }
    }
}

impl From<LimitsConfig> for Limits {
    fn from(c: LimitsConfig) -> Self {
        Self {
            max_message_size: c.max_message_size,
            max_messages_per_page: c.max_messages_per_page,
            max_project_id_length: c.max_project_id_length,
            message_ttl: c.message_ttl_min..=c.message_ttl_max,
            claim_ttl: c.claim_ttl_min..=c.claim_ttl_max,
            claim_grace: c.claim_grace_min..=c.claim_grace_max,
            max_bulk_get_ids: c.max_bulk_get_ids,
            max_bulk_delete_ids: c.max_bulk_delete_ids,
            min_list_limit: c.min_list_limit,
            max_list_limit: c.max_list_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackoffConfigFile {
    pub max_attempts: u32,
    pub base_interval_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffConfigFile {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_interval_ms: 50,
            jitter: 0.25,
        }
    }
}

impl From<BackoffConfigFile> for BackoffConfig {
    fn from(c: BackoffConfigFile) -> Self {
        Self {
            max_attempts: c.max_attempts,
            base_interval: Duration::from_millis(c.base_interval_ms),
            jitter: c.jitter,
        }
    }
}

impl Config {
    pub fn standard(log_file: Utf8PathBuf) -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_owned(),
            control_backend: BackendConfig::Libsql {
                path: "broker.sqlite".into(),
            },
            pools: Vec::new(),
            default_pool_weight: default_pool_weight(),
            limits: LimitsConfig::default(),
            backoff: BackoffConfigFile::default(),
            log_file,
            log_filter: default_log_filter(),
        }
    }

    /// Load the config file at `path`, writing a default one first if it is
    /// absent.
    pub fn load_from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = serde_json::from_str(&contents)?;
                Ok(config)
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let parent = path.parent().unwrap_or(Utf8Path::new("."));
                let log_file = parent.join("broker.log");
                let config = Self::standard(log_file);
                fs::write(path, serde_json::to_string_pretty(&config)?)?;
                Ok(config)
            }
            Err(error) => Err(ConfigError::Io(error)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write the config file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed config file: {0}")]
    Json(#[from] serde_json::Error),
}
