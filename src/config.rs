use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Error;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StrongroomConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub rerank: RerankConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

/// Where row visibility is enforced.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Predicates live in the store (views and triggers keyed on the session context).
    RowPolicy,
    /// Predicates are bound into every statement by application code.
    ApplicationFilter,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RowPolicy => "row_policy",
            Self::ApplicationFilter => "application_filter",
        }
    }
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "row_policy" => Ok(Self::RowPolicy),
            "application_filter" => Ok(Self::ApplicationFilter),
            _ => Err(format!("unknown isolation mode: {s}")),
        }
    }
}

/// Database role a connection runs as.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessRole {
    /// Subject to every row policy. The only role allowed to serve tenant traffic.
    Application,
    /// Bypasses row policies. Used for cross-tenant sweeps and diagnostics.
    Maintenance,
}

impl AccessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn bypasses_row_policies(&self) -> bool {
        matches!(self, Self::Maintenance)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub partitions: u32,
    pub isolation: IsolationMode,
    pub role: AccessRole,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

/// Key material, base64 encoded. Normally supplied through the environment.
#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct CryptoConfig {
    pub encryption_key: String,
    pub tenant_secret: String,
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("encryption_key", &redacted(&self.encryption_key))
            .field("tenant_secret", &redacted(&self.tenant_secret))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "(unset)"
    } else {
        "(redacted)"
    }
}

/// HNSW construction and search parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub dimensions: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_layer: usize,
    pub max_elements: usize,
    /// Candidates fetched per requested result before tenant post-filtering.
    pub oversample: usize,
    pub max_k: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub candidate_limit: usize,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_strongroom_dir()
            .join("vault.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            partitions: 4,
            isolation: IsolationMode::RowPolicy,
            role: AccessRole::Application,
            pool_size: 8,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: 384,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_layer: 16,
            max_elements: 100_000,
            oversample: 4,
            max_k: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 24 * 60 * 60,
            max_entries: 10_000,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        let cache_dir = default_strongroom_dir()
            .join("models")
            .join("cross-encoder")
            .to_string_lossy()
            .into_owned();
        Self {
            enabled: true,
            timeout_ms: 250,
            candidate_limit: 20,
            failure_threshold: 3,
            cooldown_ms: 30_000,
            model: "ms-marco-MiniLM-L-6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_strongroom_dir()
            .join("models")
            .join("embedding")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

/// Returns `~/.strongroom/`
pub fn default_strongroom_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".strongroom")
}

/// Returns the default config file path: `~/.strongroom/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strongroom_dir().join("config.toml")
}

impl StrongroomConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrongroomConfig::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides. Keys are normally only ever
    /// supplied this way so they stay out of config files.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("STRONGROOM_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("STRONGROOM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("STRONGROOM_ISOLATION") {
            self.storage.isolation = val.parse().map_err(anyhow::Error::msg)?;
        }
        if let Ok(val) = std::env::var("STRONGROOM_ENCRYPTION_KEY") {
            self.crypto.encryption_key = val;
        }
        if let Ok(val) = std::env::var("STRONGROOM_TENANT_SECRET") {
            self.crypto.tenant_secret = val;
        }
        if let Ok(val) = std::env::var("STRONGROOM_RERANK") {
            self.rerank.enabled = matches!(val.as_str(), "1" | "true" | "on");
        }
        Ok(())
    }

    /// Reject configurations the store cannot run safely with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.storage.partitions == 0 {
            return Err(Error::Config("storage.partitions must be at least 1".into()));
        }
        if self.storage.pool_size == 0 {
            return Err(Error::Config("storage.pool_size must be at least 1".into()));
        }
        if self.index.dimensions == 0 {
            return Err(Error::Config("index.dimensions must be at least 1".into()));
        }
        if self.index.m < 2 || self.index.ef_construction < self.index.m {
            return Err(Error::Config(
                "index.m must be >= 2 and index.ef_construction >= index.m".into(),
            ));
        }
        if self.index.max_layer == 0 || self.index.max_layer > 16 {
            return Err(Error::Config("index.max_layer must be within 1..=16".into()));
        }
        if self.index.max_k == 0 || self.index.oversample == 0 {
            return Err(Error::Config(
                "index.max_k and index.oversample must be at least 1".into(),
            ));
        }
        if self.rerank.enabled && self.rerank.timeout_ms == 0 {
            return Err(Error::Config("rerank.timeout_ms must be positive".into()));
        }
        if self.crypto.encryption_key.is_empty() || self.crypto.tenant_secret.is_empty() {
            return Err(Error::Config(
                "crypto.encryption_key and crypto.tenant_secret must be set \
                 (STRONGROOM_ENCRYPTION_KEY / STRONGROOM_TENANT_SECRET)"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
