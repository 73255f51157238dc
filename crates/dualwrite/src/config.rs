//! Static storage configuration: resource -> dual writer mode, loaded once at startup.

use std::collections::BTreeMap;
use std::path::Path;

use duet_core::DualWriterMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parsing storage config: {0}")]
    Parse(String),
    #[error("resource {0} is served but has no dual writer mode configured")]
    MissingResource(String),
    #[error("resource {0} is configured but not served")]
    UnknownResource(String),
    #[error("invalid storage config: {0}")]
    Invalid(String),
}

fn default_shadow_timeout_ms() -> u64 { 5_000 }
fn default_reconcile_capacity() -> usize { 4_096 }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceConfig {
    pub mode: DualWriterMode,
    /// Reject stale resourceVersions even where unified is authoritative.
    #[serde(default)]
    pub strict_conflicts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageConfig {
    /// Keyed by `resource.group`, e.g. `shorturls.shorturl.grafana.app`.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
    /// Upper bound for a single shadow write.
    #[serde(default = "default_shadow_timeout_ms")]
    pub shadow_timeout_ms: u64,
    /// Pending reconciliation items kept before the oldest is dropped.
    #[serde(default = "default_reconcile_capacity")]
    pub reconcile_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resources: BTreeMap::new(),
            shadow_timeout_ms: default_shadow_timeout_ms(),
            reconcile_capacity: default_reconcile_capacity(),
        }
    }
}

impl StorageConfig {
    pub fn with_mode(mut self, resource: &str, mode: DualWriterMode) -> Self {
        self.resources.insert(resource.to_string(), ResourceConfig { mode, strict_conflicts: false });
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a `.json` or YAML file, then apply `DUET_SHADOW_TIMEOUT_MS` if set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let mut cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            _ => Self::from_yaml_str(&text)?,
        };
        if let Some(ms) = std::env::var("DUET_SHADOW_TIMEOUT_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.shadow_timeout_ms = ms;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from the file named by `DUET_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("DUET_CONFIG").map_err(|_| ConfigError::Invalid("DUET_CONFIG is not set".into()))?;
        Self::load(Path::new(&path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = self.resources.keys().find(|k| k.trim().is_empty() || k.contains('/')) {
            return Err(ConfigError::Invalid(format!("resource key {:?} must be of the form resource.group", key)));
        }
        if self.shadow_timeout_ms == 0 {
            return Err(ConfigError::Invalid("shadowTimeoutMs must be greater than zero".into()));
        }
        if self.reconcile_capacity == 0 {
            return Err(ConfigError::Invalid("reconcileCapacity must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn resource(&self, key: &str) -> Option<&ResourceConfig> { self.resources.get(key) }
}
