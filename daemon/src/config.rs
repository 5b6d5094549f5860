//! Configuration management (TOML)

use crate::db::StorageLimits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub sample_interval_ms: u64,
    pub flush_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub status_broadcast_secs: u64,
    /// Control socket; under the user's runtime directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Per-socket weights for apportioning interface traffic. These are policy
/// choices, not measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub established_weight: f64,
    pub other_tcp_weight: f64,
    pub udp_weight: f64,
    pub include_loopback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    pub record_ttl_hours: u64,
    pub large_batch_threshold: usize,
    pub max_database_bytes: u64,
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub expiry_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 500,
            flush_interval_secs: 10,
            inactivity_timeout_secs: 3,
            status_broadcast_secs: 1,
            socket_path: None,
        }
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            established_weight: 10.0,
            other_tcp_weight: 1.0,
            udp_weight: 0.5,
            include_loopback: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let limits = StorageLimits::default();
        Self {
            db_path: None,
            record_ttl_hours: 24,
            large_batch_threshold: limits.large_batch_threshold,
            max_database_bytes: limits.max_database_bytes,
            min_free_bytes: limits.min_free_bytes,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            expiry_interval_secs: 60,
            sweep_interval_secs: 30 * 60,
            maintenance_interval_secs: 24 * 60 * 60,
        }
    }
}

impl GeneralConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl StorageConfig {
    pub fn limits(&self) -> StorageLimits {
        StorageLimits {
            large_batch_threshold: self.large_batch_threshold,
            max_database_bytes: self.max_database_bytes,
            min_free_bytes: self.min_free_bytes,
        }
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_hours * 60 * 60)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "netusage")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}
