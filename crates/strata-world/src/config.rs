//! Persistence configuration.
//!
//! Controls where worlds are stored and how long region file handles stay
//! open. Loaded from and saved to a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{PersistenceError, PersistenceResult};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "strata.toml";

/// Persistence configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Root directory; each world lives in `save_dir/<world>/region`
    pub save_dir: PathBuf,
    /// Region files untouched for this long are flushed and closed
    pub region_idle_timeout_ms: u64,
    /// Period of the idle-timeout thread
    pub timeout_check_interval_ms: u64,
    /// Maximum cached region handles per world
    pub max_open_regions: usize,
    /// LZ4-compress chunk bodies
    pub compress_chunks: bool,
    /// Name given to the persistence worker thread
    pub worker_thread_name: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("saves"),
            region_idle_timeout_ms: 30_000,
            timeout_check_interval_ms: 1_000,
            max_open_regions: 32,
            compress_chunks: true,
            worker_thread_name: "world-saving".to_string(),
        }
    }
}

impl PersistenceConfig {
    /// Creates a default config rooted at `save_dir`.
    #[must_use]
    pub fn with_save_dir<P: AsRef<Path>>(save_dir: P) -> Self {
        Self {
            save_dir: save_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load configuration from a specific path.
    /// Returns default config if the file doesn't exist or is invalid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        match Self::load_from(path) {
            Ok(mut config) => {
                config.validate();
                info!("Loaded persistence config from {}", path.display());
                config
            },
            Err(e) => {
                warn!("Failed to load config file: {e}");
                Self::default()
            },
        }
    }

    /// Load configuration, surfacing read and parse failures.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PersistenceResult<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| PersistenceError::Config(e.to_string()))
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> PersistenceResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents =
            toml::to_string_pretty(self).map_err(|e| PersistenceError::Config(e.to_string()))?;
        fs::write(path, contents)?;

        info!("Saved persistence config to {}", path.display());
        Ok(())
    }

    /// Clamp values to usable ranges.
    pub fn validate(&mut self) {
        self.timeout_check_interval_ms = self.timeout_check_interval_ms.clamp(10, 60_000);
        self.region_idle_timeout_ms = self
            .region_idle_timeout_ms
            .max(self.timeout_check_interval_ms);
        self.max_open_regions = self.max_open_regions.clamp(1, 1024);
        if self.worker_thread_name.trim().is_empty() {
            self.worker_thread_name = Self::default().worker_thread_name;
        }
    }

    /// Region directory for a world.
    #[must_use]
    pub fn region_dir(&self, world_name: &str) -> PathBuf {
        self.save_dir.join(world_name).join("region")
    }

    /// Idle timeout as a duration.
    #[must_use]
    pub fn region_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.region_idle_timeout_ms)
    }

    /// Timeout check period as a duration.
    #[must_use]
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PersistenceConfig::default();
        assert_eq!(config.save_dir, PathBuf::from("saves"));
        assert_eq!(config.max_open_regions, 32);
        assert!(config.compress_chunks);
        assert_eq!(config.worker_thread_name, "world-saving");
    }

    #[test]
    fn test_config_validation() {
        let mut config = PersistenceConfig {
            timeout_check_interval_ms: 0,
            region_idle_timeout_ms: 0,
            max_open_regions: 0,
            worker_thread_name: "  ".to_string(),
            ..PersistenceConfig::default()
        };

        config.validate();

        assert_eq!(config.timeout_check_interval_ms, 10);
        assert_eq!(config.region_idle_timeout_ms, 10);
        assert_eq!(config.max_open_regions, 1);
        assert_eq!(config.worker_thread_name, "world-saving");
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let mut config = PersistenceConfig::with_save_dir(temp_dir.path().join("worlds"));
        config.compress_chunks = false;
        config.max_open_regions = 4;

        config.save_to(&config_path).expect("Failed to save config");

        let loaded = PersistenceConfig::load_or_default(&config_path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = PersistenceConfig::load_or_default("/nonexistent/path/strata.toml");
        assert_eq!(config, PersistenceConfig::default());
    }

    #[test]
    fn test_config_load_invalid_file_falls_back() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "max_open_regions = \"lots\"").expect("write");

        assert!(PersistenceConfig::load_from(&config_path).is_err());
        assert_eq!(
            PersistenceConfig::load_or_default(&config_path),
            PersistenceConfig::default()
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PersistenceConfig =
            toml::from_str("compress_chunks = false").expect("parse partial config");
        assert!(!config.compress_chunks);
        assert_eq!(config.max_open_regions, 32);
    }

    #[test]
    fn test_region_dir_layout() {
        let config = PersistenceConfig::with_save_dir("/tmp/worlds");
        assert_eq!(
            config.region_dir("overworld"),
            PathBuf::from("/tmp/worlds/overworld/region")
        );
    }
}
