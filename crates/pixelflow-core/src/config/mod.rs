//! Configuration management for pixelflow.
//!
//! Configuration is loaded from the platform config directory with sensible
//! defaults. Values that can change at runtime (publication rate, thumbnail
//! size) only provide the initial value here; afterwards they are read
//! through [`crate::dynamic::DynamicCell`]s fed by the config store.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for pixelflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// File walker settings
    pub loader: LoaderConfig,

    /// Consumer pool settings
    pub workers: WorkerConfig,

    /// Thumbnail generation settings
    pub thumbnail: ThumbnailConfig,

    /// Analysis image settings
    pub analysis: AnalysisConfig,

    /// Resource limits
    pub limits: LimitsConfig,

    /// Queue/exchange naming
    pub topology: TopologyConfig,

    /// Blob storage locations
    pub storage: StorageConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.pixelflow.pixelflow/config.toml
    /// - Linux: ~/.config/pixelflow/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\pixelflow\config\config.toml
    ///
    /// Falls back to ~/.pixelflow/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "pixelflow", "pixelflow")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".pixelflow").join("config.toml")
            })
    }

    /// Anchor roots with `~` expanded.
    pub fn anchor_roots(&self) -> std::collections::BTreeMap<String, PathBuf> {
        self.loader
            .anchors
            .iter()
            .map(|(name, root)| (name.clone(), expand(root)))
            .collect()
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Expand a leading `~` in a path.
pub fn expand(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&path_str).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.thumbnail.size, 256);
        assert_eq!(config.loader.hash_algorithms, vec!["SHA-256"]);
        assert_eq!(config.workers.prefetch, 4);
        assert_eq!(config.general.environment, Environment::Production);
    }

    #[test]
    fn test_config_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[loader]"));
        assert!(toml.contains("[topology.names]"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [general]
            environment = "isolated"
            codec = "legacy"

            [loader]
            hash_algorithms = ["sha-256", "SHA-512"]

            [loader.anchors]
            photos = "/srv/photos"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.environment, Environment::Isolated);
        assert_eq!(config.general.codec, crate::codec::Generation::Legacy);
        assert_eq!(config.loader.hash_algorithms, vec!["SHA-256", "SHA-512"]);
        assert_eq!(config.thumbnail.size, 256);
        assert_eq!(
            config.anchor_roots()["photos"],
            PathBuf::from("/srv/photos")
        );
    }

    #[test]
    fn test_pool_size_auto() {
        let workers = WorkerConfig::default();
        assert!(workers.pool_size() >= 1);
        let fixed = WorkerConfig {
            count: 3,
            prefetch: 1,
        };
        assert_eq!(fixed.pool_size(), 3);
    }
}
