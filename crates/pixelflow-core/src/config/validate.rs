//! Configuration validation with range checks.
//!
//! Algorithm names are canonicalized in place so later comparisons against
//! `ImageRecord::hashes` keys are exact.

use crate::algorithm::{Algorithm, AlgorithmKind};
use crate::error::ConfigError;
use crate::topology::names;

use super::Config;

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.loader.supported_formats.is_empty() {
            return Err(ConfigError::ValidationError(
                "loader.supported_formats must not be empty".into(),
            ));
        }
        self.loader.hash_algorithms =
            canonical(&self.loader.hash_algorithms, AlgorithmKind::Digest, "loader.hash_algorithms")?;
        self.loader.custom_hash_algorithms = canonical(
            &self.loader.custom_hash_algorithms,
            AlgorithmKind::Perceptual,
            "loader.custom_hash_algorithms",
        )?;
        if !(self.loader.rate_limit.is_finite() && self.loader.rate_limit > 0.0) {
            return Err(ConfigError::ValidationError(
                "loader.rate_limit must be > 0".into(),
            ));
        }
        if self.loader.walk_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "loader.walk_buffer must be > 0".into(),
            ));
        }
        if self.workers.prefetch == 0 {
            return Err(ConfigError::ValidationError(
                "workers.prefetch must be > 0".into(),
            ));
        }
        if self.thumbnail.size == 0 {
            return Err(ConfigError::ValidationError(
                "thumbnail.size must be > 0".into(),
            ));
        }
        if self.thumbnail.quality == 0 || self.thumbnail.quality > 100 {
            return Err(ConfigError::ValidationError(
                "thumbnail.quality must be between 1 and 100".into(),
            ));
        }
        if self.analysis.size < 32 {
            return Err(ConfigError::ValidationError(
                "analysis.size must be >= 32".into(),
            ));
        }
        if self.limits.max_file_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_file_size_mb must be > 0".into(),
            ));
        }
        if self.limits.max_image_dimension == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_image_dimension must be > 0".into(),
            ));
        }
        if self.limits.decode_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "limits.decode_timeout_ms must be > 0".into(),
            ));
        }
        for (logical, physical) in &self.topology.names {
            if !names::ALL.contains(&logical.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "topology.names.{logical} is not a known queue or exchange"
                )));
            }
            if physical.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "topology.names.{logical} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

fn canonical(
    values: &[String],
    kind: AlgorithmKind,
    field: &str,
) -> Result<Vec<String>, ConfigError> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let alg = Algorithm::from_name(value).ok_or_else(|| {
            ConfigError::ValidationError(format!("{field}: unknown algorithm {value}"))
        })?;
        if alg.kind() != kind {
            return Err(ConfigError::ValidationError(format!(
                "{field}: {alg} is not a {kind:?} algorithm"
            )));
        }
        if !out.iter().any(|name| name == alg.name()) {
            out.push(alg.name().to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_thumbnail_size() {
        let mut config = Config::default();
        config.thumbnail.size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("thumbnail.size"));
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = Config::default();
        config.loader.rate_limit = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit"));
    }

    #[test]
    fn test_validate_rejects_unknown_algorithm() {
        let mut config = Config::default();
        config.loader.hash_algorithms = vec!["MD5".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MD5"));
    }

    #[test]
    fn test_validate_rejects_algorithm_of_wrong_kind() {
        let mut config = Config::default();
        config.loader.hash_algorithms = vec!["phash".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_canonicalizes_and_dedups() {
        let mut config = Config::default();
        config.loader.hash_algorithms = vec![
            "sha-256".to_string(),
            "SHA-256".to_string(),
            "blake3".to_string(),
        ];
        config.validate().unwrap();
        assert_eq!(config.loader.hash_algorithms, vec!["SHA-256", "BLAKE3"]);
    }

    #[test]
    fn test_validate_rejects_unknown_topology_name() {
        let mut config = Config::default();
        config
            .topology
            .names
            .insert("mystery".to_string(), "mystery".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }
}
