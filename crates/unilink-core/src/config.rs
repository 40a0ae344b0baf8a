use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine tuning. Every field has a default, so an empty TOML document is a
/// valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub resolver: ResolverConfig,
    pub index: IndexConfig,
    pub reconcile: ReconcileConfig,
    pub links: LinkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Items resolved per batch.
    pub batch_size: usize,
    /// Pause after each batch.
    pub batch_delay_ms: u64,
    /// Retries after the first failed search; attempts = max_retries + 1.
    pub max_retries: u32,
    /// Backoff before retry `i` is `retry_delay_base_ms * 2^i`.
    pub retry_delay_base_ms: u64,
    /// Lifetime of a cached key; 0 keeps entries until reset.
    pub cache_ttl_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_ms: 50,
            max_retries: 2,
            retry_delay_base_ms: 100,
            cache_ttl_ms: 30_000,
        }
    }
}

impl ResolverConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.retry_delay_base_ms.saturating_mul(factor))
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Rebuild requests closer together than this are skipped.
    pub min_rebuild_interval_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            min_rebuild_interval_ms: 500,
        }
    }
}

impl IndexConfig {
    pub fn min_rebuild_interval(&self) -> Duration {
        Duration::from_millis(self.min_rebuild_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Window for collecting cross-tab notifications before applying them.
    pub debounce_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { debounce_ms: 100 }
    }
}

impl ReconcileConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub page_href_prefix: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            page_href_prefix: "/pages/".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn href_for(&self, page_id: &str) -> String {
        format!("{}{}", self.page_href_prefix, page_id)
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            origin: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolver.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "resolver.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.resolver.max_retries > 16 {
            return Err(ConfigError::Invalid {
                field: "resolver.max_retries",
                reason: format!("{} exceeds the limit of 16", self.resolver.max_retries),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_resolver_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.resolver.batch_size, 10);
        assert_eq!(config.resolver.batch_delay(), Duration::from_millis(50));
        assert_eq!(config.resolver.max_retries, 2);
        assert_eq!(config.links.href_for("p1"), "/pages/p1");
    }

    #[test]
    fn retry_delay_doubles() {
        let config = ResolverConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let config = ResolverConfig {
            cache_ttl_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.cache_ttl(), None);
    }

    #[test]
    fn empty_toml_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
[resolver]
batch_size = 3

[links]
page_href_prefix = "/notes/"
"#,
        )
        .unwrap();
        assert_eq!(config.resolver.batch_size, 3);
        assert_eq!(config.resolver.batch_delay_ms, 50);
        assert_eq!(config.links.href_for("x"), "/notes/x");
        assert_eq!(config.index, IndexConfig::default());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = EngineConfig::from_toml_str("[resolver]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "resolver.batch_size", .. }));
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unilink.toml");
        std::fs::write(&path, "[resolver\n").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("unilink.toml"), "got: {}", err);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let err = EngineConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut config = EngineConfig::default();
        config.reconcile.debounce_ms = 7;
        let text = toml::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
