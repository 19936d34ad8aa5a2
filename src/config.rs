//! Engine configuration
//!
//! All fields have defaults, so a config file only needs the values it changes:
//!
//! ```json
//! { "multiStrategy": true, "conflictPolicy": "average", "maxQueueSize": 8 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::{CacheKeyMode, DedupKeyMode};
use crate::error::{ChromaError, Result};
use crate::merge::ConflictPolicy;
use crate::selector::MAX_PARALLEL_STRATEGIES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub cache_ttl_ms: u64,
    pub cache_key: CacheKeyMode,
    /// Sweep is considered once the cache grows past this many entries
    pub cache_soft_cap: usize,
    /// Writes between sweeps while over the soft cap
    pub cache_sweep_every: usize,
    pub dedup_ttl_ms: u64,
    pub dedup_key: DedupKeyMode,
    pub max_queue_size: usize,
    pub processing_timeout_ms: u64,
    pub multi_strategy: bool,
    pub max_parallel_strategies: usize,
    pub conflict_policy: ConflictPolicy,
    pub perceptual_enabled: bool,
    /// Subscriber name used on the event bus
    pub subscriber_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            cache_key: CacheKeyMode::Content,
            cache_soft_cap: 50,
            cache_sweep_every: 10,
            dedup_ttl_ms: 2_000,
            dedup_key: DedupKeyMode::Track,
            max_queue_size: 5,
            processing_timeout_ms: 10_000,
            multi_strategy: false,
            max_parallel_strategies: MAX_PARALLEL_STRATEGIES,
            conflict_policy: ConflictPolicy::Merge,
            perceptual_enabled: true,
            subscriber_name: "soma_chroma".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(ChromaError::Config("maxQueueSize must be at least 1".to_string()));
        }
        if self.processing_timeout_ms == 0 {
            return Err(ChromaError::Config("processingTimeoutMs must be positive".to_string()));
        }
        if self.max_parallel_strategies == 0 || self.max_parallel_strategies > MAX_PARALLEL_STRATEGIES {
            return Err(ChromaError::Config(format!(
                "maxParallelStrategies must be between 1 and {}",
                MAX_PARALLEL_STRATEGIES
            )));
        }
        if self.subscriber_name.trim().is_empty() {
            return Err(ChromaError::Config("subscriberName must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// How many strategies one cycle asks the selector for
    pub fn strategy_limit(&self) -> usize {
        if self.multi_strategy {
            self.max_parallel_strategies.min(MAX_PARALLEL_STRATEGIES)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.dedup_ttl(), Duration::from_secs(2));
        assert_eq!(config.processing_timeout(), Duration::from_secs(10));
        assert_eq!(config.strategy_limit(), 1);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "multiStrategy": true, "conflictPolicy": "average", "dedupKey": "content", "cacheKey": "roles" }}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.multi_strategy);
        assert_eq!(config.conflict_policy, ConflictPolicy::Average);
        assert_eq!(config.dedup_key, DedupKeyMode::Content);
        assert_eq!(config.cache_key, CacheKeyMode::Roles);
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.strategy_limit(), 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig {
            max_parallel_strategies: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ChromaError::Config(_))));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "maxQueueSize": 0 }}"#).unwrap();
        assert!(EngineConfig::from_file(file.path()).is_err());
    }
}
