//! Manager configuration

use crate::{
    LoaderConfig, NetworkPolicy, PreloadError, Result, RouteConfig, SchedulerConfig, ToolId,
    UsageConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Weights and slot counts for usage-driven scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicPriorityConfig {
    /// Weight of a tool's usage count
    #[serde(default = "default_usage_weight")]
    pub usage_weight: f64,
    /// Weight of the edge from the last used tool
    #[serde(default = "default_association_weight")]
    pub association_weight: f64,
    /// Top-ranked tools given high priority
    #[serde(default = "default_high_slots")]
    pub high_slots: usize,
    /// Following tools given medium priority
    #[serde(default = "default_medium_slots")]
    pub medium_slots: usize,
}

impl Default for DynamicPriorityConfig {
    fn default() -> Self {
        Self {
            usage_weight: default_usage_weight(),
            association_weight: default_association_weight(),
            high_slots: default_high_slots(),
            medium_slots: default_medium_slots(),
        }
    }
}

fn default_usage_weight() -> f64 {
    1.0
}

fn default_association_weight() -> f64 {
    2.0
}

fn default_high_slots() -> usize {
    2
}

fn default_medium_slots() -> usize {
    3
}

/// Domain-knowledge edges added at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedAssociation {
    /// Source tool
    pub from: ToolId,
    /// Tools commonly used after it
    pub to: Vec<ToolId>,
    /// Edge weight
    #[serde(default = "default_seed_weight")]
    pub weight: u64,
}

impl SeedAssociation {
    /// Create a seed with weight 2
    pub fn new<I>(from: impl Into<ToolId>, to: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        Self {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            weight: default_seed_weight(),
        }
    }
}

fn default_seed_weight() -> u64 {
    2
}

fn default_seed_associations() -> Vec<SeedAssociation> {
    vec![
        SeedAssociation::new("json-formatter", ["table-sorter", "base64-encoder"]),
        SeedAssociation::new("base64-encoder", ["url-encoder", "hash-generator"]),
        SeedAssociation::new("url-encoder", ["base64-encoder"]),
        SeedAssociation::new("regex-cheatsheet", ["json-formatter"]),
        SeedAssociation::new("mermaid-editor", ["git-command-helper"]),
    ]
}

/// Preload manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Loader settings
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Prefetch network gate
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Usage tracker settings
    #[serde(default)]
    pub usage: UsageConfig,
    /// Usage-driven scheduling
    #[serde(default)]
    pub dynamic: DynamicPriorityConfig,
    /// Route mapping
    #[serde(default)]
    pub routes: RouteConfig,
    /// Idle fallback delay (ms)
    #[serde(default = "default_idle_fallback_ms")]
    pub idle_fallback_ms: u64,
    /// Predictions preloaded by `preload_related`
    #[serde(default = "default_related_top_n")]
    pub related_top_n: usize,
    /// Edges seeded at construction
    #[serde(default = "default_seed_associations")]
    pub seed_associations: Vec<SeedAssociation>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            scheduler: SchedulerConfig::default(),
            network: NetworkPolicy::default(),
            usage: UsageConfig::default(),
            dynamic: DynamicPriorityConfig::default(),
            routes: RouteConfig::default(),
            idle_fallback_ms: default_idle_fallback_ms(),
            related_top_n: default_related_top_n(),
            seed_associations: default_seed_associations(),
        }
    }
}

fn default_idle_fallback_ms() -> u64 {
    50
}

fn default_related_top_n() -> usize {
    3
}

impl ManagerConfig {
    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Idle fallback delay
    pub fn idle_fallback(&self) -> Duration {
        Duration::from_millis(self.idle_fallback_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.loader.concurrency_limit == 0 {
            return Err(PreloadError::Configuration(
                "concurrency_limit must be at least 1".into(),
            ));
        }

        if self.loader.cache.capacity == 0 {
            return Err(PreloadError::Configuration(
                "cache capacity must be at least 1".into(),
            ));
        }

        if self.loader.load_timeout_ms == Some(0) {
            return Err(PreloadError::Configuration(
                "load_timeout_ms must be positive when set".into(),
            ));
        }

        let weights = [self.dynamic.usage_weight, self.dynamic.association_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PreloadError::Configuration(
                "dynamic weights must be finite and non-negative".into(),
            ));
        }

        if self.network.min_downlink_mbps.is_nan() {
            return Err(PreloadError::Configuration(
                "min_downlink_mbps must be a number".into(),
            ));
        }

        if self.usage.usage_key.is_empty() || self.usage.association_key.is_empty() {
            return Err(PreloadError::Configuration("storage keys must not be empty".into()));
        }
        if self.usage.usage_key == self.usage.association_key {
            return Err(PreloadError::Configuration(format!(
                "usage and association share the key '{}'",
                self.usage.usage_key
            )));
        }

        if !self.routes.prefix.starts_with('/') {
            return Err(PreloadError::Configuration(format!(
                "route prefix '{}' must start with '/'",
                self.routes.prefix
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.loader.concurrency_limit, 3);
        assert_eq!(config.loader.cache.capacity, 100);
        assert_eq!(config.loader.cache.default_ttl_ms, 300_000);
        assert_eq!(config.scheduler.medium_delay_ms, 1000);
        assert_eq!(config.scheduler.low_delay_ms, 3000);
        assert_eq!(config.network.max_rtt_ms, 250);
        assert_eq!(config.idle_fallback(), Duration::from_millis(50));
        assert_eq!(config.related_top_n, 3);
        assert_eq!(config.dynamic.high_slots, 2);
        assert_eq!(config.dynamic.medium_slots, 3);
        assert_eq!(config.usage.usage_key, "preload_usage");
        assert!(config.seed_associations.iter().all(|seed| seed.weight == 2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ManagerConfig::from_json_str(
            r#"{
                "loader": { "concurrency_limit": 6, "load_timeout_ms": 8000 },
                "scheduler": {
                    "low_delay_ms": 5000,
                    "common_tools": [{ "id": "json-formatter", "priority": "high" }]
                },
                "seed_associations": []
            }"#,
        )
        .unwrap();

        assert_eq!(config.loader.concurrency_limit, 6);
        assert_eq!(config.loader.load_timeout_ms, Some(8000));
        assert!(config.loader.cache_modules);
        assert_eq!(config.scheduler.medium_delay_ms, 1000);
        assert_eq!(config.scheduler.low_delay_ms, 5000);
        assert_eq!(config.scheduler.common_tools[0].priority, Priority::High);
        assert!(config.seed_associations.is_empty());
        assert_eq!(config.routes.prefix, "/tools/");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let err = ManagerConfig::from_json_str(r#"{"loader":{"concurrency_limit":0}}"#);
        assert!(matches!(err, Err(PreloadError::Configuration(_))));

        let mut config = ManagerConfig::default();
        config.usage.association_key = config.usage.usage_key.clone();
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.dynamic.association_weight = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.routes.prefix = "tools/".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = ManagerConfig::from_json_str("{ loader: ");
        assert!(matches!(err, Err(PreloadError::Serialization(_))));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("preload.json");
        std::fs::write(&path, r#"{"related_top_n": 5}"#).unwrap();

        let config = ManagerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.related_top_n, 5);

        let missing = ManagerConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(PreloadError::Io(_))));
    }
}
