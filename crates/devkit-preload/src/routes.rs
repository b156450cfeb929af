//! Route-level prefetching

use crate::{PreloadConfig, PreloadHandle, PreloadManager, Priority, PriorityBatches, ToolId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Route mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix in front of tool slugs
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

fn default_prefix() -> String {
    "/tools/".to_string()
}

/// Maps route paths to tool slugs and prefetches them
#[derive(Clone)]
pub struct RoutePrefetcher {
    manager: PreloadManager,
    config: RouteConfig,
}

impl RoutePrefetcher {
    /// Create a prefetcher over `manager`
    pub fn new(manager: PreloadManager, config: RouteConfig) -> Self {
        Self { manager, config }
    }

    /// Tool slug for a route path, if it is a tool route
    ///
    /// `/tools/json-formatter/?tab=raw#top` maps to `json-formatter`.
    pub fn slug_for_route(&self, path: &str) -> Option<ToolId> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let rest = path.strip_prefix(self.config.prefix.as_str())?;
        let slug = rest.trim_end_matches('/');

        if slug.is_empty() || slug.contains('/') {
            return None;
        }
        Some(ToolId::from(slug))
    }

    /// Register and preload the tool behind `path`
    pub fn prefetch_route(&self, path: &str, priority: Priority) -> Option<PreloadHandle> {
        let slug = self.slug_for_route(path)?;
        if !self.manager.register(slug.clone(), PreloadConfig::new(priority)) {
            debug!("No tool behind route '{}'", path);
            return None;
        }
        Some(self.manager.preload(slug, priority))
    }

    /// Register every tool route at medium priority, then preload by priority
    pub fn prefetch_routes<'a, I>(&self, paths: I) -> PriorityBatches
    where
        I: IntoIterator<Item = &'a str>,
    {
        for slug in paths.into_iter().filter_map(|path| self.slug_for_route(path)) {
            self.manager.register(slug, PreloadConfig::new(Priority::Medium));
        }
        self.manager.preload_by_priority()
    }

    /// Record a visit to `path` and preload what usually follows it
    pub fn navigate(&self, path: &str) -> Option<PriorityBatches> {
        let slug = self.slug_for_route(path)?;
        self.manager.record_usage(slug.clone());

        let top_n = self.manager.config().related_top_n;
        Some(self.manager.preload_related(slug.as_str(), top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{loader_fn, ManagerConfig, Module, StaticRegistry};
    use std::sync::Arc;

    fn prefetcher(ids: &[&str]) -> RoutePrefetcher {
        let registry = StaticRegistry::new();
        for id in ids {
            registry.insert(*id, loader_fn(|| async { Ok(Arc::new(()) as Module) }));
        }
        PreloadManager::builder()
            .registry(Arc::new(registry))
            .config(ManagerConfig {
                seed_associations: Vec::new(),
                ..Default::default()
            })
            .build()
            .unwrap()
            .routes()
    }

    #[test]
    fn test_slug_for_route() {
        let routes = prefetcher(&[]);

        let slug = |path| routes.slug_for_route(path).map(|id| id.to_string());
        assert_eq!(slug("/tools/json-formatter"), Some("json-formatter".into()));
        assert_eq!(slug("/tools/json-formatter/"), Some("json-formatter".into()));
        assert_eq!(slug("/tools/regex-cheatsheet?flags=gi"), Some("regex-cheatsheet".into()));
        assert_eq!(slug("/tools/hash-generator#sha256"), Some("hash-generator".into()));
        assert_eq!(slug("/tools/"), None);
        assert_eq!(slug("/about"), None);
        assert_eq!(slug("/tools/a/b"), None);
    }

    #[tokio::test]
    async fn test_prefetch_route() {
        let routes = prefetcher(&["url-encoder"]);

        let handle = routes.prefetch_route("/tools/url-encoder", Priority::High).unwrap();
        assert!(handle.await.is_ok());
        assert!(routes.prefetch_route("/tools/unknown", Priority::High).is_none());
        assert!(routes.manager.preloader().is_loaded("url-encoder"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_routes_at_medium() {
        let routes = prefetcher(&["base64-encoder", "table-sorter"]);

        let batches = routes.prefetch_routes(["/tools/base64-encoder", "/tools/table-sorter/", "/"]);
        assert!(batches.high().is_empty());
        assert_eq!(batches.medium().len(), 2);
        assert_eq!(batches.join().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigate_records_and_predicts() {
        let routes = prefetcher(&["json-formatter", "table-sorter"]);

        routes.navigate("/tools/json-formatter");
        let batches = routes.navigate("/tools/table-sorter").unwrap();
        assert!(batches.high().is_empty());

        let batches = routes.navigate("/tools/json-formatter").unwrap();
        assert_eq!(batches.high(), &[ToolId::from("table-sorter")]);
        assert_eq!(routes.manager.usage().usage_count("json-formatter"), 2);
        batches.join().await;
    }
}
