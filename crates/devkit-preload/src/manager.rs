//! Preload manager facade

use crate::triggers::{self, Observable, TriggerGuard};
use crate::{
    CacheStats, CleanupSubscription, IdleScheduler, KeyValueStore, LoadResult,
    ManagerConfig, MemoryStore, Module, NetworkInfo, PreloadConfig, PreloadError, PreloadHandle,
    PreloadStats, Preloader, Priority, PriorityBatches, PriorityScheduler, Result,
    RoutePrefetcher, StaticRegistry, TimerIdle, ToolId, ToolRegistry, UnknownNetwork,
    UsageTracker,
};
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Combined loader, scheduler and cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerStats {
    /// Successful loads
    pub preloaded_modules: u64,
    /// Requests served without running a loader
    pub hits: u64,
    /// Missing loaders and failed loads
    pub misses: u64,
    /// Cumulative load time
    pub total_load_time: Duration,
    /// Mean load time
    pub average_load_time: Duration,
    /// Registered preload configs
    pub total: usize,
    /// Loaded ids
    pub loaded: usize,
    /// Ids whose loader is running
    pub loading: usize,
    /// Ids waiting in the queue
    pub queued: usize,
    /// Occupied concurrency slots
    pub active: usize,
    /// Module cache statistics, when caching is enabled
    pub cache: Option<CacheStats>,
}

impl ManagerStats {
    /// Hit rate over hits and misses
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    config: ManagerConfig,
    preloader: Preloader,
    scheduler: PriorityScheduler,
    usage: UsageTracker,
    network: Arc<dyn NetworkInfo>,
}

/// Entry point for everything preload related
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PreloadManager {
    inner: Arc<Inner>,
}

/// Builder for [`PreloadManager`]
#[derive(Default)]
pub struct PreloadManagerBuilder {
    config: Option<ManagerConfig>,
    registry: Option<Arc<dyn ToolRegistry>>,
    store: Option<Arc<dyn KeyValueStore>>,
    network: Option<Arc<dyn NetworkInfo>>,
    idle: Option<Arc<dyn IdleScheduler>>,
}

impl PreloadManagerBuilder {
    /// Set configuration
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the tool registry
    pub fn registry(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the key-value store for usage history
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the network information source
    pub fn network(mut self, network: Arc<dyn NetworkInfo>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the idle scheduler
    pub fn idle(mut self, idle: Arc<dyn IdleScheduler>) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Build the manager
    ///
    /// Missing collaborators default to an empty registry, an in-memory
    /// store, unknown network and a timer idle fallback.
    pub fn build(self) -> Result<PreloadManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticRegistry::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let network = self.network.unwrap_or_else(|| Arc::new(UnknownNetwork));
        let idle = self
            .idle
            .unwrap_or_else(|| Arc::new(TimerIdle::new(config.idle_fallback())));

        let preloader = Preloader::new(config.loader.clone(), registry);
        let scheduler = PriorityScheduler::new(
            config.scheduler.clone(),
            preloader.clone(),
            config.network.clone(),
            network.clone(),
            idle,
        );

        let usage = UsageTracker::new(config.usage.clone(), store);
        for seed in &config.seed_associations {
            usage.seed_associations(seed.from.clone(), seed.to.iter().cloned(), seed.weight);
        }

        info!(
            "Preload manager ready (concurrency {}, {} seeded sources)",
            config.loader.concurrency_limit,
            config.seed_associations.len()
        );

        Ok(PreloadManager {
            inner: Arc::new(Inner {
                config,
                preloader,
                scheduler,
                usage,
                network,
            }),
        })
    }
}

impl PreloadManager {
    /// Start building a manager
    pub fn builder() -> PreloadManagerBuilder {
        PreloadManagerBuilder::default()
    }

    /// Manager with default config over `registry`
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Result<Self> {
        Self::builder().registry(registry).build()
    }

    /// Configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Underlying preloader
    pub fn preloader(&self) -> &Preloader {
        &self.inner.preloader
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.inner.scheduler
    }

    /// Usage tracker
    pub fn usage(&self) -> &UsageTracker {
        &self.inner.usage
    }

    /// Route facade sharing this manager
    pub fn routes(&self) -> RoutePrefetcher {
        RoutePrefetcher::new(self.clone(), self.inner.config.routes.clone())
    }

    /// Register or overwrite a tool's preload config
    pub fn register(&self, id: impl Into<ToolId>, config: PreloadConfig) -> bool {
        self.inner.scheduler.register(id, config)
    }

    /// Request a load
    pub fn preload(&self, id: impl Into<ToolId>, priority: Priority) -> PreloadHandle {
        self.inner.preloader.preload(id, priority)
    }

    /// Request loads for many ids and wait for all of them
    pub fn preload_batch<I>(
        &self,
        ids: I,
        priority: Priority,
    ) -> impl Future<Output = Vec<LoadResult>> + Send + 'static
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        self.inner.preloader.preload_batch(ids, priority)
    }

    /// Preload registered tools by bucket
    pub fn preload_by_priority(&self) -> PriorityBatches {
        self.inner.scheduler.preload_by_priority()
    }

    /// Register and idle-preload the common tools if the network allows
    pub fn preload_common_tools(&self) -> bool {
        self.inner.scheduler.preload_common_tools()
    }

    /// Preload recent tools at high and favourites at medium
    pub fn smart_preload<R, F>(&self, recent: R, favorites: F) -> PriorityBatches
    where
        R: IntoIterator,
        R::Item: Into<ToolId>,
        F: IntoIterator,
        F::Item: Into<ToolId>,
    {
        self.inner.scheduler.smart_preload(recent, favorites)
    }

    /// Record a use of `id`
    pub fn record_usage(&self, id: impl Into<ToolId>) {
        self.inner.usage.record_usage(id);
    }

    /// Strengthen `from -> to` edges by `weight`
    pub fn add_associations<I>(&self, from: impl Into<ToolId>, tos: I, weight: u64)
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        self.inner.usage.add_associations(from, tos, weight);
    }

    /// The `top_n` tools most often used after `from`
    pub fn predict_related(&self, from: &str, top_n: usize) -> Vec<ToolId> {
        self.inner.usage.predict_related(from, top_n)
    }

    /// Register predictions for `from` (best at high, rest at medium) and preload
    pub fn preload_related(&self, from: &str, top_n: usize) -> PriorityBatches {
        let predicted = self.inner.usage.predict_related(from, top_n);
        debug!("Predicted {} tools after '{}'", predicted.len(), from);

        for (rank, id) in predicted.into_iter().enumerate() {
            let priority = if rank == 0 {
                Priority::High
            } else {
                Priority::Medium
            };
            self.register(id, PreloadConfig::new(priority));
        }

        self.preload_by_priority()
    }

    /// Rank `ids` by usage and association with the last used tool, then preload
    ///
    /// Equal scores keep input order.
    pub fn schedule_tools_with_dynamic_priority<I>(&self, ids: I) -> PriorityBatches
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        let weights = &self.inner.config.dynamic;

        let mut scored: Vec<(ToolId, f64)> = ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                let score = self.inner.usage.composite_score(
                    id.as_str(),
                    weights.usage_weight,
                    weights.association_weight,
                );
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (rank, (id, score)) in scored.into_iter().enumerate() {
            let priority = if rank < weights.high_slots {
                Priority::High
            } else if rank < weights.high_slots + weights.medium_slots {
                Priority::Medium
            } else {
                Priority::Low
            };
            debug!("'{}' scored {:.1}, {} priority", id, score, priority);
            self.register(id, PreloadConfig::new(priority));
        }

        self.preload_by_priority()
    }

    /// Zero loader and cache statistics
    pub fn reset_stats(&self) {
        self.inner.preloader.reset_stats();
        if let Some(modules) = self.inner.preloader.module_cache() {
            modules.reset_stats();
        }
    }

    /// Drop registrations, queued work, loaded state, cached modules and stats
    ///
    /// Usage history is kept.
    pub fn cleanup(&self) {
        self.inner.scheduler.clear();
        self.inner.preloader.clear();
        info!("Preload state cleared");
    }

    /// Current statistics
    pub fn stats(&self) -> ManagerStats {
        let PreloadStats {
            preloaded_modules,
            hits,
            misses,
            total_load_time,
            average_load_time,
        } = self.inner.preloader.stats();
        let status = self.inner.preloader.status();

        ManagerStats {
            preloaded_modules,
            hits,
            misses,
            total_load_time,
            average_load_time,
            total: self.inner.scheduler.len(),
            loaded: status.loaded,
            loading: status.loading,
            queued: status.queued,
            active: status.active,
            cache: self.inner.preloader.cache_stats(),
        }
    }

    /// Loaded module for `id`, if still cached
    pub fn module(&self, id: &str) -> Option<Module> {
        self.inner.preloader.module(id)
    }

    /// Start the periodic module cache sweep for as long as the subscription lives
    pub fn subscribe_cache_cleanup(&self) -> Option<CleanupSubscription<ToolId, Module>> {
        self.inner
            .preloader
            .module_cache()
            .map(|modules| modules.subscribe_cleanup())
    }

    /// Preload `id` at low priority the first time `target` fires
    pub fn preload_on_visible(
        &self,
        target: Arc<dyn Observable>,
        id: impl Into<ToolId>,
    ) -> TriggerGuard {
        triggers::preload_on_visible(&self.inner.preloader, target, id)
    }

    /// Preload `id` at high priority whenever `target` fires
    pub fn preload_on_hover(
        &self,
        target: Arc<dyn Observable>,
        id: impl Into<ToolId>,
    ) -> TriggerGuard {
        triggers::preload_on_hover(&self.inner.preloader, target, id)
    }

    /// Re-run `preload_common_tools` whenever the connection recovers
    ///
    /// Returns `None` when the network source has no change notifications.
    /// The task ends on the first change after the manager is dropped, or
    /// when the network source is dropped.
    pub fn watch_network(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.inner.network.subscribe()?;
        let policy = self.inner.config.network.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            let mut allowed = policy.allows(&rx.borrow_and_update());

            while rx.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now_allowed = policy.allows(&rx.borrow_and_update());

                if now_allowed && !allowed {
                    info!("Connection recovered, preloading common tools");
                    PreloadManager { inner }.preload_common_tools();
                }
                allowed = now_allowed;
            }
        }))
    }
}

static GLOBAL: OnceLock<PreloadManager> = OnceLock::new();

/// Install the process-wide manager; fails if one is already installed
pub fn install_global(manager: PreloadManager) -> Result<&'static PreloadManager> {
    let mut installed = false;
    let global = GLOBAL.get_or_init(|| {
        installed = true;
        manager
    });

    if installed {
        Ok(global)
    } else {
        Err(PreloadError::Configuration(
            "global preload manager already installed".into(),
        ))
    }
}

/// The process-wide manager, if installed
pub fn global() -> Option<&'static PreloadManager> {
    GLOBAL.get()
}
