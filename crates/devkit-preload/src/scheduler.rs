//! Priority scheduler with staggered batches and a network gate

use crate::{
    lock, IdleScheduler, LoadResult, NetworkInfo, NetworkPolicy, PreloadError, PreloadHandle,
    Preloader, Priority, ToolId,
};
use futures::future::{join_all, FutureExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// Predicate deciding at schedule time whether an entry loads
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;

/// How one registered tool is preloaded
#[derive(Clone, Default)]
pub struct PreloadConfig {
    /// Bucket the tool is scheduled in
    pub priority: Priority,
    /// Own delay, replacing the bucket delay
    pub delay: Option<Duration>,
    /// Skip the tool when this returns false
    pub condition: Option<Condition>,
}

impl PreloadConfig {
    /// Config with the given priority
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// Set an individual delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set a load condition
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    fn should_load(&self) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition())
    }
}

impl fmt::Debug for PreloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadConfig")
            .field("priority", &self.priority)
            .field("delay", &self.delay)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

/// Entry of the curated common-tools list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonTool {
    /// Tool slug
    pub id: ToolId,
    /// Priority to register it with
    #[serde(default)]
    pub priority: Priority,
}

impl CommonTool {
    /// Create an entry
    pub fn new(id: impl Into<ToolId>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay before the medium bucket loads (ms)
    #[serde(default = "default_medium_delay_ms")]
    pub medium_delay_ms: u64,
    /// Delay before the low bucket loads (ms)
    #[serde(default = "default_low_delay_ms")]
    pub low_delay_ms: u64,
    /// Recent tools taken by `smart_preload`
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    /// Favourite tools taken by `smart_preload`
    #[serde(default = "default_favorite_limit")]
    pub favorite_limit: usize,
    /// Tools registered by `preload_common_tools`
    #[serde(default = "default_common_tools")]
    pub common_tools: Vec<CommonTool>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            medium_delay_ms: default_medium_delay_ms(),
            low_delay_ms: default_low_delay_ms(),
            recent_limit: default_recent_limit(),
            favorite_limit: default_favorite_limit(),
            common_tools: default_common_tools(),
        }
    }
}

fn default_medium_delay_ms() -> u64 {
    1000
}

fn default_low_delay_ms() -> u64 {
    3000
}

fn default_recent_limit() -> usize {
    5
}

fn default_favorite_limit() -> usize {
    3
}

fn default_common_tools() -> Vec<CommonTool> {
    let high = ["json-formatter", "base64-encoder", "url-encoder"];
    let medium = [
        "regex-cheatsheet",
        "qr-code-generator",
        "table-sorter",
        "mermaid-editor",
        "git-command-helper",
        "hash-generator",
    ];

    high.into_iter()
        .map(|id| CommonTool::new(id, Priority::High))
        .chain(medium.into_iter().map(|id| CommonTool::new(id, Priority::Medium)))
        .collect()
}

impl SchedulerConfig {
    /// Medium bucket delay
    pub fn medium_delay(&self) -> Duration {
        Duration::from_millis(self.medium_delay_ms)
    }

    /// Low bucket delay
    pub fn low_delay(&self) -> Duration {
        Duration::from_millis(self.low_delay_ms)
    }
}

struct DelayedBatch {
    ids: Vec<ToolId>,
    task: JoinHandle<Vec<LoadResult>>,
}

/// Loads started by one `preload_by_priority` call
///
/// Dropping it leaves the delayed batches running.
#[derive(Default)]
pub struct PriorityBatches {
    high: Vec<ToolId>,
    medium: Vec<ToolId>,
    low: Vec<ToolId>,
    immediate: Vec<PreloadHandle>,
    delayed: Vec<DelayedBatch>,
}

impl PriorityBatches {
    /// Ids in the high bucket
    pub fn high(&self) -> &[ToolId] {
        &self.high
    }

    /// Ids in the medium bucket
    pub fn medium(&self) -> &[ToolId] {
        &self.medium
    }

    /// Ids in the low bucket
    pub fn low(&self) -> &[ToolId] {
        &self.low
    }

    /// Total scheduled ids
    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    /// Whether nothing was scheduled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every batch, immediate loads first
    ///
    /// Batches aborted by `clear` report [`PreloadError::Abandoned`] per id.
    pub async fn join(self) -> Vec<LoadResult> {
        let mut results = join_all(self.immediate.iter().map(PreloadHandle::wait)).await;

        for batch in self.delayed {
            match batch.task.await {
                Ok(batch_results) => results.extend(batch_results),
                Err(_) => results.extend(
                    batch
                        .ids
                        .into_iter()
                        .map(|id| Err(PreloadError::Abandoned(id))),
                ),
            }
        }

        results
    }
}

impl fmt::Debug for PriorityBatches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityBatches")
            .field("high", &self.high)
            .field("medium", &self.medium)
            .field("low", &self.low)
            .finish()
    }
}

struct Inner {
    config: SchedulerConfig,
    preloader: Preloader,
    policy: NetworkPolicy,
    network: Arc<dyn NetworkInfo>,
    idle: Arc<dyn IdleScheduler>,
    entries: Mutex<IndexMap<ToolId, PreloadConfig>>,
    pending: Mutex<Vec<AbortHandle>>,
}

/// Registry of preload configs turned into staggered loads
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<Inner>,
}

impl PriorityScheduler {
    /// Create a scheduler over `preloader`
    pub fn new(
        config: SchedulerConfig,
        preloader: Preloader,
        policy: NetworkPolicy,
        network: Arc<dyn NetworkInfo>,
        idle: Arc<dyn IdleScheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                preloader,
                policy,
                network,
                idle,
                entries: Mutex::new(IndexMap::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Underlying preloader
    pub fn preloader(&self) -> &Preloader {
        &self.inner.preloader
    }

    /// Register or overwrite a tool's config
    ///
    /// Returns false, registering nothing, for ids the registry does not know.
    pub fn register(&self, id: impl Into<ToolId>, config: PreloadConfig) -> bool {
        let id = id.into();
        if !self.inner.preloader.registry().has_tool(&id) {
            debug!("Ignoring registration of unknown tool '{}'", id);
            return false;
        }

        lock(&self.inner.entries).insert(id, config);
        true
    }

    /// Remove a registration
    pub fn unregister(&self, id: &str) -> Option<PreloadConfig> {
        lock(&self.inner.entries).shift_remove(id)
    }

    /// Registered config for `id`
    pub fn config_of(&self, id: &str) -> Option<PreloadConfig> {
        lock(&self.inner.entries).get(id).cloned()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        lock(&self.inner.entries).is_empty()
    }

    /// Preload registered, not yet loaded tools by bucket
    ///
    /// High loads start before this returns. Medium and low start after their
    /// bucket delays; entries with their own delay start after that instead.
    pub fn preload_by_priority(&self) -> PriorityBatches {
        let entries: Vec<(ToolId, PreloadConfig)> = lock(&self.inner.entries)
            .iter()
            .map(|(id, config)| (id.clone(), config.clone()))
            .collect();

        let mut batches = PriorityBatches::default();
        let mut medium = Vec::new();
        let mut low = Vec::new();

        for (id, config) in entries {
            if self.inner.preloader.is_loaded(id.as_str()) {
                continue;
            }
            if !config.should_load() {
                debug!("Condition false for '{}', skipping", id);
                continue;
            }

            match config.priority {
                Priority::High => batches.high.push(id.clone()),
                Priority::Medium => batches.medium.push(id.clone()),
                Priority::Low => batches.low.push(id.clone()),
            }

            if let Some(delay) = config.delay {
                let batch = self.spawn_delayed(vec![id], config.priority, delay);
                batches.delayed.push(batch);
                continue;
            }

            match config.priority {
                Priority::High => batches
                    .immediate
                    .push(self.inner.preloader.preload(id, Priority::High)),
                Priority::Medium => medium.push(id),
                Priority::Low => low.push(id),
            }
        }

        if !medium.is_empty() {
            let delay = self.inner.config.medium_delay();
            batches
                .delayed
                .push(self.spawn_delayed(medium, Priority::Medium, delay));
        }
        if !low.is_empty() {
            let delay = self.inner.config.low_delay();
            batches
                .delayed
                .push(self.spawn_delayed(low, Priority::Low, delay));
        }

        debug!(
            "Scheduled {} high, {} medium, {} low",
            batches.high.len(),
            batches.medium.len(),
            batches.low.len()
        );
        batches
    }

    fn spawn_delayed(&self, ids: Vec<ToolId>, priority: Priority, delay: Duration) -> DelayedBatch {
        let preloader = self.inner.preloader.clone();
        let batch_ids = ids.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            preloader.preload_batch(batch_ids, priority).await
        });
        self.track(task.abort_handle());

        DelayedBatch { ids, task }
    }

    fn track(&self, handle: AbortHandle) {
        let mut pending = lock(&self.inner.pending);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Whether the current connection passes the prefetch gate
    pub fn network_allows(&self) -> bool {
        self.inner.policy.allows(&self.inner.network.current())
    }

    /// Register the common tools and preload them when idle
    ///
    /// Does nothing and returns false when the connection fails the gate.
    pub fn preload_common_tools(&self) -> bool {
        if !self.network_allows() {
            info!("Constrained connection, skipping common tool preload");
            return false;
        }

        for tool in &self.inner.config.common_tools {
            self.register(tool.id.clone(), PreloadConfig::new(tool.priority));
        }

        let scheduler = self.clone();
        let task = self.inner.idle.schedule(
            async move {
                scheduler.preload_by_priority();
            }
            .boxed(),
        );
        self.track(task.abort_handle());

        true
    }

    /// Register recent tools at high and favourites at medium, then preload
    pub fn smart_preload<R, F>(&self, recent: R, favorites: F) -> PriorityBatches
    where
        R: IntoIterator,
        R::Item: Into<ToolId>,
        F: IntoIterator,
        F::Item: Into<ToolId>,
    {
        for id in recent.into_iter().take(self.inner.config.recent_limit) {
            self.register(id, PreloadConfig::new(Priority::High));
        }
        for id in favorites.into_iter().take(self.inner.config.favorite_limit) {
            self.register(id, PreloadConfig::new(Priority::Medium));
        }

        self.preload_by_priority()
    }

    /// Drop all registrations and abort pending delayed batches
    pub fn clear(&self) {
        lock(&self.inner.entries).clear();

        let pending = std::mem::take(&mut *lock(&self.inner.pending));
        for handle in &pending {
            handle.abort();
        }
        debug!("Cleared scheduler ({} pending tasks aborted)", pending.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        loader_fn, ConnectionInfo, LoadOutcome, LoaderConfig, Module, StaticRegistry, TimerIdle,
        UnknownNetwork, WatchedNetwork,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        scheduler: PriorityScheduler,
        calls: Arc<dashmap::DashMap<String, usize>>,
    }

    impl Fixture {
        fn calls(&self, id: &str) -> usize {
            self.calls.get(id).map(|c| *c).unwrap_or(0)
        }
    }

    fn fixture(ids: &[&str], network: Arc<dyn NetworkInfo>) -> Fixture {
        let registry = StaticRegistry::new();
        let calls = Arc::new(dashmap::DashMap::new());
        for id in ids {
            let calls = calls.clone();
            let key = id.to_string();
            registry.insert(
                *id,
                loader_fn(move || {
                    *calls.entry(key.clone()).or_insert(0) += 1;
                    async { Ok(Arc::new(()) as Module) }
                }),
            );
        }

        let preloader = Preloader::new(LoaderConfig::default(), Arc::new(registry));
        let scheduler = PriorityScheduler::new(
            SchedulerConfig::default(),
            preloader,
            NetworkPolicy::default(),
            network,
            Arc::new(TimerIdle::default()),
        );
        Fixture { scheduler, calls }
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.medium_delay(), Duration::from_millis(1000));
        assert_eq!(config.low_delay(), Duration::from_millis(3000));
        assert_eq!(config.recent_limit, 5);
        assert_eq!(config.favorite_limit, 3);
        assert_eq!(config.common_tools.len(), 9);
    }

    #[tokio::test]
    async fn test_register_unknown_is_noop() {
        let f = fixture(&["json-formatter"], Arc::new(UnknownNetwork));

        assert!(!f.scheduler.register("nope", PreloadConfig::new(Priority::High)));
        assert!(f.scheduler.register("json-formatter", PreloadConfig::new(Priority::Low)));
        assert!(f.scheduler.register("json-formatter", PreloadConfig::new(Priority::High)));

        assert_eq!(f.scheduler.len(), 1);
        assert_eq!(
            f.scheduler.config_of("json-formatter").map(|c| c.priority),
            Some(Priority::High)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_staggered() {
        let f = fixture(&["A", "B", "C"], Arc::new(UnknownNetwork));
        f.scheduler.register("A", PreloadConfig::new(Priority::High));
        f.scheduler.register("B", PreloadConfig::new(Priority::Medium));
        f.scheduler.register("C", PreloadConfig::new(Priority::Low));

        let batches = f.scheduler.preload_by_priority();
        assert_eq!(f.calls("A"), 1);
        assert_eq!(f.calls("B"), 0);
        assert_eq!(f.calls("C"), 0);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(f.calls("B"), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(f.calls("B"), 1);
        assert_eq!(f.calls("C"), 0);

        let results = batches.join().await;
        assert_eq!(f.calls("C"), 1);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r == &Ok(LoadOutcome::Loaded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_condition_never_loads() {
        let f = fixture(&["gated"], Arc::new(UnknownNetwork));
        f.scheduler.register(
            "gated",
            PreloadConfig::new(Priority::High).with_condition(|| false),
        );

        let batches = f.scheduler.preload_by_priority();
        assert!(batches.is_empty());
        assert!(batches.join().await.is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.calls("gated"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_delay_overrides_bucket() {
        let f = fixture(&["soon", "late"], Arc::new(UnknownNetwork));
        f.scheduler.register(
            "soon",
            PreloadConfig::new(Priority::Low).with_delay(Duration::from_millis(100)),
        );
        f.scheduler.register(
            "late",
            PreloadConfig::new(Priority::High).with_delay(Duration::from_millis(2000)),
        );

        let batches = f.scheduler.preload_by_priority();
        assert_eq!(batches.low().len(), 1);
        assert_eq!(f.calls("late"), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.calls("soon"), 1);
        assert_eq!(f.calls("late"), 0);

        batches.join().await;
        assert_eq!(f.calls("late"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loaded_tools_are_skipped() {
        let f = fixture(&["A"], Arc::new(UnknownNetwork));
        f.scheduler.register("A", PreloadConfig::new(Priority::High));

        f.scheduler.preload_by_priority().join().await;
        let again = f.scheduler.preload_by_priority();

        assert!(again.is_empty());
        assert_eq!(f.calls("A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_aborts_delayed_batches() {
        let f = fixture(&["B"], Arc::new(UnknownNetwork));
        f.scheduler.register("B", PreloadConfig::new(Priority::Medium));

        let batches = f.scheduler.preload_by_priority();
        f.scheduler.clear();

        let results = batches.join().await;
        assert_eq!(results, vec![Err(PreloadError::Abandoned("B".into()))]);
        assert_eq!(f.calls("B"), 0);
        assert!(f.scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_common_tools_gated_by_network() {
        let network = Arc::new(WatchedNetwork::new(
            ConnectionInfo::unknown().with_save_data(true),
        ));
        let f = fixture(&["json-formatter", "hash-generator"], network.clone());

        assert!(!f.scheduler.preload_common_tools());
        assert!(f.scheduler.is_empty());

        network.update(ConnectionInfo::unknown().with_rtt_ms(400));
        assert!(!f.scheduler.preload_common_tools());

        network.update(ConnectionInfo::unknown().with_rtt_ms(80));
        assert!(f.scheduler.preload_common_tools());
        // Only tools the registry knows are registered
        assert_eq!(f.scheduler.len(), 2);
        assert_eq!(f.calls("json-formatter"), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.calls("json-formatter"), 1);
        assert_eq!(f.calls("hash-generator"), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(f.calls("hash-generator"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_preload_limits() {
        let ids = ["r1", "r2", "r3", "r4", "r5", "r6", "f1", "f2", "f3", "f4"];
        let f = fixture(&ids, Arc::new(UnknownNetwork));

        let batches = f
            .scheduler
            .smart_preload(ids[..6].iter().copied(), ids[6..].iter().copied())
            .join()
            .await;

        assert_eq!(batches.len(), 8);
        assert_eq!(f.calls("r5"), 1);
        assert_eq!(f.calls("r6"), 0);
        assert_eq!(f.calls("f3"), 1);
        assert_eq!(f.calls("f4"), 0);
    }

    #[tokio::test]
    async fn test_condition_evaluated_at_schedule_time() {
        let f = fixture(&["maybe"], Arc::new(UnknownNetwork));
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        f.scheduler.register(
            "maybe",
            PreloadConfig::new(Priority::High).with_condition(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        f.scheduler.preload_by_priority().join().await;
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert_eq!(f.calls("maybe"), 1);
    }
}
