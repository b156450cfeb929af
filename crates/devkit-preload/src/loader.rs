//! Concurrency-limited preloader

use crate::deferred::{deferred, Deferred, Promise};
use crate::{
    lock, CacheConfig, CacheStats, Module, PreloadError, Priority, PriorityQueue, Result, ToolId,
    ToolRegistry, TtlCache,
};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Maximum loads in flight at once
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Per-load timeout (ms); no timeout when unset
    #[serde(default)]
    pub load_timeout_ms: Option<u64>,
    /// Keep loaded modules in a TTL cache
    #[serde(default = "default_cache_modules")]
    pub cache_modules: bool,
    /// Module cache config
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            load_timeout_ms: None,
            cache_modules: default_cache_modules(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_concurrency_limit() -> usize {
    3
}

fn default_cache_modules() -> bool {
    true
}

/// How a preload settled successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The loader ran and succeeded
    Loaded,
    /// The id was already loaded; nothing ran
    AlreadyLoaded,
    /// Served from the module cache; nothing ran
    Cached,
    /// No loader is registered for the id
    NoLoader,
}

/// Result every awaiter of a preload receives
pub type LoadResult = Result<LoadOutcome>;

/// Shared handle to one preload
///
/// Every caller requesting the same in-flight id gets a handle to the same
/// promise. Await it directly or through [`PreloadHandle::wait`].
#[derive(Debug, Clone)]
pub struct PreloadHandle {
    id: ToolId,
    promise: Promise<LoadResult>,
}

impl PreloadHandle {
    fn resolved(id: ToolId, result: LoadResult) -> Self {
        Self {
            id,
            promise: Promise::resolved(result),
        }
    }

    /// Identifier being loaded
    pub fn id(&self) -> &ToolId {
        &self.id
    }

    /// Wait for the load to settle
    pub async fn wait(&self) -> LoadResult {
        match self.promise.wait().await {
            Some(result) => result,
            None => Err(PreloadError::Abandoned(self.id.clone())),
        }
    }

    /// Whether the load has settled
    pub fn is_settled(&self) -> bool {
        self.promise.is_settled()
    }

    /// Whether both handles share one in-flight load
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.promise.ptr_eq(&other.promise)
    }
}

impl IntoFuture for PreloadHandle {
    type Output = LoadResult;
    type IntoFuture = BoxFuture<'static, LoadResult>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

/// Preload statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreloadStats {
    /// Successful loads
    pub preloaded_modules: u64,
    /// Requests served without running a loader
    pub hits: u64,
    /// Missing loaders and failed loads
    pub misses: u64,
    /// Cumulative load time of successful loads
    pub total_load_time: Duration,
    /// Mean load time of successful loads
    pub average_load_time: Duration,
}

impl PreloadStats {
    fn record_load(&mut self, elapsed: Duration) {
        self.preloaded_modules += 1;
        self.total_load_time += elapsed;
        self.average_load_time = Duration::from_secs_f64(
            self.total_load_time.as_secs_f64() / self.preloaded_modules as f64,
        );
    }

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

/// Point-in-time view of the loader's sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStatus {
    /// Ids loaded successfully
    pub loaded: usize,
    /// Ids whose loader is running
    pub loading: usize,
    /// Ids waiting in the queue
    pub queued: usize,
    /// Occupied concurrency slots
    pub active: usize,
}

struct InFlight {
    promise: Promise<LoadResult>,
    /// Taken when the task leaves the queue
    deferred: Option<Deferred<LoadResult>>,
}

#[derive(Default)]
struct LoaderState {
    queue: PriorityQueue,
    in_flight: HashMap<ToolId, InFlight>,
    loading: HashSet<ToolId>,
    loaded: HashSet<ToolId>,
    active: usize,
    /// Bumped by `clear`; completions from older generations leave the sets alone
    generation: u64,
    stats: PreloadStats,
}

struct Inner {
    config: LoaderConfig,
    registry: Arc<dyn ToolRegistry>,
    modules: Option<Arc<TtlCache<ToolId, Module>>>,
    state: Mutex<LoaderState>,
}

/// Bounded-concurrency, priority-ordered module preloader
///
/// Cheap to clone; clones share state. Methods that start loads spawn onto
/// the current tokio runtime.
#[derive(Clone)]
pub struct Preloader {
    inner: Arc<Inner>,
}

impl Preloader {
    /// Create a new preloader
    pub fn new(config: LoaderConfig, registry: Arc<dyn ToolRegistry>) -> Self {
        let modules = config
            .cache_modules
            .then(|| Arc::new(TtlCache::new(config.cache.clone())));

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                modules,
                state: Mutex::new(LoaderState::default()),
            }),
        }
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Identifier registry
    pub fn registry(&self) -> &Arc<dyn ToolRegistry> {
        &self.inner.registry
    }

    /// Request a load
    ///
    /// Already loaded ids resolve immediately and count as a hit. Ids in
    /// flight return the existing handle; a queued task is upgraded if
    /// `priority` is higher.
    pub fn preload(&self, id: impl Into<ToolId>, priority: Priority) -> PreloadHandle {
        let id = id.into();

        let handle = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            if state.loaded.contains(&id) {
                state.stats.hits += 1;
                return PreloadHandle::resolved(id, Ok(LoadOutcome::AlreadyLoaded));
            }

            if let Some(in_flight) = state.in_flight.get(&id) {
                let promise = in_flight.promise.clone();
                if state.queue.contains(id.as_str()) {
                    state.queue.push(id.clone(), priority);
                }
                return PreloadHandle { id, promise };
            }

            let (deferred, promise) = deferred();
            state.in_flight.insert(
                id.clone(),
                InFlight {
                    promise: promise.clone(),
                    deferred: Some(deferred),
                },
            );
            state.queue.push(id.clone(), priority);
            debug!("Queued '{}' at {} priority", id, priority);

            PreloadHandle { id, promise }
        };

        self.drain();
        handle
    }

    /// Request loads for many ids and wait for all of them to settle
    ///
    /// Requests are issued before this returns; the future only joins them.
    /// One failure never affects the others.
    pub fn preload_batch<I>(
        &self,
        ids: I,
        priority: Priority,
    ) -> impl Future<Output = Vec<LoadResult>> + Send + 'static
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        let handles: Vec<PreloadHandle> = ids
            .into_iter()
            .map(|id| self.preload(id, priority))
            .collect();

        async move { join_all(handles.iter().map(PreloadHandle::wait)).await }
    }

    /// Start queued work until every slot is taken or the queue is empty
    fn drain(&self) {
        let limit = self.inner.config.concurrency_limit.max(1);

        loop {
            let (id, deferred, generation) = {
                let mut guard = lock(&self.inner.state);
                let state = &mut *guard;

                if state.active >= limit {
                    return;
                }
                let Some(task) = state.queue.pop() else {
                    return;
                };

                let deferred = state
                    .in_flight
                    .get_mut(&task.id)
                    .and_then(|in_flight| in_flight.deferred.take());
                state.active += 1;

                (task.id, deferred, state.generation)
            };

            match deferred {
                Some(deferred) => self.start(id, deferred, generation),
                None => self.release_slot(),
            }
        }
    }

    fn start(&self, id: ToolId, deferred: Deferred<LoadResult>, generation: u64) {
        let Some(loader) = self.inner.registry.loader(&id) else {
            debug!("No loader registered for '{}'", id);
            self.settle_without_loading(&id, generation, false);
            deferred.settle(Ok(LoadOutcome::NoLoader));
            return;
        };

        if let Some(modules) = &self.inner.modules {
            if modules.get(&id).is_some() {
                debug!("Serving '{}' from module cache", id);
                self.settle_without_loading(&id, generation, true);
                deferred.settle(Ok(LoadOutcome::Cached));
                return;
            }
        }

        {
            let mut state = lock(&self.inner.state);
            if state.generation == generation {
                state.loading.insert(id.clone());
            }
        }

        // Invoked here, not inside the task, so the call is visible immediately
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| loader())) {
            Ok(future) => future,
            Err(_) => {
                let result = Err(PreloadError::LoaderFailed {
                    id: id.clone(),
                    message: "loader panicked".into(),
                });
                self.complete(id, generation, deferred, result, Duration::ZERO);
                return;
            }
        };
        let timeout = self.inner.config.load_timeout_ms;
        let this = self.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let guarded = AssertUnwindSafe(future).catch_unwind();

            let result = match timeout {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), guarded).await {
                    Ok(outcome) => flatten_outcome(&id, outcome),
                    Err(_) => Err(PreloadError::Timeout {
                        id: id.clone(),
                        timeout_ms: ms,
                    }),
                },
                None => flatten_outcome(&id, guarded.await),
            };

            this.complete(id, generation, deferred, result, started.elapsed());
            this.drain();
        });
    }

    /// Release a slot for a task that never ran a loader
    fn settle_without_loading(&self, id: &ToolId, generation: u64, cached: bool) {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;

        state.active = state.active.saturating_sub(1);
        if state.generation != generation {
            return;
        }

        state.in_flight.remove(id);
        if cached {
            state.loaded.insert(id.clone());
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
    }

    fn release_slot(&self) {
        let mut state = lock(&self.inner.state);
        state.active = state.active.saturating_sub(1);
    }

    fn complete(
        &self,
        id: ToolId,
        generation: u64,
        deferred: Deferred<LoadResult>,
        result: Result<Module>,
        elapsed: Duration,
    ) {
        {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            state.active = state.active.saturating_sub(1);

            if state.generation == generation {
                state.loading.remove(&id);
                state.in_flight.remove(&id);
                match &result {
                    Ok(module) => {
                        state.loaded.insert(id.clone());
                        state.stats.record_load(elapsed);
                        // `clear` empties the cache under this same lock
                        if let Some(modules) = &self.inner.modules {
                            modules.set(id.clone(), module.clone(), None);
                        }
                    }
                    Err(_) => state.stats.misses += 1,
                }
            }
        }

        match result {
            Ok(_) => {
                debug!("Loaded '{}' in {:?}", id, elapsed);
                deferred.settle(Ok(LoadOutcome::Loaded));
            }
            Err(e) => {
                warn!("Preload of '{}' failed: {}", id, e);
                deferred.settle(Err(e));
            }
        }
    }

    /// Whether the id loaded successfully
    pub fn is_loaded(&self, id: &str) -> bool {
        lock(&self.inner.state).loaded.contains(id)
    }

    /// Whether the id's loader is running
    pub fn is_loading(&self, id: &str) -> bool {
        lock(&self.inner.state).loading.contains(id)
    }

    /// Whether the id is waiting in the queue
    pub fn is_queued(&self, id: &str) -> bool {
        lock(&self.inner.state).queue.contains(id)
    }

    /// Loaded module, if still cached
    pub fn module(&self, id: &str) -> Option<Module> {
        self.inner.modules.as_ref()?.get(&ToolId::from(id))
    }

    /// Module cache, when enabled
    pub fn module_cache(&self) -> Option<&Arc<TtlCache<ToolId, Module>>> {
        self.inner.modules.as_ref()
    }

    /// Get preload statistics
    pub fn stats(&self) -> PreloadStats {
        lock(&self.inner.state).stats.clone()
    }

    /// Get module cache statistics
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.modules.as_ref().map(|modules| modules.stats())
    }

    /// Sizes of the loader's sets
    pub fn status(&self) -> LoaderStatus {
        let state = lock(&self.inner.state);
        LoaderStatus {
            loaded: state.loaded.len(),
            loading: state.loading.len(),
            queued: state.queue.len(),
            active: state.active,
        }
    }

    /// Zero the statistics; loaded and queued state is untouched
    pub fn reset_stats(&self) {
        lock(&self.inner.state).stats = PreloadStats::default();
    }

    /// Drop `id` from the loaded set, keeping any cached module
    ///
    /// The next request for `id` is served from the module cache while the
    /// entry lives, and runs the loader again once it has expired. Returns
    /// whether the id was loaded.
    pub fn forget(&self, id: &str) -> bool {
        let removed = lock(&self.inner.state).loaded.remove(id);
        if removed {
            debug!("Forgot loaded '{}'", id);
        }
        removed
    }

    /// Forget everything: queue, loaded/loading sets, cache, statistics
    ///
    /// Callers awaiting a queued id get [`PreloadError::Abandoned`]. Loads
    /// already running settle their own awaiters but no longer mark the id
    /// loaded.
    pub fn clear(&self) {
        let abandoned = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;

            state.generation += 1;
            state.queue.drain();
            state.loading.clear();
            state.loaded.clear();
            state.stats = PreloadStats::default();
            if let Some(modules) = &self.inner.modules {
                modules.clear();
                modules.reset_stats();
            }
            std::mem::take(&mut state.in_flight)
        };

        let count = abandoned.len();
        drop(abandoned);

        debug!("Cleared preloader ({} pending dropped)", count);
    }
}

fn flatten_outcome(
    id: &ToolId,
    outcome: std::thread::Result<std::result::Result<Module, crate::BoxError>>,
) -> Result<Module> {
    match outcome {
        Ok(Ok(module)) => Ok(module),
        Ok(Err(e)) => Err(PreloadError::LoaderFailed {
            id: id.clone(),
            message: e.to_string(),
        }),
        Err(_) => Err(PreloadError::LoaderFailed {
            id: id.clone(),
            message: "loader panicked".into(),
        }),
    }
}
