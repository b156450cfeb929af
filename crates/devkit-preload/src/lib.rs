//! Priority-Scheduled Module Preloading for Developer Tools
//!
//! This crate decides which tool modules to fetch ahead of use, and when:
//!
//! - **Bounded Loading**: At most N loads in flight, drained by priority
//! - **Shared Handles**: One load per tool no matter how many callers ask
//! - **Staggered Batches**: High now, medium and low after fixed delays
//! - **Prediction**: Usage counts and "A then B" edges, persisted
//! - **Network Gate**: No background prefetch on slow or metered links
//! - **Module Cache**: TTL-bounded cache beneath the loader
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       PreloadManager                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐      │
//! │  │    Usage     │ -> │  Priority    │ -> │  Preloader   │      │
//! │  │   Tracker    │    │  Scheduler   │    │ (N in flight)│      │
//! │  └──────────────┘    └──────────────┘    └──────────────┘      │
//! │         ↓                    ↑                   ↓              │
//! │  ┌──────────────┐     Network gate +      ┌──────────────┐      │
//! │  │  Key-Value   │      idle timer         │  TtlCache    │      │
//! │  │    Store     │                         │  (modules)   │      │
//! │  └──────────────┘                         └──────────────┘      │
//! │                                                  ↓              │
//! │   Routes / visibility / hover ──────────> ToolRegistry loader   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use devkit_preload::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> devkit_preload::Result<()> {
//! let registry = StaticRegistry::new().with_loader(
//!     "json-formatter",
//!     loader_fn(|| async { Ok(Arc::new("formatter") as Module) }),
//! );
//! let manager = PreloadManager::new(Arc::new(registry))?;
//!
//! manager.record_usage("json-formatter");
//! manager.preload("json-formatter", Priority::High).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

mod cache;
mod config;
pub mod deferred;
mod error;
mod idle;
mod loader;
mod manager;
mod network;
mod priority;
mod registry;
mod routes;
mod scheduler;
mod store;
mod telemetry;
mod triggers;
mod usage;

pub use cache::{CacheConfig, CacheEntry, CacheStats, CleanupSubscription, TtlCache};
pub use config::{DynamicPriorityConfig, ManagerConfig, SeedAssociation};
pub use error::{PreloadError, Result};
pub use idle::{IdleScheduler, TimerIdle, YieldIdle};
pub use loader::{
    LoadOutcome, LoadResult, LoaderConfig, LoaderStatus, PreloadHandle, PreloadStats, Preloader,
};
pub use manager::{global, install_global, ManagerStats, PreloadManager, PreloadManagerBuilder};
pub use network::{ConnectionInfo, EffectiveType, NetworkInfo, NetworkPolicy, UnknownNetwork, WatchedNetwork};
pub use priority::{Priority, PriorityQueue, QueueTask};
pub use registry::{
    loader_fn, BoxError, LoadFuture, LoaderFn, Module, StaticRegistry, ToolId, ToolRegistry,
};
pub use routes::{RouteConfig, RoutePrefetcher};
pub use scheduler::{
    CommonTool, Condition, PreloadConfig, PriorityBatches, PriorityScheduler, SchedulerConfig,
};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use telemetry::{init_tracing, parse_level};
pub use triggers::{
    preload_on_hover, preload_on_visible, Observable, ObserverCallback, ObserverId, TriggerGuard,
    TriggerSource,
};
pub use usage::{Edges, UsageConfig, UsageSnapshot, UsageTracker};

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        loader_fn, ManagerConfig, Module, PreloadConfig, PreloadError, PreloadHandle,
        PreloadManager, Priority, Result, StaticRegistry, ToolId, ToolRegistry,
    };
}

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
