//! Visibility and hover triggers

use crate::{Preloader, Priority, ToolId};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Observer registration id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callback run on each emission
pub type ObserverCallback = Arc<dyn Fn() + Send + Sync>;

/// Something that can be watched for an event, such as an element entering
/// the viewport or a pointer entering it
pub trait Observable: Send + Sync {
    /// Start calling `callback` on each event
    fn observe(&self, callback: ObserverCallback) -> ObserverId;

    /// Stop calling the callback registered as `id`
    fn unobserve(&self, id: ObserverId);
}

/// In-process observable that hosts bridge their events into
#[derive(Default)]
pub struct TriggerSource {
    next_id: AtomicU64,
    observers: DashMap<ObserverId, ObserverCallback>,
}

impl TriggerSource {
    /// Create a source with no observers
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event; returns how many observers ran
    ///
    /// Callbacks that preload must run inside a tokio runtime.
    pub fn emit(&self) -> usize {
        let callbacks: Vec<ObserverCallback> =
            self.observers.iter().map(|entry| entry.value().clone()).collect();

        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    /// Number of attached observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Observable for TriggerSource {
    fn observe(&self, callback: ObserverCallback) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.insert(id, callback);
        id
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(&id);
    }
}

impl fmt::Debug for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerSource")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Attached trigger; detaches when dropped
#[must_use = "dropping the guard detaches the trigger"]
pub struct TriggerGuard {
    target: Arc<dyn Observable>,
    observer: ObserverId,
}

impl TriggerGuard {
    /// Registration id on the target
    pub fn observer(&self) -> ObserverId {
        self.observer
    }
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        self.target.unobserve(self.observer);
    }
}

impl fmt::Debug for TriggerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerGuard")
            .field("observer", &self.observer)
            .finish()
    }
}

/// Preload `id` at low priority the first time `target` fires
pub fn preload_on_visible(
    preloader: &Preloader,
    target: Arc<dyn Observable>,
    id: impl Into<ToolId>,
) -> TriggerGuard {
    let id = id.into();
    let preloader = preloader.clone();
    let fired = AtomicBool::new(false);

    let observer = target.observe(Arc::new(move || {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("'{}' became visible", id);
        // The handle is dropped; the load runs regardless
        let _ = preloader.preload(id.clone(), Priority::Low);
    }));

    TriggerGuard { target, observer }
}

/// Preload `id` at high priority whenever `target` fires
pub fn preload_on_hover(
    preloader: &Preloader,
    target: Arc<dyn Observable>,
    id: impl Into<ToolId>,
) -> TriggerGuard {
    let id = id.into();
    let preloader = preloader.clone();

    let observer = target.observe(Arc::new(move || {
        let _ = preloader.preload(id.clone(), Priority::High);
    }));

    TriggerGuard { target, observer }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{loader_fn, LoaderConfig, Module, StaticRegistry};
    use std::sync::atomic::AtomicUsize;

    fn counted(id: &str) -> (Preloader, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = StaticRegistry::new().with_loader(
            id,
            loader_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Arc::new(()) as Module) }
            }),
        );
        (
            Preloader::new(LoaderConfig::default(), Arc::new(registry)),
            calls,
        )
    }

    #[test]
    fn test_source_observe_and_unobserve() {
        let source = TriggerSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let id = source.observe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(source.emit(), 1);

        source.unobserve(id);
        assert_eq!(source.emit(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_visible_preloads_once() {
        let (preloader, calls) = counted("mermaid-editor");
        let source = Arc::new(TriggerSource::new());

        let _guard = preload_on_visible(&preloader, source.clone(), "mermaid-editor");
        source.emit();
        source.emit();

        preloader.preload("mermaid-editor", Priority::Low).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(preloader.is_loaded("mermaid-editor"));
    }

    #[tokio::test]
    async fn test_hover_preloads_at_high() {
        let (preloader, calls) = counted("table-sorter");
        let source = Arc::new(TriggerSource::new());

        let _guard = preload_on_hover(&preloader, source.clone(), "table-sorter");
        source.emit();

        preloader.preload("table-sorter", Priority::High).await.unwrap();
        source.emit();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(preloader.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_dropping_guard_detaches() {
        let (preloader, calls) = counted("hash-generator");
        let source = Arc::new(TriggerSource::new());

        let guard = preload_on_hover(&preloader, source.clone(), "hash-generator");
        assert_eq!(source.observer_count(), 1);

        drop(guard);
        assert_eq!(source.observer_count(), 0);
        assert_eq!(source.emit(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
