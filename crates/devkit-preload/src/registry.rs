//! Tool identifiers and the loader registry collaborator

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Opaque tool identifier (a tool's unique slug)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(String);

impl ToolId {
    /// Create a new identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ToolId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ToolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ToolId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ToolId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ToolId> for ToolId {
    fn from(id: &ToolId) -> Self {
        id.clone()
    }
}

/// A loaded module. Opaque to the preloader.
pub type Module = Arc<dyn Any + Send + Sync>;

/// Error returned by a loader function
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future produced by a loader function
pub type LoadFuture = BoxFuture<'static, std::result::Result<Module, BoxError>>;

/// A loader function for one identifier
pub type LoaderFn = Arc<dyn Fn() -> LoadFuture + Send + Sync>;

/// Wrap an async closure as a [`LoaderFn`]
pub fn loader_fn<F, Fut>(f: F) -> LoaderFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Module, BoxError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Trait for resolving identifiers to loader functions
pub trait ToolRegistry: Send + Sync {
    /// Whether the identifier names a known tool
    fn has_tool(&self, id: &ToolId) -> bool;

    /// Loader function for the identifier
    fn loader(&self, id: &ToolId) -> Option<LoaderFn>;
}

/// In-memory registry backed by a concurrent map
#[derive(Default)]
pub struct StaticRegistry {
    loaders: DashMap<ToolId, LoaderFn>,
}

impl StaticRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loader, replacing any previous one
    pub fn insert(&self, id: impl Into<ToolId>, loader: LoaderFn) {
        self.loaders.insert(id.into(), loader);
    }

    /// Builder-style insert
    pub fn with_loader(self, id: impl Into<ToolId>, loader: LoaderFn) -> Self {
        self.insert(id, loader);
        self
    }

    /// Remove a loader
    pub fn remove(&self, id: &str) -> Option<LoaderFn> {
        self.loaders.remove(id).map(|(_, loader)| loader)
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl ToolRegistry for StaticRegistry {
    fn has_tool(&self, id: &ToolId) -> bool {
        self.loaders.contains_key(id)
    }

    fn loader(&self, id: &ToolId) -> Option<LoaderFn> {
        self.loaders.get(id).map(|entry| entry.value().clone())
    }
}
