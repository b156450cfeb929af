//! Usage counts and the tool association graph

use crate::{lock, KeyValueStore, MemoryStore, Result, ToolId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Usage tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Store key for usage counts
    #[serde(default = "default_usage_key")]
    pub usage_key: String,
    /// Store key for the association matrix
    #[serde(default = "default_association_key")]
    pub association_key: String,
    /// Cap on outgoing edges per tool; unbounded when unset
    #[serde(default)]
    pub max_edges_per_tool: Option<usize>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            usage_key: default_usage_key(),
            association_key: default_association_key(),
            max_edges_per_tool: None,
        }
    }
}

fn default_usage_key() -> String {
    "preload_usage".to_string()
}

fn default_association_key() -> String {
    "preload_assoc".to_string()
}

/// Outgoing edges of one tool, in first-seen order
pub type Edges = IndexMap<ToolId, u64>;

/// Copy of the tracker's state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Uses per tool
    pub counts: HashMap<ToolId, u64>,
    /// Weighted "A then B" edges
    pub associations: HashMap<ToolId, Edges>,
    /// Most recently used tool
    pub last_used: Option<ToolId>,
}

impl UsageSnapshot {
    /// Total recorded uses
    pub fn total_uses(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Total number of edges
    pub fn edge_count(&self) -> usize {
        self.associations.values().map(IndexMap::len).sum()
    }
}

#[derive(Default)]
struct UsageState {
    counts: HashMap<ToolId, u64>,
    associations: HashMap<ToolId, Edges>,
    last_used: Option<ToolId>,
}

/// Tracks what is used and what tends to follow what
///
/// Counts and edges are written through to the store after every recorded
/// use. Store and JSON failures are logged and otherwise ignored.
pub struct UsageTracker {
    config: UsageConfig,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<UsageState>,
    /// Held from serialization until both writes land
    persist: Mutex<()>,
}

impl UsageTracker {
    /// Create a tracker, restoring any state persisted in `store`
    pub fn new(config: UsageConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let tracker = Self {
            config,
            store,
            state: Mutex::new(UsageState::default()),
            persist: Mutex::new(()),
        };
        tracker.restore();
        tracker
    }

    /// Tracker backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(UsageConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn restore(&self) {
        let counts: Option<HashMap<ToolId, u64>> = self.read_json(&self.config.usage_key);
        let associations: Option<HashMap<ToolId, Edges>> =
            self.read_json(&self.config.association_key);

        let mut state = lock(&self.state);
        if let Some(counts) = counts {
            state.counts = counts;
        }
        if let Some(associations) = associations {
            state.associations = associations;
        }

        if !state.counts.is_empty() || !state.associations.is_empty() {
            info!(
                "Restored usage history: {} tools, {} sources",
                state.counts.len(),
                state.associations.len()
            );
        }
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get_item(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read '{}': {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt '{}': {}", key, e);
                None
            }
        }
    }

    /// Record a use of `id`
    ///
    /// Strengthens the edge from the previously used tool, if different.
    pub fn record_usage(&self, id: impl Into<ToolId>) {
        let id = id.into();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            *state.counts.entry(id.clone()).or_default() += 1;

            if let Some(previous) = state.last_used.take() {
                if previous != id {
                    let edges = state.associations.entry(previous).or_default();
                    *edges.entry(id.clone()).or_default() += 1;
                    cap_edges(edges, &id, self.config.max_edges_per_tool);
                }
            }

            state.last_used = Some(id);
        }

        self.persist_quietly();
    }

    /// Strengthen `from -> to` edges by `weight`
    pub fn add_associations<I>(&self, from: impl Into<ToolId>, tos: I, weight: u64)
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        let from = from.into();
        {
            let mut state = lock(&self.state);
            let edges = state.associations.entry(from).or_default();
            for to in tos {
                let to = to.into();
                *edges.entry(to.clone()).or_default() += weight;
                cap_edges(edges, &to, self.config.max_edges_per_tool);
            }
        }

        self.persist_quietly();
    }

    /// Add domain-knowledge edges that are not already known
    ///
    /// Existing weights are left alone so restarts do not inflate them.
    pub fn seed_associations<I>(&self, from: impl Into<ToolId>, tos: I, weight: u64)
    where
        I: IntoIterator,
        I::Item: Into<ToolId>,
    {
        let mut state = lock(&self.state);
        let edges = state.associations.entry(from.into()).or_default();
        for to in tos {
            edges.entry(to.into()).or_insert(weight);
        }
    }

    /// The `top_n` strongest successors of `from`, strongest first
    ///
    /// Equal weights keep first-seen order.
    pub fn predict_related(&self, from: &str, top_n: usize) -> Vec<ToolId> {
        let state = lock(&self.state);
        let Some(edges) = state.associations.get(from) else {
            return Vec::new();
        };

        let mut ranked: Vec<(&ToolId, u64)> = edges.iter().map(|(to, w)| (to, *w)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
            .into_iter()
            .take(top_n)
            .map(|(to, _)| to.clone())
            .collect()
    }

    /// Recorded uses of `id`
    pub fn usage_count(&self, id: &str) -> u64 {
        lock(&self.state).counts.get(id).copied().unwrap_or(0)
    }

    /// Weight of the `from -> to` edge
    pub fn edge_weight(&self, from: &str, to: &str) -> u64 {
        lock(&self.state)
            .associations
            .get(from)
            .and_then(|edges| edges.get(to))
            .copied()
            .unwrap_or(0)
    }

    /// Most recently used tool
    pub fn last_used(&self) -> Option<ToolId> {
        lock(&self.state).last_used.clone()
    }

    /// Composite relevance of `id` given the last used tool
    pub fn composite_score(&self, id: &str, usage_weight: f64, association_weight: f64) -> f64 {
        let state = lock(&self.state);
        let usage = state.counts.get(id).copied().unwrap_or(0) as f64;
        let association = state
            .last_used
            .as_ref()
            .and_then(|last| state.associations.get(last))
            .and_then(|edges| edges.get(id))
            .copied()
            .unwrap_or(0) as f64;

        usage * usage_weight + association * association_weight
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> UsageSnapshot {
        let state = lock(&self.state);
        UsageSnapshot {
            counts: state.counts.clone(),
            associations: state.associations.clone(),
            last_used: state.last_used.clone(),
        }
    }

    /// Write counts and edges to the store
    pub fn persist(&self) -> Result<()> {
        let _persist = lock(&self.persist);
        let (counts, associations) = {
            let state = lock(&self.state);
            (
                serde_json::to_string(&state.counts)?,
                serde_json::to_string(&state.associations)?,
            )
        };

        self.store.set_item(&self.config.usage_key, &counts)?;
        self.store.set_item(&self.config.association_key, &associations)?;
        Ok(())
    }

    fn persist_quietly(&self) {
        if let Err(e) = self.persist() {
            warn!("Failed to persist usage history: {}", e);
        }
    }

    /// Drop all history, in memory and in the store
    pub fn forget(&self) {
        let _persist = lock(&self.persist);
        *lock(&self.state) = UsageState::default();

        for key in [&self.config.usage_key, &self.config.association_key] {
            if let Err(e) = self.store.remove_item(key) {
                warn!("Failed to remove '{}': {}", key, e);
            }
        }
        debug!("Usage history cleared");
    }
}

/// Drop the weakest edges (oldest first among equals) above `cap`, never `keep`
fn cap_edges(edges: &mut Edges, keep: &ToolId, cap: Option<usize>) {
    let Some(cap) = cap else {
        return;
    };

    while edges.len() > cap.max(1) {
        let weakest = edges
            .iter()
            .enumerate()
            .filter(|(_, (to, _))| *to != keep)
            .min_by_key(|(_, (_, weight))| **weight)
            .map(|(index, _)| index);

        match weakest {
            Some(index) => {
                edges.shift_remove_index(index);
            }
            None => break,
        }
    }
}
