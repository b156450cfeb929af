//! Priority queue for pending preloads

use crate::ToolId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Priority level for a preload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// User-critical, drained first
    High,
    /// Standard priority
    #[default]
    Medium,
    /// Background prefetch
    Low,
}

impl Priority {
    /// Drain weight (lower = drained first)
    pub fn weight(&self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Medium => 5,
            Priority::Low => 10,
        }
    }

    /// Lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower weight = higher priority, so reverse the comparison
        other.weight().cmp(&self.weight())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending unit of work
#[derive(Debug, Clone)]
pub struct QueueTask {
    /// Identifier to load
    pub id: ToolId,
    /// Priority level
    pub priority: Priority,
    /// Enqueue sequence, preserves FIFO among equal priorities
    seq: u64,
}

impl QueueTask {
    /// Enqueue sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl PartialEq for QueueTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueueTask {}

impl PartialOrd for QueueTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then earlier seq
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending preload queue, at most one task per identifier
///
/// Not internally synchronized; the loader owns it behind its state lock.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueTask>,
    pending: HashMap<ToolId, Priority>,
    next_seq: u64,
}

impl PriorityQueue {
    /// Create a new priority queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task, merging with an already queued one for the same id
    ///
    /// Returns `true` if a new task was queued. A duplicate keeps the higher
    /// of the two priorities and its original position among equals.
    pub fn push(&mut self, id: ToolId, priority: Priority) -> bool {
        if let Some(&queued) = self.pending.get(&id) {
            if priority > queued {
                self.update_priority(&id, priority);
            }
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(id.clone(), priority);
        self.heap.push(QueueTask { id, priority, seq });
        true
    }

    /// Pop the highest priority task
    pub fn pop(&mut self) -> Option<QueueTask> {
        let task = self.heap.pop()?;
        self.pending.remove(&task.id);
        Some(task)
    }

    /// Peek at the highest priority task
    pub fn peek(&self) -> Option<&QueueTask> {
        self.heap.peek()
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Check if an id is queued
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Priority an id is queued at
    pub fn priority_of(&self, id: &str) -> Option<Priority> {
        self.pending.get(id).copied()
    }

    /// Remove every queued task, returning their ids
    pub fn drain(&mut self) -> Vec<ToolId> {
        self.pending.clear();
        self.heap.drain().map(|task| task.id).collect()
    }

    /// Update priority of a queued id
    fn update_priority(&mut self, id: &ToolId, new_priority: Priority) {
        // Remove and re-add with new priority
        let items: Vec<_> = self.heap.drain().collect();
        for mut item in items {
            if item.id == *id {
                item.priority = new_priority;
            }
            self.heap.push(item);
        }
        self.pending.insert(id.clone(), new_priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let mut queue = PriorityQueue::new();

        queue.push("low".into(), Priority::Low);
        queue.push("high".into(), Priority::High);
        queue.push("medium".into(), Priority::Medium);

        assert_eq!(queue.pop().unwrap().priority, Priority::High);
        assert_eq!(queue.pop().unwrap().priority, Priority::Medium);
        assert_eq!(queue.pop().unwrap().priority, Priority::Low);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_among_equal_priority() {
        let mut queue = PriorityQueue::new();

        for id in ["a", "b", "c"] {
            queue.push(id.into(), Priority::Medium);
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_keeps_higher_priority() {
        let mut queue = PriorityQueue::new();

        assert!(queue.push("json-formatter".into(), Priority::Low));
        assert!(!queue.push("json-formatter".into(), Priority::High));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.priority_of("json-formatter"), Some(Priority::High));

        // A lower duplicate never downgrades
        assert!(!queue.push("json-formatter".into(), Priority::Low));
        assert_eq!(queue.priority_of("json-formatter"), Some(Priority::High));
    }

    #[test]
    fn test_upgrade_jumps_ahead() {
        let mut queue = PriorityQueue::new();

        queue.push("first".into(), Priority::Medium);
        queue.push("second".into(), Priority::Low);
        queue.push("second".into(), Priority::High);

        assert_eq!(queue.pop().unwrap().id.as_str(), "second");
        assert_eq!(queue.pop().unwrap().id.as_str(), "first");
    }

    #[test]
    fn test_drain_clears_pending() {
        let mut queue = PriorityQueue::new();
        queue.push("a".into(), Priority::High);
        queue.push("b".into(), Priority::Low);

        let mut drained = queue.drain();
        drained.sort();
        assert_eq!(drained, vec![ToolId::from("a"), ToolId::from("b")]);
        assert!(queue.is_empty());
        assert!(!queue.contains("a"));
    }

    #[test]
    fn test_priority_serde_lowercase() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"high\"");
        let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }
}
