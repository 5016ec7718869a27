//! Bounded event buffer for attached sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of events kept per resource.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// An event observed on an attached session (for example a debugger event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Event name, e.g. `Runtime.consoleAPICalled`.
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
            recorded_at: Utc::now(),
        }
    }
}

/// Fixed-capacity FIFO buffer; pushing past capacity silently drops the
/// oldest entries.
#[derive(Debug, Clone)]
pub struct EventRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> EventRing<T> {
    /// Creates an empty ring. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    /// Drops everything except the newest `keep` entries.
    pub fn retain_last(&mut self, keep: usize) {
        while self.entries.len() > keep {
            self.entries.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries evicted over the ring's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn newest(&self) -> Option<&T> {
        self.entries.back()
    }
}

impl<T: Clone> EventRing<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<T> Default for EventRing<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut ring = EventRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
        assert_eq!(ring.dropped(), 2);
        assert_eq!(ring.newest(), Some(&4));
    }

    #[test]
    fn test_retain_last_keeps_newest() {
        let mut ring = EventRing::new(10);
        for i in 0..8 {
            ring.push(i);
        }
        ring.retain_last(3);
        assert_eq!(ring.to_vec(), vec![5, 6, 7]);

        ring.retain_last(10);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut ring = EventRing::new(0);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.to_vec(), vec!["b"]);
    }

    #[test]
    fn test_recorded_event_roundtrip_fields() {
        let event = RecordedEvent::new("Page.loadEventFired", serde_json::json!({"ts": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["method"], "Page.loadEventFired");
        assert_eq!(json["params"]["ts"], 1);
    }
}
