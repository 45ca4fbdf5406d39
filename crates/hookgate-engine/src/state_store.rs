//! Bounded per-session state
//!
//! Each stateful hook owns one of these. The map holds at most `capacity`
//! sessions; inserting past that evicts the session that was inserted
//! first, so a long-lived host process cannot grow it without bound.

use std::collections::{HashMap, VecDeque};

/// Session-keyed map with insertion-order eviction
#[derive(Debug)]
pub struct BoundedSessionMap<V> {
    capacity: usize,
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> BoundedSessionMap<V> {
    /// Create a map holding at most `capacity` sessions (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&V> {
        self.entries.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut V> {
        self.entries.get_mut(session_id)
    }

    /// Entry for `session_id`, creating it with `init` (and evicting) if new
    pub fn get_or_insert_with<F>(&mut self, session_id: &str, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        if !self.entries.contains_key(session_id) {
            while self.entries.len() >= self.capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        tracing::debug!("Evicting session state for {}", oldest);
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.order.push_back(session_id.to_string());
        }
        self.entries
            .entry(session_id.to_string())
            .or_insert_with(init)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<V> {
        let removed = self.entries.remove(session_id);
        if removed.is_some() {
            self.order.retain(|id| id != session_id);
        }
        removed
    }
}

impl<V: Default> BoundedSessionMap<V> {
    /// Entry for `session_id`, default-initialised if new
    pub fn entry(&mut self, session_id: &str) -> &mut V {
        self.get_or_insert_with(session_id, V::default)
    }
}

/// Whether `cooldown` tool calls have passed since `last` (always true if never)
pub(crate) fn cooled_down(last: Option<u64>, now: u64, cooldown: u64) -> bool {
    last.map_or(true, |at| now.saturating_sub(at) >= cooldown)
}
