//! Routing of external events to waiting orchestrator code.
//!
//! Each event name has a stack of waiters and a FIFO buffer of payloads that
//! arrived while nobody was waiting. An arriving event goes to the most
//! recently registered live waiter; a new waiter first drains the oldest
//! buffered payload. For a given name at most one of the two is non-empty.
//!
//! Names compare case-insensitively.

use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct Buffered {
    name: String,
    payload: String,
}

#[derive(Debug)]
pub struct EventDispatcher<W> {
    waiters: HashMap<String, Vec<W>>,
    buffered: HashMap<String, VecDeque<Buffered>>,
}

impl<W> Default for EventDispatcher<W> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
            buffered: HashMap::new(),
        }
    }
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

impl<W: PartialEq> EventDispatcher<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Returns the oldest buffered payload instead when one
    /// is available, in which case the waiter is not pushed.
    pub fn register(&mut self, name: &str, waiter: W) -> Option<String> {
        let key = key(name);
        if let Some(queue) = self.buffered.get_mut(&key) {
            if let Some(entry) = queue.pop_front() {
                if queue.is_empty() {
                    self.buffered.remove(&key);
                }
                return Some(entry.payload);
            }
        }
        self.waiters.entry(key).or_default().push(waiter);
        None
    }

    /// Deliver an event. Waiters for which `is_active` returns false are
    /// discarded on the way down the stack. Returns the matched waiter, or
    /// `None` when the payload was buffered.
    pub fn raise(&mut self, name: &str, payload: String, mut is_active: impl FnMut(&W) -> bool) -> Option<(W, String)> {
        let key = key(name);
        if let Some(stack) = self.waiters.get_mut(&key) {
            while let Some(waiter) = stack.pop() {
                if is_active(&waiter) {
                    if stack.is_empty() {
                        self.waiters.remove(&key);
                    }
                    return Some((waiter, payload));
                }
            }
            self.waiters.remove(&key);
        }
        self.buffered.entry(key).or_default().push_back(Buffered {
            name: name.to_string(),
            payload,
        });
        None
    }

    /// Remove a specific waiter, e.g. after cancellation. Returns whether it was present.
    pub fn remove(&mut self, name: &str, waiter: &W) -> bool {
        let key = key(name);
        let Some(stack) = self.waiters.get_mut(&key) else {
            return false;
        };
        let before = stack.len();
        stack.retain(|w| w != waiter);
        let removed = stack.len() != before;
        if stack.is_empty() {
            self.waiters.remove(&key);
        }
        removed
    }

    pub fn waiter_count(&self, name: &str) -> usize {
        self.waiters.get(&key(name)).map_or(0, Vec::len)
    }

    pub fn buffered_count(&self, name: &str) -> usize {
        self.buffered.get(&key(name)).map_or(0, VecDeque::len)
    }

    /// Take every buffered `(name, payload)` pair, oldest first within a name.
    ///
    /// Names are returned in sorted order so the result is deterministic.
    pub fn drain_buffered(&mut self) -> Vec<(String, String)> {
        let mut keys: Vec<String> = self.buffered.keys().cloned().collect();
        keys.sort();
        let mut out = Vec::new();
        for k in keys {
            if let Some(queue) = self.buffered.remove(&k) {
                out.extend(queue.into_iter().map(|b| (b.name, b.payload)));
            }
        }
        out
    }
}
