//! Registry of call ids that were already terminally handled on this device.
//!
//! Consulted before an inbound offer is surfaced so that a redelivered
//! offer or hangup snapshot cannot reopen a call the local party already
//! disposed of.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::models::CallId;

/// Default number of call ids remembered before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded insertion-ordered set of processed call ids.
#[derive(Debug)]
pub struct DeduplicationRegistry {
    order: VecDeque<CallId>,
    ids: HashSet<CallId>,
    capacity: usize,
}

/// Registry shared between the orchestrator and the signaling channel.
pub type SharedRegistry = Arc<Mutex<DeduplicationRegistry>>;

impl DeduplicationRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Record `call_id` as processed. Returns false if it already was.
    ///
    /// Once over capacity the oldest entries are dropped.
    pub fn mark_processed(&mut self, call_id: &CallId) -> bool {
        if !self.ids.insert(call_id.clone()) {
            return false;
        }
        self.order.push_back(call_id.clone());
        self.clear_if_oversized(self.capacity);
        true
    }

    pub fn is_processed(&self, call_id: &CallId) -> bool {
        self.ids.contains(call_id)
    }

    /// Evict oldest entries until at most `threshold` remain.
    ///
    /// Returns the number of evicted ids.
    pub fn clear_if_oversized(&mut self, threshold: usize) -> usize {
        let mut evicted = 0;
        while self.order.len() > threshold {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(
                "Dedup registry evicted {} call ids ({} remain)",
                evicted,
                self.order.len()
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DeduplicationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Lock helpers that recover from poisoning instead of panicking.
pub trait RegistryExt {
    fn mark_processed(&self, call_id: &CallId) -> bool;
    fn is_processed(&self, call_id: &CallId) -> bool;
}

impl RegistryExt for SharedRegistry {
    fn mark_processed(&self, call_id: &CallId) -> bool {
        let mut guard = self.lock().unwrap_or_else(|e| e.into_inner());
        guard.mark_processed(call_id)
    }

    fn is_processed(&self, call_id: &CallId) -> bool {
        let guard = self.lock().unwrap_or_else(|e| e.into_inner());
        guard.is_processed(call_id)
    }
}
