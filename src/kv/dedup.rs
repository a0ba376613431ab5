//! Request deduplication.
//!
//! A proposal that is retried after a timeout can be committed twice. The
//! table remembers the outcome of the most recent requests by id so that a
//! duplicate is answered from the record instead of being applied again.
//! The table is part of the snapshot, and eviction is FIFO in apply order,
//! so every member evicts the same ids.

use super::request::{ApplyOutcome, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupTable {
    capacity: usize,
    order: VecDeque<RequestId>,
    results: HashMap<RequestId, ApplyOutcome>,
}

impl DedupTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            results: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &RequestId) -> Option<&ApplyOutcome> {
        self.results.get(id)
    }

    pub fn record(&mut self, id: RequestId, outcome: ApplyOutcome) {
        if self.results.insert(id, outcome).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.results.remove(&evicted);
            }
        }
    }
}
