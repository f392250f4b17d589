//! Sliding-window index of publisher-supplied message ids.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::{Seq, UnixMillis};

/// Maps msg id -> assigned sequence inside a bounded time window.
/// Lookup is O(1); eviction walks the insertion-ordered queue.
#[derive(Debug, Default)]
pub struct DedupIndex {
    map: HashMap<String, (Seq, UnixMillis)>,
    order: VecDeque<(UnixMillis, String)>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, msg_id: &str) -> Option<Seq> {
        self.map.get(msg_id).map(|(seq, _)| *seq)
    }

    pub fn record(&mut self, msg_id: &str, seq: Seq, now: UnixMillis) {
        if self.map.contains_key(msg_id) {
            return;
        }
        self.map.insert(msg_id.to_string(), (seq, now));
        self.order.push_back((now, msg_id.to_string()));
    }

    pub fn evict_older_than(&mut self, cutoff: UnixMillis) -> usize {
        let mut evicted = 0;
        while let Some((ts, _)) = self.order.front() {
            if *ts >= cutoff {
                break;
            }
            let (_, id) = self.order.pop_front().expect("front checked");
            self.map.remove(&id);
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}
