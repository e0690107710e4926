//! Per-node processing overhead accumulated over an epoch.
//!
//! Each contact a node makes costs a little more than the last: real nodes
//! slow down under load. `get` returns the overhead currently owed by a
//! node and then bumps it by `gamma` for the next caller; `reset_*` starts
//! a fresh epoch.

use fnv::FnvHashMap;

use crate::kbucket::NodeId;

#[derive(Debug)]
pub struct OverheadTracker {
    gamma: f64,
    accumulated: FnvHashMap<NodeId, f64>,
}

impl OverheadTracker {
    pub fn new(gamma: f64) -> Self {
        OverheadTracker {
            gamma,
            accumulated: FnvHashMap::default(),
        }
    }

    /// Current overhead owed by `node`, then increments it by `gamma` for
    /// the next call. First access in an epoch always returns `0.0`.
    pub fn get(&mut self, node: NodeId) -> f64 {
        let entry = self.accumulated.entry(node).or_insert(0.0);
        let current = *entry;
        *entry += self.gamma;
        current
    }

    pub fn reset_node(&mut self, node: NodeId) {
        self.accumulated.remove(&node);
    }

    pub fn reset_all(&mut self) {
        self.accumulated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_access_is_free() {
        let mut tracker = OverheadTracker::new(1.5);
        assert_eq!(tracker.get(1), 0.0);
    }

    #[test]
    fn overhead_grows_by_gamma_each_access() {
        let mut tracker = OverheadTracker::new(2.0);
        assert_eq!(tracker.get(1), 0.0);
        assert_eq!(tracker.get(1), 2.0);
        assert_eq!(tracker.get(1), 4.0);
    }

    #[test]
    fn nodes_accumulate_independently() {
        let mut tracker = OverheadTracker::new(1.0);
        tracker.get(1);
        assert_eq!(tracker.get(2), 0.0);
    }

    #[test]
    fn reset_node_clears_only_that_node() {
        let mut tracker = OverheadTracker::new(1.0);
        tracker.get(1);
        tracker.get(2);
        tracker.reset_node(1);
        assert_eq!(tracker.get(1), 0.0);
        assert_eq!(tracker.get(2), 1.0);
    }

    #[test]
    fn reset_all_clears_every_node() {
        let mut tracker = OverheadTracker::new(1.0);
        tracker.get(1);
        tracker.get(2);
        tracker.reset_all();
        assert_eq!(tracker.get(1), 0.0);
        assert_eq!(tracker.get(2), 0.0);
    }
}
