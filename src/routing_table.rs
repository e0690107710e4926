//! Per-node routing table: a sequence of [`KBucket`]s indexed by shared
//! prefix length with the owner, created lazily as peers at deeper prefixes
//! are discovered.

use std::fmt::Write as _;

use fnv::FnvHashMap;

use crate::hash::{Distance, Hash};
use crate::kbucket::{KBucket, NodeId};

pub struct RoutingTable {
    owner_id: NodeId,
    owner_hash: Hash,
    capacity: usize,
    buckets: Vec<KBucket>,
    insertion_seq: FnvHashMap<NodeId, u64>,
    next_seq: u64,
}

impl RoutingTable {
    pub fn new(owner_id: NodeId, owner_hash: Hash, capacity: usize) -> Self {
        RoutingTable {
            owner_id,
            owner_hash,
            capacity,
            buckets: Vec::new(),
            insertion_seq: FnvHashMap::default(),
            next_seq: 0,
        }
    }

    pub fn owner_hash(&self) -> Hash {
        self.owner_hash
    }

    /// Offers a peer for inclusion. A no-op for the owner itself. Creates
    /// any intermediate buckets needed to reach the peer's prefix length.
    pub fn offer(&mut self, peer_id: NodeId, peer_hash: Hash) {
        if peer_id == self.owner_id {
            return;
        }
        let shared_bits = self.owner_hash.shared_upper_bits(peer_hash) as usize;
        while self.buckets.len() <= shared_bits {
            self.buckets
                .push(KBucket::new(self.capacity, self.owner_hash));
        }
        let inserted = self.buckets[shared_bits].insert(peer_id, peer_hash);
        if inserted && !self.insertion_seq.contains_key(&peer_id) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.insertion_seq.insert(peer_id, seq);
        }
    }

    /// The `limit` (or bucket capacity, if `None`) closest known peers to
    /// `key`, ordered by ascending distance with insertion order breaking
    /// ties.
    pub fn closest_to(&self, key: Hash, limit: Option<usize>) -> Vec<(NodeId, Distance)> {
        let limit = limit.unwrap_or(self.capacity);
        let mut candidates: Vec<(NodeId, Distance)> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.distances_to(key))
            .collect();
        candidates.sort_by(|a, b| {
            a.1.cmp(&b.1).then_with(|| {
                let seq_a = self.insertion_seq.get(&a.0).copied().unwrap_or(u64::MAX);
                let seq_b = self.insertion_seq.get(&b.0).copied().unwrap_or(u64::MAX);
                seq_a.cmp(&seq_b)
            })
        });
        candidates.truncate(limit);
        candidates
    }

    pub fn get_routing_nodes(&self) -> Vec<NodeId> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.bucket_nodes())
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Human-readable `b0:n0 b1:n1 ...` summary of occupancy per bucket.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            let _ = write!(s, "b{}:{} ", i, bucket.len());
        }
        s.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offering_self_is_ignored() {
        let owner = Hash::of_id(0);
        let mut rt = RoutingTable::new(0, owner, 4);
        rt.offer(0, owner);
        assert_eq!(rt.bucket_count(), 0);
    }

    #[test]
    fn creates_intermediate_buckets() {
        let owner_id = 0u64;
        let owner = Hash::of_id(owner_id);
        let mut rt = RoutingTable::new(owner_id, owner, 4);
        // a peer whose hash shares many leading bits forces deep buckets to exist
        let deepest_peer = (1..5000)
            .map(|id| (id, owner.shared_upper_bits(Hash::of_id(id))))
            .max_by_key(|(_, bits)| *bits)
            .unwrap();
        rt.offer(deepest_peer.0, Hash::of_id(deepest_peer.0));
        assert_eq!(rt.bucket_count(), deepest_peer.1 as usize + 1);
    }

    #[test]
    fn closest_to_is_sorted_ascending() {
        let owner_id = 0u64;
        let owner = Hash::of_id(owner_id);
        let mut rt = RoutingTable::new(owner_id, owner, 20);
        for id in 1..100u64 {
            rt.offer(id, Hash::of_id(id));
        }
        let key = Hash::of_id(12345);
        let closest = rt.closest_to(key, None);
        for pair in closest.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
        assert!(closest.len() <= 20);
    }

    #[test]
    fn summary_format_matches_bucket_per_line() {
        let owner_id = 0u64;
        let owner = Hash::of_id(owner_id);
        let mut rt = RoutingTable::new(owner_id, owner, 4);
        rt.offer(1, Hash::of_id(1));
        let summary = rt.summary();
        assert!(summary.starts_with("b0:"));
    }
}
