//! A single Kademlia bucket: the closest `capacity` peers sharing a given
//! prefix length with the owner, ordered by nothing but xor distance.
//!
//! Unlike `libp2p`'s liveness-aware buckets (ping-before-evict, pending
//! replacement slot), this bucket is pure distance bookkeeping for a
//! simulator: no node is ever "stale" or "disconnected", so the only
//! question on insert is whether the newcomer is closer to the owner than
//! the current worst occupant.

use crate::hash::{Distance, Hash};

pub type NodeId = u64;

/// Fixed-capacity set of the closest-known peers at one prefix length.
#[derive(Debug, Clone)]
pub struct KBucket {
    capacity: usize,
    owner: Hash,
    entries: Vec<(NodeId, Hash)>,
}

impl KBucket {
    pub fn new(capacity: usize, owner: Hash) -> Self {
        KBucket {
            capacity,
            owner,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offers a peer to the bucket. If there is free capacity the peer is
    /// always accepted. Otherwise it replaces the current farthest-from-owner
    /// occupant only if it is strictly closer; ties keep the incumbent.
    /// Returns whether the peer ended up in the bucket.
    pub fn insert(&mut self, peer_id: NodeId, peer_hash: Hash) -> bool {
        if self.entries.iter().any(|(id, _)| *id == peer_id) {
            return true;
        }
        if self.entries.len() < self.capacity {
            self.entries.push((peer_id, peer_hash));
            return true;
        }
        let peer_distance = self.owner.xor(peer_hash);
        let (worst_idx, worst_distance) = self.farthest();
        if peer_distance >= worst_distance {
            return false;
        }
        self.entries[worst_idx] = (peer_id, peer_hash);
        true
    }

    /// Index and distance-to-owner of the current farthest occupant. The
    /// earliest such occupant wins ties, so eviction is deterministic.
    fn farthest(&self) -> (usize, Distance) {
        let mut worst_idx = 0;
        let mut worst_distance = self.owner.xor(self.entries[0].1);
        for (idx, (_, hash)) in self.entries.iter().enumerate().skip(1) {
            let distance = self.owner.xor(*hash);
            if distance > worst_distance {
                worst_idx = idx;
                worst_distance = distance;
            }
        }
        (worst_idx, worst_distance)
    }

    /// Distances from every occupant to an arbitrary key (not necessarily
    /// the owner).
    pub fn distances_to(&self, key: Hash) -> Vec<(NodeId, Distance)> {
        self.entries
            .iter()
            .map(|(id, hash)| (*id, hash.xor(key)))
            .collect()
    }

    pub fn bucket_nodes(&self) -> Vec<NodeId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: usize) -> KBucket {
        KBucket::new(capacity, Hash::of_id(0))
    }

    #[test]
    fn fills_up_to_capacity() {
        let mut b = bucket(2);
        assert!(b.insert(1, Hash::of_id(1)));
        assert!(b.insert(2, Hash::of_id(2)));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn rejects_farther_peer_once_full() {
        let owner = Hash::of_id(0);
        let mut b = KBucket::new(1, owner);
        // find two ids with distinguishable distances to id 0
        let mut candidates: Vec<u64> = (1..200).collect();
        candidates.sort_by_key(|id| owner.xor(Hash::of_id(*id)));
        let (closer, farther) = (candidates[0], candidates[candidates.len() - 1]);

        assert!(b.insert(closer, Hash::of_id(closer)));
        assert!(!b.insert(farther, Hash::of_id(farther)));
        assert_eq!(b.bucket_nodes(), vec![closer]);
    }

    #[test]
    fn evicts_farthest_for_a_closer_newcomer() {
        let owner = Hash::of_id(0);
        let mut b = KBucket::new(1, owner);
        let mut candidates: Vec<u64> = (1..200).collect();
        candidates.sort_by_key(|id| owner.xor(Hash::of_id(*id)));
        let (closer, farther) = (candidates[0], candidates[candidates.len() - 1]);

        assert!(b.insert(farther, Hash::of_id(farther)));
        assert!(b.insert(closer, Hash::of_id(closer)));
        assert_eq!(b.bucket_nodes(), vec![closer]);
    }

    #[test]
    fn reinserting_known_peer_is_a_noop() {
        let mut b = bucket(1);
        assert!(b.insert(1, Hash::of_id(1)));
        assert!(b.insert(1, Hash::of_id(1)));
        assert_eq!(b.len(), 1);
    }
}
