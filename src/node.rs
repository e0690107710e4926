//! The DHT client: a handle bound to one arena-owned node, providing
//! bootstrap, iterative lookup, provide, and retrieve.

use std::collections::HashSet;

use log::{debug, info, trace};

use crate::error::DhtError;
use crate::hash::{Distance, Hash};
use crate::kbucket::NodeId;
use crate::network::{now_unix_seconds, Network, NodeParams};

/// A non-owning handle to one node living in a [`Network`]'s arena. Cheap
/// to copy around; all state is addressed through `network` by `id`.
#[derive(Clone, Copy)]
pub struct Node<'net> {
    id: NodeId,
    network: &'net Network,
}

/// `§4.5` summary of one `lookup_for_hash` call.
#[derive(Debug, Clone)]
pub struct LookupSummary {
    pub start_time: f64,
    pub finish_time: f64,
    pub target_key: Hash,
    pub connection_attempts: u64,
    pub connection_finished: u64,
    pub successful_cons: u64,
    pub failed_cons: u64,
    pub total_nodes: usize,
    pub aggr_delay: f64,
    pub value: Option<String>,
    pub accuracy: Option<u8>,
}

/// Result of one lookup: the closest peers found (truncated to β), the
/// summary record, and the aggregated delay repeated for convenience.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub closest: Vec<(NodeId, Distance)>,
    pub summary: LookupSummary,
}

/// `§4.5` summary of one `provide_block_segment` call.
#[derive(Debug, Clone)]
pub struct ProvideSummary {
    pub start_time: f64,
    pub finish_time: f64,
    pub success_node_ids: Vec<NodeId>,
    pub failed_node_ids: Vec<NodeId>,
    pub aggr_delay: f64,
}

/// One in-flight lookup result, queued until a concurrency slot drains it.
struct SlotEntry {
    delay: f64,
    new_peers: Vec<(NodeId, Distance)>,
    value: String,
}

impl<'net> Node<'net> {
    /// Registers a new node in `network` and returns a handle to it.
    pub fn new(
        id: NodeId,
        network: &'net Network,
        params: NodeParams,
    ) -> Result<Self, DhtError> {
        network.add_new_node(id, params)?;
        Ok(Node { id, network })
    }

    /// Wraps an already-registered node id in a handle.
    pub fn handle(id: NodeId, network: &'net Network) -> Self {
        Node { id, network }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn hash(&self) -> Hash {
        self.network.node_hash(self.id)
    }

    fn params(&self) -> NodeParams {
        self.network.node_params(self.id)
    }

    /// Builds this node's routing table by offering it every other
    /// registered peer. Returns the routing table's textual summary.
    pub fn bootstrap(&self) -> String {
        info!("node {} bootstrapping", self.id);
        self.network.bootstrap_node(self.id);
        self.network.routing_summary(self.id)
    }

    pub fn routing_summary(&self) -> String {
        self.network.routing_summary(self.id)
    }

    pub fn get_routing_nodes(&self) -> Vec<NodeId> {
        self.network.routing_nodes(self.id)
    }

    /// Server-side endpoint a [`crate::network::Connection`] forwards to:
    /// this node's `closest_to(key)` plus whatever it has stored for it.
    pub fn get_closest_nodes_to(&self, key: Hash) -> (Vec<(NodeId, Distance)>, String, bool) {
        let closest = self.network.local_closest(self.id, key, None);
        let (value, present) = self.network.local_store_read(self.id, key);
        (closest, value, present)
    }

    pub fn store_segment(&self, segment: &str) {
        let key = Hash::of_bytes(segment.as_bytes());
        self.network.local_store_add(self.id, key, segment.to_string());
    }

    pub fn retrieve_segment(&self, key: Hash) -> (String, bool) {
        self.network.local_store_read(self.id, key)
    }

    /// Deletes a locally stored segment, if present.
    pub fn forget_segment(&self, key: Hash) -> Option<String> {
        self.network.local_store_remove(self.id, key)
    }

    /// The iterative α-parallel, β-terminating lookup of `§4.5`.
    pub fn lookup_for_hash(
        &self,
        key: Hash,
        track_accuracy: bool,
        first_value: bool,
    ) -> LookupResult {
        let params = self.params();
        let start_time = now_unix_seconds();

        let mut closest: Vec<(NodeId, Distance)> = self.network.local_closest(self.id, key, None);
        let mut to_try: Vec<(NodeId, Distance)> = closest.clone();
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut slots: Vec<SlotEntry> = Vec::new();
        let mut slot_delays = vec![0.0_f64; params.alpha];
        let mut stale: u32 = 0;
        let mut value = String::new();

        let mut connection_attempts = 0u64;
        let mut connection_finished = 0u64;
        let mut successful_cons = 0u64;
        let mut failed_cons = 0u64;

        'outer: loop {
            if stale >= params.stale_limit
                || to_try.is_empty()
                || (first_value && !value.is_empty())
            {
                break 'outer;
            }

            while !to_try.is_empty() {
                let (p, _dist) = to_try.remove(0);
                if tried.contains(&p) {
                    continue;
                }
                tried.insert(p);
                connection_attempts += 1;

                let entry = match self.network.connect(self.id, p) {
                    Ok(conn) => {
                        let (new_peers, value_maybe, _rpc_delay) = conn.get_closest_nodes_to(key);
                        let combined_delay = conn.base_delay() + conn.total_delay();
                        trace!(
                            "lookup {}: contacted {} ok, {} new peers, delay={}",
                            self.id,
                            p,
                            new_peers.len(),
                            combined_delay
                        );
                        SlotEntry {
                            delay: combined_delay,
                            new_peers,
                            value: value_maybe,
                        }
                    }
                    Err(err) => {
                        trace!("lookup {}: contact {} failed ({:?})", self.id, p, err.kind);
                        SlotEntry {
                            delay: 2.0 * err.delay + err.origin_overhead + err.remote_overhead,
                            new_peers: Vec::new(),
                            value: String::new(),
                        }
                    }
                };
                let insert_at = slots
                    .iter()
                    .position(|s| s.delay > entry.delay)
                    .unwrap_or(slots.len());
                slots.insert(insert_at, entry);

                if slots.len() >= params.alpha {
                    let drained = slots.remove(0);
                    let slot_idx = slot_delays
                        .iter()
                        .enumerate()
                        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                        .map(|(idx, _)| idx)
                        .unwrap_or(0);
                    slot_delays[slot_idx] += drained.delay;

                    if !drained.value.is_empty() {
                        value = drained.value.clone();
                    }
                    connection_finished += 1;
                    if !drained.new_peers.is_empty() {
                        successful_cons += 1;
                    } else {
                        failed_cons += 1;
                    }

                    if !drained.new_peers.is_empty() {
                        if has_closer_nodes(&closest, &drained.new_peers) {
                            stale = 0;
                        } else {
                            stale += 1;
                        }
                    }

                    merge_unique(&mut closest, &drained.new_peers);
                    merge_unique(&mut to_try, &drained.new_peers);
                    to_try.sort_by_key(|(_, d)| *d);

                    break;
                }

                if stale >= params.stale_limit {
                    break;
                }
            }
        }

        let aggr_delay = slot_delays.iter().cloned().fold(0.0_f64, f64::max);
        closest.sort_by_key(|(_, d)| *d);
        let total_nodes = closest.len();
        closest.truncate(params.beta);

        let accuracy = if track_accuracy {
            let oracle = self.network.get_closest_nodes_to_hash(key, params.beta);
            let oracle_ids: HashSet<NodeId> = oracle.iter().map(|(id, _)| *id).collect();
            let hits = closest.iter().filter(|(id, _)| oracle_ids.contains(id)).count();
            Some(((hits * 100) / params.beta.max(1)) as u8)
        } else {
            None
        };

        debug!(
            "lookup {} for {} terminated: attempts={} finished={} success={} fail={} stale={}",
            self.id, key, connection_attempts, connection_finished, successful_cons, failed_cons, stale
        );

        LookupResult {
            closest,
            summary: LookupSummary {
                start_time,
                finish_time: now_unix_seconds(),
                target_key: key,
                connection_attempts,
                connection_finished,
                successful_cons,
                failed_cons,
                total_nodes,
                aggr_delay,
                value: if value.is_empty() { None } else { Some(value) },
                accuracy,
            },
        }
    }

    /// Looks up `segment`'s key, then asks every peer in the closest set
    /// to store it.
    pub fn provide_block_segment(&self, segment: &str) -> ProvideSummary {
        let key = Hash::of_bytes(segment.as_bytes());
        let start_time = now_unix_seconds();
        let lookup = self.lookup_for_hash(key, false, false);

        let mut success_node_ids = Vec::new();
        let mut failed_node_ids = Vec::new();
        let mut max_contact_delay = 0.0_f64;

        for (peer, _) in &lookup.closest {
            match self.network.connect(self.id, *peer) {
                Ok(conn) => {
                    let conn_delay = conn.base_delay();
                    let store_delay = conn.store_segment(key, segment);
                    let total = conn_delay + store_delay;
                    if total > max_contact_delay {
                        max_contact_delay = total;
                    }
                    success_node_ids.push(*peer);
                }
                Err(_) => failed_node_ids.push(*peer),
            }
        }

        ProvideSummary {
            start_time,
            finish_time: now_unix_seconds(),
            success_node_ids,
            failed_node_ids,
            aggr_delay: lookup.summary.aggr_delay + max_contact_delay,
        }
    }

    /// Looks up `key` with `first_value = true`: the first contact whose
    /// response carries a non-empty value short-circuits the lookup.
    pub fn retrieve(&self, key: Hash) -> LookupResult {
        self.lookup_for_hash(key, false, true)
    }
}

/// True iff some peer in `new_peers` is not already in `closest` and is
/// strictly closer than some peer already in `closest`.
fn has_closer_nodes(closest: &[(NodeId, Distance)], new_peers: &[(NodeId, Distance)]) -> bool {
    if closest.is_empty() {
        return false;
    }
    let known: HashSet<NodeId> = closest.iter().map(|(id, _)| *id).collect();
    new_peers.iter().any(|(id, dist)| {
        !known.contains(id) && closest.iter().any(|(_, known_dist)| dist < known_dist)
    })
}

/// Appends entries from `incoming` into `target` that are not already
/// present by id.
fn merge_unique(target: &mut Vec<(NodeId, Distance)>, incoming: &[(NodeId, Distance)]) {
    let known: HashSet<NodeId> = target.iter().map(|(id, _)| *id).collect();
    for (id, dist) in incoming {
        if !known.contains(id) {
            target.push((*id, *dist));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;

    fn params(k: usize, alpha: usize, beta: usize, stale_limit: u32) -> NodeParams {
        NodeParams { k, alpha, beta, stale_limit }
    }

    #[test]
    fn lookup_over_error_free_network_returns_k_peers() {
        let net = Network::new(NetworkConfig::new(0));
        let p = params(10, 1, 10, 4);
        net.init_with_random_peers(1, 500, p).unwrap();
        let node = Node::handle(0, &net);
        let key = Hash::of_bytes(b"this is a simple segment of code");
        let result = node.lookup_for_hash(key, false, false);
        assert_eq!(result.closest.len(), 10);

        let oracle = net.get_closest_nodes_to_hash(key, 10);
        let oracle_ids: HashSet<NodeId> = oracle.iter().map(|(id, _)| *id).collect();
        for (id, _) in &result.closest {
            assert!(oracle_ids.contains(id), "peer {} not in global closest set", id);
        }
    }

    #[test]
    fn provide_then_retrieve_round_trips_the_payload() {
        let net = Network::new(NetworkConfig::new(0));
        let p = params(10, 1, 10, 4);
        net.init_with_random_peers(1, 500, p).unwrap();
        let provider = Node::handle(0, &net);
        let retriever = Node::handle(1, &net);

        let segment = "this is a simple segment of code";
        provider.provide_block_segment(segment);

        let key = Hash::of_bytes(segment.as_bytes());
        let result = retriever.retrieve(key);
        assert_eq!(result.summary.value.as_deref(), Some(segment));
    }

    #[test]
    fn stale_limit_eventually_terminates_the_lookup() {
        let net = Network::new(NetworkConfig::new(0));
        let p = params(1, 1, 1, 3);
        net.init_with_random_peers(1, 2, p).unwrap();
        let node = Node::handle(0, &net);
        let key = Hash::of_id(12345);
        let result = node.lookup_for_hash(key, false, false);
        assert!(result.closest.len() <= 1);
    }
}
