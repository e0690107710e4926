//! The simulated fabric: node registry, synthetic delay/error injection,
//! per-node overhead, and the parallel bulk initializer.

use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::DhtError;
use crate::hash::{Distance, Hash};
use crate::kbucket::NodeId;
use crate::overhead::OverheadTracker;
use crate::routing_table::RoutingTable;
use crate::store::KeyValueStore;

/// Tunables for a single simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    network_id: u64,
    fast_error_rate: u8,
    slow_error_rate: u8,
    conn_delay_range: Option<Range<u64>>,
    fast_delay_range: Option<Range<u64>>,
    slow_delay_range: Option<Range<u64>>,
    gamma_overhead: f64,
}

impl NetworkConfig {
    /// A network with every rate and range at its zero default.
    pub fn new(network_id: u64) -> Self {
        NetworkConfig {
            network_id,
            fast_error_rate: 0,
            slow_error_rate: 0,
            conn_delay_range: None,
            fast_delay_range: None,
            slow_delay_range: None,
            gamma_overhead: 0.0,
        }
    }

    pub fn fast_error_rate(mut self, rate: u8) -> Result<Self, DhtError> {
        if rate > 99 {
            return Err(DhtError::InvalidErrorRate(rate));
        }
        self.fast_error_rate = rate;
        Ok(self)
    }

    pub fn slow_error_rate(mut self, rate: u8) -> Result<Self, DhtError> {
        if rate > 99 {
            return Err(DhtError::InvalidErrorRate(rate));
        }
        self.slow_error_rate = rate;
        Ok(self)
    }

    pub fn conn_delay_range(mut self, range: Range<u64>) -> Self {
        self.conn_delay_range = Some(range);
        self
    }

    pub fn fast_delay_range(mut self, range: Range<u64>) -> Self {
        self.fast_delay_range = Some(range);
        self
    }

    pub fn slow_delay_range(mut self, range: Range<u64>) -> Self {
        self.slow_delay_range = Some(range);
        self
    }

    pub fn gamma_overhead(mut self, gamma: f64) -> Self {
        self.gamma_overhead = gamma;
        self
    }
}

/// Which of the two failure classes a `connect` attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fast,
    Slow,
    NodeNotFound,
}

/// A data record, never a propagated exception: the lookup engine treats
/// these as finished contacts with an empty peer set.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    /// Raw sampled delay for this failure class (single leg).
    pub delay: f64,
    /// Overhead `connect` fetched for the origin at the time of this
    /// attempt. Exposed so callers don't have to read it again themselves.
    pub origin_overhead: f64,
    /// Overhead `connect` fetched for the target at the time of this
    /// attempt.
    pub remote_overhead: f64,
}

/// One entry in the network's connection or error trace.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRecord {
    pub conn_id: u64,
    pub time: u64,
    pub origin: NodeId,
    pub target: NodeId,
    pub error: Option<ErrorKind>,
    pub base_delay: f64,
    pub origin_overhead: f64,
    pub remote_overhead: f64,
}

impl ConnectionRecord {
    pub fn total_overhead(&self) -> f64 {
        self.origin_overhead + self.remote_overhead
    }

    /// Single-leg total: base delay plus both sides' overhead.
    pub fn total_delay(&self) -> f64 {
        self.base_delay + self.total_overhead()
    }
}

/// A live, successfully established contact with `target`. Forwards the
/// three RPC-like operations a lookup or provide/retrieve call may need.
pub struct Connection<'net> {
    network: &'net Network,
    target: NodeId,
    base_delay: f64,
    origin_overhead: f64,
    remote_overhead: f64,
}

impl<'net> std::fmt::Debug for Connection<'net> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("base_delay", &self.base_delay)
            .field("origin_overhead", &self.origin_overhead)
            .field("remote_overhead", &self.remote_overhead)
            .finish()
    }
}

impl<'net> Connection<'net> {
    /// Raw sampled connect delay, with no overhead folded in.
    pub fn base_delay(&self) -> f64 {
        self.base_delay
    }

    /// Overhead `connect` fetched for the origin when this contact was
    /// established. Fetched exactly once, here; callers should not query
    /// the tracker again for the same contact.
    pub fn origin_overhead(&self) -> f64 {
        self.origin_overhead
    }

    /// Overhead `connect` fetched for the target when this contact was
    /// established.
    pub fn remote_overhead(&self) -> f64 {
        self.remote_overhead
    }

    /// Single-leg total delay: base delay plus both sides' overhead. This
    /// is what each forwarded RPC call below reports as its own cost.
    pub fn total_delay(&self) -> f64 {
        self.base_delay + self.origin_overhead + self.remote_overhead
    }

    /// `target`'s `closest_to(key)` plus whatever it has stored for `key`.
    pub fn get_closest_nodes_to(&self, key: Hash) -> (Vec<(NodeId, Distance)>, String, f64) {
        let closest = self.network.local_closest(self.target, key, None);
        let (value, present) = self.network.local_store_read(self.target, key);
        let value = if present { value } else { String::new() };
        (closest, value, self.total_delay())
    }

    pub fn store_segment(&self, key: Hash, segment: &str) -> f64 {
        self.network
            .local_store_add(self.target, key, segment.to_string());
        self.total_delay()
    }

    pub fn retrieve_segment(&self, key: Hash) -> (String, bool, f64) {
        let (value, present) = self.network.local_store_read(self.target, key);
        (value, present, self.total_delay())
    }
}

/// Bundle of lookup-control parameters a node is configured with.
#[derive(Debug, Clone, Copy)]
pub struct NodeParams {
    pub k: usize,
    pub alpha: usize,
    pub beta: usize,
    pub stale_limit: u32,
}

impl NodeParams {
    pub fn validate(&self) -> Result<(), DhtError> {
        if self.alpha == 0 {
            return Err(DhtError::InvalidAlpha);
        }
        if self.beta == 0 {
            return Err(DhtError::InvalidBeta);
        }
        if self.k == 0 {
            return Err(DhtError::InvalidBucketCapacity);
        }
        Ok(())
    }
}

pub(crate) struct NodeState {
    pub(crate) hash: Hash,
    pub(crate) params: NodeParams,
    pub(crate) routing_table: RoutingTable,
    pub(crate) store: KeyValueStore,
}

/// `{total_nodes, attempts, successful, failures}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSummary {
    pub total_nodes: usize,
    pub attempts: u64,
    pub successful: u64,
    pub failures: u64,
}

/// The arena owning every node's mutable state, plus the shared fabric
/// machinery (traces, overhead tracker, connection counter).
pub struct Network {
    config: NetworkConfig,
    nodes: RefCell<FnvHashMap<NodeId, NodeState>>,
    overhead: RefCell<OverheadTracker>,
    connection_trace: RefCell<Vec<ConnectionRecord>>,
    error_trace: RefCell<Vec<ConnectionRecord>>,
    conn_counter: Cell<u64>,
    rng: RefCell<StdRng>,
}

impl Network {
    pub fn new(config: NetworkConfig) -> Self {
        info!(
            "constructing network {} (fast_err={}%, slow_err={}%, gamma={})",
            config.network_id, config.fast_error_rate, config.slow_error_rate, config.gamma_overhead
        );
        let gamma = config.gamma_overhead;
        Network {
            config,
            nodes: RefCell::new(FnvHashMap::default()),
            overhead: RefCell::new(OverheadTracker::new(gamma)),
            connection_trace: RefCell::new(Vec::new()),
            error_trace: RefCell::new(Vec::new()),
            conn_counter: Cell::new(0),
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    pub fn network_id(&self) -> u64 {
        self.config.network_id
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.borrow().contains_key(&id)
    }

    /// Registers a new node, building an empty routing table and store for
    /// it. Errors if the id is already registered or the params are invalid.
    pub fn add_new_node(&self, id: NodeId, params: NodeParams) -> Result<(), DhtError> {
        params.validate()?;
        let mut nodes = self.nodes.borrow_mut();
        if nodes.contains_key(&id) {
            return Err(DhtError::DuplicateNode(id));
        }
        let hash = Hash::of_id(id);
        nodes.insert(
            id,
            NodeState {
                hash,
                params,
                routing_table: RoutingTable::new(id, hash, params.k),
                store: KeyValueStore::new(),
            },
        );
        trace!("registered node {} (hash={})", id, hash);
        Ok(())
    }

    pub(crate) fn node_hash(&self, id: NodeId) -> Hash {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.hash)
            .unwrap_or_else(|| Hash::of_id(id))
    }

    pub(crate) fn node_params(&self, id: NodeId) -> NodeParams {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.params)
            .expect("node id must be registered before use")
    }

    pub(crate) fn local_closest(
        &self,
        id: NodeId,
        key: Hash,
        limit: Option<usize>,
    ) -> Vec<(NodeId, Distance)> {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.routing_table.closest_to(key, limit))
            .unwrap_or_default()
    }

    pub(crate) fn local_store_read(&self, id: NodeId, key: Hash) -> (String, bool) {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.store.read(key))
            .unwrap_or_else(|| (String::new(), false))
    }

    pub(crate) fn local_store_add(&self, id: NodeId, key: Hash, value: String) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&id) {
            node.store.add(key, value);
        }
    }

    pub(crate) fn local_store_remove(&self, id: NodeId, key: Hash) -> Option<String> {
        self.nodes
            .borrow_mut()
            .get_mut(&id)
            .and_then(|n| n.store.remove(key))
    }

    pub(crate) fn offer_peer(&self, id: NodeId, peer_id: NodeId, peer_hash: Hash) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&id) {
            node.routing_table.offer(peer_id, peer_hash);
        }
    }

    pub(crate) fn routing_summary(&self, id: NodeId) -> String {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.routing_table.summary())
            .unwrap_or_default()
    }

    pub(crate) fn routing_nodes(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.routing_table.get_routing_nodes())
            .unwrap_or_default()
    }

    pub(crate) fn overhead_get(&self, id: NodeId) -> f64 {
        self.overhead.borrow_mut().get(id)
    }

    fn sample_range(&self, range: &Option<Range<u64>>) -> f64 {
        match range {
            None => 0.0,
            Some(r) if r.is_empty() => r.start as f64,
            Some(r) => self.rng.borrow_mut().gen_range(r.clone()) as f64,
        }
    }

    fn roll(&self) -> u8 {
        self.rng.borrow_mut().gen_range(0..100)
    }

    /// The `connect(origin, target)` protocol of §4.4: sequential error
    /// draws, then either a live `Connection` or a data-carried
    /// `ConnectionError`.
    pub fn connect(&self, origin: NodeId, target: NodeId) -> Result<Connection<'_>, ConnectionError> {
        let conn_id = self.conn_counter.get();
        self.conn_counter.set(conn_id + 1);

        let d_ok = self.sample_range(&self.config.conn_delay_range);
        let d_fast = self.sample_range(&self.config.fast_delay_range);
        let d_slow = self.sample_range(&self.config.slow_delay_range);

        let origin_overhead = self.overhead_get(origin);
        let remote_overhead = self.overhead_get(target);

        if self.roll() < self.config.fast_error_rate {
            debug!("connect {}->{} fast-failed", origin, target);
            return Err(self.record_error(
                conn_id,
                origin,
                target,
                ErrorKind::Fast,
                d_fast,
                origin_overhead,
                remote_overhead,
            ));
        }
        if self.roll() < self.config.slow_error_rate {
            debug!("connect {}->{} slow-failed", origin, target);
            return Err(self.record_error(
                conn_id,
                origin,
                target,
                ErrorKind::Slow,
                d_slow,
                origin_overhead,
                remote_overhead,
            ));
        }
        if !self.contains(target) {
            warn!("connect {}->{} target not found", origin, target);
            return Err(self.record_error(
                conn_id,
                origin,
                target,
                ErrorKind::NodeNotFound,
                d_slow,
                origin_overhead,
                remote_overhead,
            ));
        }

        let record = ConnectionRecord {
            conn_id,
            time: conn_id,
            origin,
            target,
            error: None,
            base_delay: d_ok,
            origin_overhead,
            remote_overhead,
        };
        self.connection_trace.borrow_mut().push(record);
        Ok(Connection {
            network: self,
            target,
            base_delay: d_ok,
            origin_overhead,
            remote_overhead,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record_error(
        &self,
        conn_id: u64,
        origin: NodeId,
        target: NodeId,
        kind: ErrorKind,
        delay: f64,
        origin_overhead: f64,
        remote_overhead: f64,
    ) -> ConnectionError {
        self.error_trace.borrow_mut().push(ConnectionRecord {
            conn_id,
            time: conn_id,
            origin,
            target,
            error: Some(kind),
            base_delay: delay,
            origin_overhead,
            remote_overhead,
        });
        ConnectionError {
            kind,
            delay,
            origin_overhead,
            remote_overhead,
        }
    }

    /// Reference path: builds `id`'s routing table by offering it every
    /// other registered peer, one at a time. Returns the flattened peer
    /// list afterwards.
    pub fn bootstrap_node(&self, id: NodeId) -> Vec<NodeId> {
        let peers: Vec<(NodeId, Hash)> = self
            .nodes
            .borrow()
            .iter()
            .filter(|(peer_id, _)| **peer_id != id)
            .map(|(peer_id, state)| (*peer_id, state.hash))
            .collect();
        for (peer_id, peer_hash) in peers {
            self.offer_peer(id, peer_id, peer_hash);
        }
        self.routing_nodes(id)
    }

    /// Fast path used by the bulk initializer: buckets `all_nodes` by
    /// shared-prefix length with `owner_hash` and keeps the k closest per
    /// bucket, without touching any shared mutable state.
    fn optimal_routing_table(
        owner_id: NodeId,
        owner_hash: Hash,
        params: NodeParams,
        all_nodes: &[(NodeId, Hash)],
    ) -> RoutingTable {
        let mut by_prefix: FnvHashMap<u32, Vec<(NodeId, Hash, Distance)>> = FnvHashMap::default();
        for (peer_id, peer_hash) in all_nodes {
            if *peer_id == owner_id {
                continue;
            }
            let prefix = owner_hash.shared_upper_bits(*peer_hash);
            let distance = owner_hash.xor(*peer_hash);
            by_prefix
                .entry(prefix)
                .or_default()
                .push((*peer_id, *peer_hash, distance));
        }
        let mut table = RoutingTable::new(owner_id, owner_hash, params.k);
        for bucket in by_prefix.values_mut() {
            bucket.sort_by_key(|(_, _, distance)| *distance);
            for (peer_id, peer_hash, _) in bucket.iter().take(params.k) {
                table.offer(*peer_id, *peer_hash);
            }
        }
        table
    }

    /// Generates `n` nodes with ids `0..n`, registers them, and computes
    /// every routing table via [`Self::optimal_routing_table`], distributed
    /// across `workers` worker units (sequentially if `workers <= 1`).
    pub fn init_with_random_peers(
        &self,
        workers: usize,
        n: usize,
        params: NodeParams,
    ) -> Result<(), DhtError> {
        params.validate()?;
        info!("bulk-initializing {} nodes across {} workers", n, workers);
        let all_nodes: Vec<(NodeId, Hash)> = (0..n as u64).map(|id| (id, Hash::of_id(id))).collect();

        for (id, _) in &all_nodes {
            self.add_new_node(*id, params)?;
        }

        let tables: Vec<(NodeId, RoutingTable)> = if workers <= 1 {
            all_nodes
                .iter()
                .map(|(id, hash)| (*id, Self::optimal_routing_table(*id, *hash, params, &all_nodes)))
                .collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .expect("failed to build worker pool");
            pool.install(|| {
                all_nodes
                    .par_iter()
                    .map(|(id, hash)| (*id, Self::optimal_routing_table(*id, *hash, params, &all_nodes)))
                    .collect()
            })
        };

        let mut nodes = self.nodes.borrow_mut();
        for (id, table) in tables {
            if let Some(node) = nodes.get_mut(&id) {
                node.routing_table = table;
            }
        }
        info!("bulk initialization finished");
        Ok(())
    }

    /// Oracle: the β globally-closest nodes to `key`, used only for
    /// accuracy measurement.
    pub fn get_closest_nodes_to_hash(&self, key: Hash, beta: usize) -> Vec<(NodeId, Distance)> {
        let nodes = self.nodes.borrow();
        let mut all: Vec<(NodeId, Distance)> = nodes
            .iter()
            .map(|(id, state)| (*id, state.hash.xor(key)))
            .collect();
        all.sort_by_key(|(_, distance)| *distance);
        all.truncate(beta);
        all
    }

    pub fn summary(&self) -> NetworkSummary {
        let connection_trace = self.connection_trace.borrow();
        let error_trace = self.error_trace.borrow();
        NetworkSummary {
            total_nodes: self.len(),
            attempts: (connection_trace.len() + error_trace.len()) as u64,
            successful: connection_trace.len() as u64,
            failures: error_trace.len() as u64,
        }
    }

    /// Concatenation of the connection and error traces, column-compatible
    /// with `{conn_id, time, from, to, error, base_delay, origin_overhead,
    /// remote_overhead, total_overhead, total_delay}`.
    pub fn connection_metrics(&self) -> Vec<ConnectionRecord> {
        let mut all = self.connection_trace.borrow().clone();
        all.extend(self.error_trace.borrow().iter().copied());
        all
    }

    /// Clears both traces and zeroes the overhead tracker: the boundary
    /// between two concurrent epochs.
    pub fn reset_network_metrics(&self) {
        self.connection_trace.borrow_mut().clear();
        self.error_trace.borrow_mut().clear();
        self.overhead.borrow_mut().reset_all();
    }
}

pub(crate) fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NodeParams {
        NodeParams {
            k: 4,
            alpha: 1,
            beta: 4,
            stale_limit: 3,
        }
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let net = Network::new(NetworkConfig::new(0));
        net.add_new_node(1, params()).unwrap();
        assert!(matches!(
            net.add_new_node(1, params()),
            Err(DhtError::DuplicateNode(1))
        ));
    }

    #[test]
    fn connect_to_missing_node_is_node_not_found() {
        let net = Network::new(NetworkConfig::new(0));
        net.add_new_node(1, params()).unwrap();
        let err = net.connect(1, 999).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeNotFound);
    }

    #[test]
    fn successful_connect_is_recorded_in_the_trace() {
        let net = Network::new(NetworkConfig::new(0));
        net.add_new_node(1, params()).unwrap();
        net.add_new_node(2, params()).unwrap();
        net.connect(1, 2).unwrap();
        let summary = net.summary();
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failures, 0);
    }

    #[test]
    fn reset_clears_traces_and_overhead() {
        let net = Network::new(
            NetworkConfig::new(0).gamma_overhead(1.0),
        );
        net.add_new_node(1, params()).unwrap();
        net.add_new_node(2, params()).unwrap();
        net.connect(1, 2).unwrap();
        assert_eq!(net.overhead_get(1), 1.0);
        net.reset_network_metrics();
        assert_eq!(net.summary().attempts, 0);
        assert_eq!(net.overhead_get(1), 0.0);
    }

    #[test]
    fn bootstrap_node_and_optimal_routing_table_agree() {
        let n = 40u64;
        let p = NodeParams {
            k: 3,
            alpha: 1,
            beta: 3,
            stale_limit: 2,
        };
        let net_a = Network::new(NetworkConfig::new(0));
        for id in 0..n {
            net_a.add_new_node(id, p).unwrap();
        }
        let mut bootstrap_result = net_a.bootstrap_node(0);
        bootstrap_result.sort();

        let net_b = Network::new(NetworkConfig::new(0));
        net_b.init_with_random_peers(1, n as usize, p).unwrap();
        let mut optimal_result = net_b.routing_nodes(0);
        optimal_result.sort();

        assert_eq!(bootstrap_result, optimal_result);
    }

    #[test]
    fn bulk_initializer_matches_across_worker_counts() {
        let n = 60usize;
        let p = NodeParams {
            k: 4,
            alpha: 1,
            beta: 4,
            stale_limit: 2,
        };
        let sequential = Network::new(NetworkConfig::new(0));
        sequential.init_with_random_peers(1, n, p).unwrap();

        let parallel = Network::new(NetworkConfig::new(0));
        parallel.init_with_random_peers(4, n, p).unwrap();

        for id in 0..n as u64 {
            let mut seq_nodes = sequential.routing_nodes(id);
            let mut par_nodes = parallel.routing_nodes(id);
            seq_nodes.sort();
            par_nodes.sort();
            assert_eq!(seq_nodes, par_nodes, "node {} routing table diverged", id);
        }
    }
}
