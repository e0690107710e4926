//! Discrete-event simulator of a Kademlia-style distributed hash table.
//!
//! The crate is organized leaves-first, mirroring how a lookup is actually
//! built up:
//!
//! 1. [`hash`] — the identifier space and its XOR distance metric.
//! 2. [`kbucket`] and [`routing_table`] — the per-node routing structure.
//! 3. [`store`] — per-node content storage.
//! 4. [`overhead`] — per-node cumulative processing cost within an epoch.
//! 5. [`network`] — the simulated fabric: registry, delay/error injection,
//!    and the parallel bulk initializer.
//! 6. [`node`] — the DHT client: bootstrap, iterative lookup, provide, and
//!    retrieve.
//!
//! Call [`env_logger::init`] (or any other `log`-compatible subscriber) in
//! your own binary or test if you want to see the `trace!`/`debug!`/`info!`
//! instrumentation this crate emits; the library itself never initializes a
//! logger.

pub mod error;
pub mod hash;
pub mod kbucket;
pub mod network;
pub mod node;
pub mod overhead;
pub mod routing_table;
pub mod store;

pub use error::DhtError;
pub use hash::{Distance, Hash};
pub use network::{
    ConnectionError, ConnectionRecord, ErrorKind, Network, NetworkConfig, NetworkSummary,
    NodeParams,
};
pub use node::{LookupResult, LookupSummary, Node, ProvideSummary};
