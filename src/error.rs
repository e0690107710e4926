//! Programmer-facing errors.
//!
//! Simulated network failures (fast/slow/node-not-found) are *not* modelled
//! here — they are data carried by [`crate::network::ConnectionError`], not
//! exceptions of the whole operation. This enum only covers misuse of the
//! public API that a caller should fix before running a simulation.

use thiserror::Error;

/// Errors returned by constructors and configuration setters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("error rate must be in 0..=99, got {0}")]
    InvalidErrorRate(u8),

    #[error("alpha (concurrency) must be at least 1")]
    InvalidAlpha,

    #[error("beta (result width) must be at least 1")]
    InvalidBeta,

    #[error("bucket capacity k must be at least 1")]
    InvalidBucketCapacity,

    #[error("node {0} is already registered in this network")]
    DuplicateNode(u64),

    #[error("node {0} is not registered in this network")]
    UnknownNode(u64),
}
