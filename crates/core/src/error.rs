use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("node pool: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Returned by every cancellable wait when the caller's token fires first.
/// Rate limiting itself never fails; it can only be cancelled.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Run-level configuration problems, rejected before any dispatch begins.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one node URL is required")]
    NoNodes,

    #[error(
        "too many nodes: {0} configured, at most {max} supported",
        max = crate::pool::MAX_POOL_SIZE
    )]
    TooManyNodes(usize),

    #[error("{name} must be greater than zero (got {value})")]
    NonPositiveRate { name: &'static str, value: i64 },

    #[error("{name} of {rate}/s cannot give each of {nodes} nodes a non-zero share")]
    RateBelowNodeCount {
        name: &'static str,
        rate: u32,
        nodes: usize,
    },

    #[error("worker count must be greater than zero")]
    NoWorkers,

    #[error("per-node concurrency cap must be greater than zero")]
    NoPerNodeCap,

    #[error("{name} must be a non-zero duration (got {value:?})")]
    ZeroDuration { name: &'static str, value: Duration },

    #[error("expected one client per node URL ({urls} urls, {clients} clients)")]
    ClientCountMismatch { urls: usize, clients: usize },

    #[error("failed to read config file: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("malformed node URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("node URL '{0}' is already in the pool")]
    Duplicate(String),

    #[error("node pool is full ({max} nodes)", max = crate::pool::MAX_POOL_SIZE)]
    Full,

    #[error("node pool is empty")]
    Empty,

    #[error("no node at index {0}")]
    UnknownNode(usize),
}
