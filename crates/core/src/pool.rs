//! The set of backend nodes, their client handles and live counters.
//!
//! Selection is a pair of independent atomic round-robin cursors (one for
//! writes, one for reads) so bursty verification traffic never skews the
//! write distribution. The node list is only write-locked by `add_node`.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use serde::Serialize;
use tracing::info;
use url::Url;

use crate::{client::NodeClient, error::PoolError};

/// Largest fleet the engine drives.
pub const MAX_POOL_SIZE: usize = 13;

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

#[derive(Debug, Default)]
pub struct NodeCounters {
    pub submitted: AtomicU64,
    pub confirmed: AtomicU64,
    pub failed: AtomicU64,
    pub inflight: AtomicU64,
    /// Receipt/nonce lookups made against this node.
    pub verify_count: AtomicU64,
}

pub struct Node {
    url: String,
    client: Arc<dyn NodeClient>,
    write_share: AtomicU32,
    read_share: AtomicU32,
    pub counters: NodeCounters,
}

impl Node {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn client(&self) -> Arc<dyn NodeClient> {
        self.client.clone()
    }

    pub fn write_share(&self) -> u32 {
        self.write_share.load(Ordering::Relaxed)
    }

    pub fn read_share(&self) -> u32 {
        self.read_share.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("url", &self.url)
            .field("write_share", &self.write_share())
            .field("read_share", &self.read_share())
            .field("counters", &self.counters)
            .finish()
    }
}

/// A selected node: its client, url and position in the pool.
#[derive(Clone)]
pub struct NodeHandle {
    pub index: usize,
    pub node: Arc<Node>,
}

impl NodeHandle {
    pub fn url(&self) -> &str {
        self.node.url()
    }

    pub fn client(&self) -> Arc<dyn NodeClient> {
        self.node.client()
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({}, {})", self.index, self.node.url())
    }
}

/// Point-in-time copy of a node's counters, for reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub index: usize,
    pub url: String,
    pub write_share: u32,
    pub read_share: u32,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub inflight: u64,
    pub verify_count: u64,
}

#[derive(Debug, Default)]
pub struct NodePool {
    nodes: RwLock<Vec<Arc<Node>>>,
    write_cursor: AtomicUsize,
    read_cursor: AtomicUsize,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its index.
    pub fn add_node(
        &self,
        url: impl AsRef<str>,
        client: Arc<dyn NodeClient>,
    ) -> Result<usize, PoolError> {
        let url = normalize_url(url.as_ref())?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.iter().any(|n| n.url == url) {
            return Err(PoolError::Duplicate(url));
        }
        if nodes.len() >= MAX_POOL_SIZE {
            return Err(PoolError::Full);
        }
        info!(node = %url, index = nodes.len(), "added node to pool");
        nodes.push(Arc::new(Node {
            url,
            client,
            write_share: AtomicU32::new(0),
            read_share: AtomicU32::new(0),
            counters: NodeCounters::default(),
        }));
        Ok(nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn urls(&self) -> Vec<String> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|n| n.url.clone())
            .collect()
    }

    pub fn node(&self, index: usize) -> Result<NodeHandle, PoolError> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let node = nodes.get(index).ok_or(PoolError::UnknownNode(index))?;
        Ok(NodeHandle {
            index,
            node: node.clone(),
        })
    }

    pub fn select_for_write(&self) -> Result<NodeHandle, PoolError> {
        self.select(&self.write_cursor)
    }

    pub fn select_for_read(&self) -> Result<NodeHandle, PoolError> {
        self.select(&self.read_cursor)
    }

    fn select(&self, cursor: &AtomicUsize) -> Result<NodeHandle, PoolError> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        if nodes.is_empty() {
            return Err(PoolError::Empty);
        }
        let index = cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(NodeHandle {
            index,
            node: nodes[index].clone(),
        })
    }

    /// The node with the fewest writes in flight, then the fewest submitted.
    pub fn least_loaded_for_write(&self) -> Result<NodeHandle, PoolError> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| {
                (
                    n.counters.inflight.load(Ordering::Relaxed),
                    n.counters.submitted.load(Ordering::Relaxed),
                )
            })
            .map(|(index, node)| NodeHandle {
                index,
                node: node.clone(),
            })
            .ok_or(PoolError::Empty)
    }

    /// Records the rate shares the fleets allocated, for reporting.
    pub fn set_shares(&self, write: &[u32], read: &[u32]) {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        for (i, node) in nodes.iter().enumerate() {
            if let Some(w) = write.get(i) {
                node.write_share.store(*w, Ordering::Relaxed);
            }
            if let Some(r) = read.get(i) {
                node.read_share.store(*r, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .iter()
            .enumerate()
            .map(|(index, n)| NodeSnapshot {
                index,
                url: n.url.clone(),
                write_share: n.write_share(),
                read_share: n.read_share(),
                submitted: n.counters.submitted.load(Ordering::Relaxed),
                confirmed: n.counters.confirmed.load(Ordering::Relaxed),
                failed: n.counters.failed.load(Ordering::Relaxed),
                inflight: n.counters.inflight.load(Ordering::Relaxed),
                verify_count: n.counters.verify_count.load(Ordering::Relaxed),
            })
            .collect()
    }
}

fn normalize_url(raw: &str) -> Result<String, PoolError> {
    let invalid = |reason: String| PoolError::InvalidUrl {
        url: raw.to_owned(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNodeClient;

    fn client() -> Arc<dyn NodeClient> {
        Arc::new(MockNodeClient::new())
    }

    fn pool(n: usize) -> NodePool {
        let pool = NodePool::new();
        for i in 0..n {
            pool.add_node(format!("http://node-{i}:8545"), client())
                .unwrap();
        }
        pool
    }

    #[test]
    fn rejects_malformed_urls() {
        let pool = NodePool::new();
        for bad in ["not a url", "ftp://node:21", "node-1:8545", "http://"] {
            assert!(
                matches!(
                    pool.add_node(bad, client()),
                    Err(PoolError::InvalidUrl { .. })
                ),
                "{bad} should be rejected"
            );
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn rejects_duplicates() {
        let pool = NodePool::new();
        pool.add_node("http://node-0:8545", client()).unwrap();
        assert_eq!(
            pool.add_node("HTTP://node-0:8545/", client()),
            Err(PoolError::Duplicate("http://node-0:8545/".to_owned()))
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn enforces_max_pool_size() {
        let pool = pool(MAX_POOL_SIZE);
        assert_eq!(
            pool.add_node("http://one-too-many:8545", client()),
            Err(PoolError::Full)
        );
    }

    #[test]
    fn write_and_read_cursors_are_independent() {
        let pool = pool(3);
        let reads = (0..7)
            .map(|_| pool.select_for_read().unwrap().index)
            .collect::<Vec<_>>();
        assert_eq!(reads, vec![0, 1, 2, 0, 1, 2, 0]);

        // reads did not move the write cursor
        let writes = (0..4)
            .map(|_| pool.select_for_write().unwrap().index)
            .collect::<Vec<_>>();
        assert_eq!(writes, vec![0, 1, 2, 0]);
    }

    #[test]
    fn empty_pool_has_nothing_to_select() {
        let pool = NodePool::new();
        assert_eq!(pool.select_for_write().unwrap_err(), PoolError::Empty);
        assert_eq!(pool.least_loaded_for_write().unwrap_err(), PoolError::Empty);
        assert_eq!(pool.node(0).unwrap_err(), PoolError::UnknownNode(0));
    }

    #[test]
    fn least_loaded_prefers_fewest_inflight() {
        let pool = pool(3);
        pool.node(0).unwrap().node.counters.inflight.store(2, Ordering::Relaxed);
        pool.node(1).unwrap().node.counters.submitted.store(5, Ordering::Relaxed);
        assert_eq!(pool.least_loaded_for_write().unwrap().index, 2);
    }

    #[test]
    fn snapshot_reports_shares_and_counters() {
        let pool = pool(2);
        pool.set_shares(&[3, 2], &[10, 10]);
        let node = pool.select_for_write().unwrap();
        node.node.counters.submitted.fetch_add(4, Ordering::Relaxed);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].write_share, 3);
        assert_eq!(snapshot[1].read_share, 10);
        assert_eq!(snapshot[0].submitted, 4);
        assert_eq!(snapshot[1].submitted, 0);
    }
}
