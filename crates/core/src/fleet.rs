//! One [`RateLimiter`] per node, derived from an aggregate rate.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Cancelled, ConfigError, Error, PoolError},
    limiter::{RateBudget, RateLimiter},
    Result,
};

/// Splits `total` across `nodes` so that the shares sum to exactly `total`;
/// the first `total % nodes` nodes carry the remainder, one unit each.
pub fn split_rate(total: u32, nodes: usize) -> Vec<u32> {
    if nodes == 0 {
        return vec![];
    }
    let base = total / nodes as u32;
    let remainder = (total % nodes as u32) as usize;
    (0..nodes)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[derive(Debug)]
pub struct RateLimiterFleet {
    name: &'static str,
    node_urls: Vec<String>,
    limiters: Vec<RateLimiter>,
    /// Admits at the aggregate rate for [`RateLimiterFleet::acquire_any`].
    global: RateLimiter,
    /// Permissions granted per node through either acquire path.
    assigned: Mutex<Vec<u64>>,
}

impl RateLimiterFleet {
    /// `name` labels the fleet in logs and errors (e.g. "write rate").
    pub fn new(
        name: &'static str,
        node_urls: &[String],
        total_rate: u32,
        burst_window: Duration,
    ) -> Result<Self> {
        if node_urls.is_empty() {
            return Err(ConfigError::NoNodes.into());
        }
        if total_rate == 0 {
            return Err(ConfigError::NonPositiveRate { name, value: 0 }.into());
        }
        if (total_rate as usize) < node_urls.len() {
            return Err(ConfigError::RateBelowNodeCount {
                name,
                rate: total_rate,
                nodes: node_urls.len(),
            }
            .into());
        }

        let shares = split_rate(total_rate, node_urls.len());
        let limiters = shares
            .iter()
            .map(|share| RateBudget::new(*share, burst_window).map(RateLimiter::new))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let global = RateLimiter::new(RateBudget::new(total_rate, burst_window)?);

        for (url, share) in node_urls.iter().zip(&shares) {
            debug!(fleet = name, node = %url, rate = share, "allocated node rate");
        }

        Ok(Self {
            name,
            node_urls: node_urls.to_vec(),
            limiters,
            global,
            assigned: Mutex::new(vec![0; node_urls.len()]),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn node_count(&self) -> usize {
        self.limiters.len()
    }

    pub fn total_rate(&self) -> u32 {
        self.global.budget().rate_per_second()
    }

    pub fn per_node_rates(&self) -> Vec<u32> {
        self.limiters
            .iter()
            .map(|l| l.budget().rate_per_second())
            .collect()
    }

    pub fn node_url(&self, index: usize) -> Option<&str> {
        self.node_urls.get(index).map(String::as_str)
    }

    /// Permissions granted to each node so far.
    pub fn issued_per_node(&self) -> Vec<u64> {
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits for a permission from the given node's own budget.
    pub async fn acquire_for(&self, index: usize, cancel: &CancellationToken) -> Result<()> {
        let limiter = self
            .limiters
            .get(index)
            .ok_or(PoolError::UnknownNode(index))?;
        limiter.acquire(cancel).await?;
        self.assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[index] += 1;
        Ok(())
    }

    /// Waits for a permission at the aggregate rate, then assigns it to the
    /// node that has been granted the fewest permissions so far.
    pub async fn acquire_any(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<usize, Cancelled> {
        self.global.acquire(cancel).await?;
        let mut assigned = self.assigned.lock().unwrap_or_else(PoisonError::into_inner);
        let index = assigned
            .iter()
            .enumerate()
            .min_by_key(|(_, granted)| **granted)
            .map(|(i, _)| i)
            .unwrap_or_default();
        assigned[index] += 1;
        Ok(index)
    }

    /// Clamps a requested concurrency to `node_count * per_node_cap`.
    /// Going past a node's real capacity only produces server-side throttling.
    pub fn effective_concurrency(&self, requested: usize, per_node_cap: usize) -> usize {
        let ceiling = self.node_count().saturating_mul(per_node_cap);
        if requested > ceiling {
            warn!(
                fleet = self.name,
                requested,
                ceiling,
                nodes = self.node_count(),
                per_node_cap,
                "requested concurrency exceeds fleet capacity, clamping"
            );
            return ceiling;
        }
        requested
    }
}
