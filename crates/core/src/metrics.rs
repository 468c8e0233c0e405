use std::{fmt, time::Duration};

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::buckets::LATENCY_BUCKETS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RpcMethod {
    Submit,
    GetReceipt,
    GetNonce,
}

/// Prometheus instruments for one engine, registered in a caller-owned registry.
#[derive(Clone)]
pub struct EngineMetrics {
    rpc_latency: HistogramVec,
    outcomes: IntCounterVec,
}

impl fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let rpc_latency = HistogramVec::new(
            HistogramOpts::new(
                "pacer_rpc_latency_seconds",
                "Latency of node client calls made by the engine",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["node", "method"],
        )?;
        let outcomes = IntCounterVec::new(
            Opts::new("pacer_job_outcomes_total", "Resolved jobs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(rpc_latency.clone()))?;
        registry.register(Box::new(outcomes.clone()))?;
        Ok(Self {
            rpc_latency,
            outcomes,
        })
    }

    pub fn observe(&self, node: &str, method: RpcMethod, elapsed: Duration) {
        self.rpc_latency
            .with_label_values(&[node, method.as_ref()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn sample_count(&self, node: &str, method: RpcMethod) -> u64 {
        self.rpc_latency
            .with_label_values(&[node, method.as_ref()])
            .get_sample_count()
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.outcomes.with_label_values(&[outcome]).get()
    }
}
