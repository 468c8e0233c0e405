//! Wires a validated [`EngineConfig`] into a node pool, rate fleets, a
//! confirmation tracker and a dispatcher, and runs job batches through them.

use std::sync::Arc;

use prometheus::Registry;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::{NodeClient, PayloadSigner},
    config::EngineConfig,
    confirm::ConfirmationTracker,
    dispatch::{AccountLane, DispatchContext, DispatchJob, Dispatcher, JobReport},
    error::ConfigError,
    fleet::RateLimiterFleet,
    metrics::EngineMetrics,
    pool::{NodePool, NodeSnapshot},
    stats::{RunReport, StatsCollector},
    Result,
};

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutput {
    pub reports: Vec<JobReport>,
    pub summary: RunReport,
    pub nodes: Vec<NodeSnapshot>,
}

pub struct Engine {
    config: EngineConfig,
    pool: Arc<NodePool>,
    write_fleet: Arc<RateLimiterFleet>,
    read_fleet: Arc<RateLimiterFleet>,
    dispatcher: Dispatcher,
    workers: usize,
    collector: StatsCollector,
}

impl Engine {
    /// `clients[i]` talks to `config.node_urls[i]`.
    pub fn new(
        config: EngineConfig,
        clients: Vec<Arc<dyn NodeClient>>,
        signer: Arc<dyn PayloadSigner>,
    ) -> Result<Self> {
        Self::build(config, clients, signer, None)
    }

    /// Like [`Engine::new`], recording RPC latencies and outcomes in `registry`.
    pub fn with_registry(
        config: EngineConfig,
        clients: Vec<Arc<dyn NodeClient>>,
        signer: Arc<dyn PayloadSigner>,
        registry: &Registry,
    ) -> Result<Self> {
        let metrics = EngineMetrics::new(registry)?;
        Self::build(config, clients, signer, Some(metrics))
    }

    fn build(
        config: EngineConfig,
        clients: Vec<Arc<dyn NodeClient>>,
        signer: Arc<dyn PayloadSigner>,
        metrics: Option<EngineMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        if clients.len() != config.node_urls.len() {
            return Err(ConfigError::ClientCountMismatch {
                urls: config.node_urls.len(),
                clients: clients.len(),
            }
            .into());
        }

        let pool = Arc::new(NodePool::new());
        for (url, client) in config.node_urls.iter().zip(clients) {
            pool.add_node(url, client)?;
        }
        let urls = pool.urls();
        let write_fleet = Arc::new(RateLimiterFleet::new(
            "write rate",
            &urls,
            config.write_rate,
            config.burst_window,
        )?);
        let read_fleet = Arc::new(RateLimiterFleet::new(
            "read rate",
            &urls,
            config.read_rate,
            config.burst_window,
        )?);
        pool.set_shares(&write_fleet.per_node_rates(), &read_fleet.per_node_rates());
        let workers = write_fleet.effective_concurrency(config.workers, config.per_node_cap);

        let mut tracker =
            ConfirmationTracker::new(pool.clone(), read_fleet.clone(), config.tracker_config());
        if let Some(metrics) = metrics.clone() {
            tracker = tracker.with_metrics(metrics);
        }
        let dispatcher = Dispatcher::new(DispatchContext {
            pool: pool.clone(),
            write_fleet: write_fleet.clone(),
            signer,
            tracker: Arc::new(tracker),
            assignment: config.assignment,
            submit_timeout: config.submit_timeout,
            confirm_jobs: config.confirm_jobs,
            metrics,
        });

        info!(
            nodes = urls.len(),
            write_rate = config.write_rate,
            read_rate = config.read_rate,
            workers,
            assignment = %config.assignment,
            "engine ready"
        );
        Ok(Self {
            config,
            pool,
            write_fleet,
            read_fleet,
            dispatcher,
            workers,
            collector: StatsCollector::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn write_fleet(&self) -> &RateLimiterFleet {
        &self.write_fleet
    }

    pub fn read_fleet(&self) -> &RateLimiterFleet {
        &self.read_fleet
    }

    /// Worker count after clamping to the fleet's capacity.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Dispatches independent jobs. Every job yields exactly one report, even
    /// when `cancel` fires before the job was queued.
    pub async fn run_jobs(
        &self,
        jobs: Vec<DispatchJob>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        info!(jobs = jobs.len(), "starting run");
        let start = Instant::now();
        let (job_tx, job_rx) = mpsc::channel(self.workers * 2);
        let (res_tx, res_rx) = mpsc::channel(self.workers * 4);

        let feed = feed(jobs, job_tx, res_tx.clone(), cancel, |job| {
            vec![JobReport::cancelled(job)]
        });
        let (run, (), reports) = tokio::join!(
            self.dispatcher.run(job_rx, res_tx, self.workers, cancel),
            feed,
            self.collector.collect(res_rx),
        );
        run?;
        Ok(self.finish(reports, start))
    }

    /// Dispatches per-account lanes; operations within a lane are sequential.
    pub async fn run_accounts(
        &self,
        lanes: Vec<AccountLane>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        info!(
            accounts = lanes.len(),
            ops = lanes.iter().map(|l| l.ops.len()).sum::<usize>(),
            "starting account run"
        );
        let start = Instant::now();
        let (lane_tx, lane_rx) = mpsc::channel(self.workers);
        let (res_tx, res_rx) = mpsc::channel(self.workers * 4);

        let feed = feed(lanes, lane_tx, res_tx.clone(), cancel, |lane| {
            let first = lane.start_nonce.unwrap_or_default();
            lane.ops
                .into_iter()
                .zip(first..)
                .map(|(op, nonce)| JobReport::cancelled(op.into_job(&lane.account, nonce)))
                .collect()
        });
        let (run, (), reports) = tokio::join!(
            self.dispatcher.run_accounts(lane_rx, res_tx, self.workers, cancel),
            feed,
            self.collector.collect(res_rx),
        );
        run?;
        Ok(self.finish(reports, start))
    }

    fn finish(&self, reports: Vec<JobReport>, start: Instant) -> RunOutput {
        let summary = RunReport::from_reports(&reports, start.elapsed());
        info!(
            jobs = summary.total,
            accepted = summary.accepted,
            success_rate = format!("{:.2}%", summary.success_rate * 100.0),
            "run finished"
        );
        RunOutput {
            reports,
            summary,
            nodes: self.pool.snapshot(),
        }
    }
}

/// Queues `items` for the workers. Once `cancel` fires, items not yet queued
/// are reported directly through `on_cancel` so none goes unaccounted for.
async fn feed<T>(
    items: Vec<T>,
    tx: mpsc::Sender<T>,
    results: mpsc::Sender<JobReport>,
    cancel: &CancellationToken,
    on_cancel: impl Fn(T) -> Vec<JobReport>,
) {
    for item in items {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => permit.send(item),
            None => {
                for report in on_cancel(item) {
                    if results.send(report).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
