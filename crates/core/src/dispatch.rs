//! Fixed-size worker pool draining a queue of dispatch jobs.
//!
//! Each job is signed, assigned to a node, admitted by the write fleet,
//! submitted, optionally confirmed, and reported exactly once on the results
//! channel. Workers exit when the job channel is closed and drained.
//!
//! Two assignment strategies are offered, see [`NodeAssignment`].

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{AccountId, ClientError, PayloadSigner, ReceiptHandle, SignedPayload},
    confirm::{
        ConfirmationOutcome, ConfirmationRecord, ConfirmationTracker, FailureKind,
        NonceExpectation, TimeoutCause,
    },
    error::Error,
    fleet::RateLimiterFleet,
    metrics::{EngineMetrics, RpcMethod},
    pool::{NodeHandle, NodePool},
    util::{catch_panic, unix_millis},
    Result,
};

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a job is matched with a node and a write permission.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeAssignment {
    /// Pick the node first (job hint, else write round-robin), then wait on
    /// that node's own share of the write rate. Every node sees at most its
    /// share regardless of how fast workers drain the queue; a slow node only
    /// slows the jobs routed to it.
    #[default]
    StaticPartition,
    /// Wait on the aggregate write rate, then hand the permission to the node
    /// granted the fewest so far. Long-run counts stay equal even with uneven
    /// worker speed, but a node with pathological latency still receives its
    /// equal count and can hold workers hostage.
    GlobalLeastLoaded,
}

/// A unit of work, consumed exactly once by exactly one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: u64,
    pub account: AccountId,
    pub target: String,
    pub amount: u128,
    pub nonce: u64,
    /// Pin the job to a node index; ignored when out of range.
    pub node_hint: Option<usize>,
}

/// Final classification of a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Accepted by a node; confirmation was not tracked.
    Submitted,
    Confirmed,
    Failed(FailureKind),
    TimedOut(TimeoutCause),
    /// Cancelled before the payload reached any node.
    Cancelled,
    /// Skipped because an earlier operation of the same account broke the nonce sequence.
    Aborted,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeKind {
    Submitted,
    Confirmed,
    Failed,
    TimedOut,
    Cancelled,
    Aborted,
}

impl JobOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            JobOutcome::Submitted => OutcomeKind::Submitted,
            JobOutcome::Confirmed => OutcomeKind::Confirmed,
            JobOutcome::Failed(_) => OutcomeKind::Failed,
            JobOutcome::TimedOut(_) => OutcomeKind::TimedOut,
            JobOutcome::Cancelled => OutcomeKind::Cancelled,
            JobOutcome::Aborted => OutcomeKind::Aborted,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Submitted | JobOutcome::Confirmed)
    }

    /// Human-readable cause for failed or timed out jobs.
    pub fn detail(&self) -> Option<String> {
        match self {
            JobOutcome::Failed(kind) => Some(kind.to_string()),
            JobOutcome::TimedOut(cause) => Some(cause.to_string()),
            _ => None,
        }
    }
}

impl From<ConfirmationOutcome> for JobOutcome {
    fn from(outcome: ConfirmationOutcome) -> Self {
        match outcome {
            ConfirmationOutcome::Confirmed => JobOutcome::Confirmed,
            ConfirmationOutcome::Failed(kind) => JobOutcome::Failed(kind),
            ConfirmationOutcome::TimedOut(cause) => JobOutcome::TimedOut(cause),
        }
    }
}

/// Everything recorded about one job.
#[derive(Clone, Debug)]
pub struct JobReport {
    pub job: DispatchJob,
    pub node_index: Option<usize>,
    pub node_url: Option<String>,
    /// Unix millis when the submission call started.
    pub submitted_at_ms: Option<u64>,
    /// Unix millis when the node answered the submission.
    pub responded_at_ms: Option<u64>,
    pub submit_latency: Option<Duration>,
    pub handle: Option<ReceiptHandle>,
    pub confirmation: Option<ConfirmationRecord>,
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Report for a job that never reached a worker.
    pub fn cancelled(job: DispatchJob) -> Self {
        Self::new(job, JobOutcome::Cancelled)
    }

    fn new(job: DispatchJob, outcome: JobOutcome) -> Self {
        Self {
            job,
            node_index: None,
            node_url: None,
            submitted_at_ms: None,
            responded_at_ms: None,
            submit_latency: None,
            handle: None,
            confirmation: None,
            outcome,
        }
    }

    fn on_node(mut self, node: &NodeHandle) -> Self {
        self.node_index = Some(node.index);
        self.node_url = Some(node.url().to_owned());
        self
    }
}

/// Operations of one account, issued strictly in order by a single worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLane {
    pub account: AccountId,
    /// First nonce to use; read from the fleet when absent.
    pub start_nonce: Option<u64>,
    pub ops: Vec<LaneOp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneOp {
    pub id: u64,
    pub target: String,
    pub amount: u128,
    pub node_hint: Option<usize>,
}

impl LaneOp {
    pub fn into_job(self, account: &AccountId, nonce: u64) -> DispatchJob {
        DispatchJob {
            id: self.id,
            account: account.clone(),
            target: self.target,
            amount: self.amount,
            nonce,
            node_hint: self.node_hint,
        }
    }
}

/// Shared state every worker needs.
pub struct DispatchContext {
    pub pool: Arc<NodePool>,
    pub write_fleet: Arc<RateLimiterFleet>,
    pub signer: Arc<dyn PayloadSigner>,
    pub tracker: Arc<ConfirmationTracker>,
    pub assignment: NodeAssignment,
    pub submit_timeout: Duration,
    /// Track confirmation for independent jobs; account lanes always confirm.
    pub confirm_jobs: bool,
    pub metrics: Option<EngineMetrics>,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

enum Submission {
    Accepted(ReceiptHandle),
    Failed(FailureKind),
    TimedOut(TimeoutCause),
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Drains `jobs` with `worker_count` workers, sending one report per job
    /// to `results`. Returns once every worker has exited.
    pub async fn run(
        &self,
        jobs: mpsc::Receiver<DispatchJob>,
        results: mpsc::Sender<JobReport>,
        worker_count: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let jobs = Arc::new(Mutex::new(jobs));
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count.max(1) {
            let dispatcher = self.clone();
            let jobs = jobs.clone();
            let results = results.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let mut handled = 0u64;
                while let Some(job) = next_item(&jobs).await {
                    let job_id = job.id;
                    let report = dispatcher.execute_guarded(job, None, &cancel).await;
                    handled += 1;
                    if results.send(report).await.is_err() {
                        warn!(worker_id, job_id, "results receiver dropped, stopping worker");
                        break;
                    }
                }
                debug!(worker_id, handled, "worker finished");
            });
        }
        drop(results);
        join_all(workers).await
    }

    /// Runs one sequential actor per account lane on `worker_count` workers.
    /// Lanes proceed in parallel with each other; within a lane, op `n + 1`
    /// is only issued once op `n` resolved.
    pub async fn run_accounts(
        &self,
        lanes: mpsc::Receiver<AccountLane>,
        results: mpsc::Sender<JobReport>,
        worker_count: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let lanes = Arc::new(Mutex::new(lanes));
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count.max(1) {
            let dispatcher = self.clone();
            let lanes = lanes.clone();
            let results = results.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                while let Some(lane) = next_item(&lanes).await {
                    if dispatcher.run_lane(lane, &results, &cancel).await.is_err() {
                        warn!(worker_id, "results receiver dropped, stopping worker");
                        break;
                    }
                }
                debug!(worker_id, "lane worker finished");
            });
        }
        drop(results);
        join_all(workers).await
    }

    async fn run_lane(
        &self,
        lane: AccountLane,
        results: &mpsc::Sender<JobReport>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), mpsc::error::SendError<JobReport>> {
        let AccountLane {
            account,
            start_nonce,
            ops,
        } = lane;

        let mut nonce = match start_nonce {
            Some(nonce) => nonce,
            None => match self.ctx.tracker.current_nonce(&account, cancel).await {
                Ok(nonce) => nonce,
                Err(e) => {
                    warn!(%account, "cannot start lane: {e}");
                    let outcome = match e {
                        Error::Cancelled(_) => JobOutcome::Cancelled,
                        other => JobOutcome::Failed(FailureKind::NonceLookup(other.to_string())),
                    };
                    for op in ops {
                        let job = op.into_job(&account, 0);
                        results.send(JobReport::new(job, outcome.clone())).await?;
                    }
                    return Ok(());
                }
            },
        };

        // outcome given to every op left once the lane stops early
        let mut stopped: Option<JobOutcome> = None;
        for op in ops {
            let job = op.into_job(&account, nonce);
            if let Some(outcome) = &stopped {
                results.send(JobReport::new(job, outcome.clone())).await?;
                continue;
            }
            let expectation = NonceExpectation {
                account: account.clone(),
                expected: nonce + 1,
            };
            let report = self.execute_guarded(job, Some(expectation), cancel).await;
            match &report.outcome {
                JobOutcome::Failed(kind) if kind.is_invariant_violation() => {
                    warn!(%account, nonce, "{kind}; aborting remaining operations of this account");
                    stopped = Some(JobOutcome::Aborted);
                }
                // the payload never landed, so its nonce is still free
                JobOutcome::Failed(
                    FailureKind::Signing(_) | FailureKind::Submission(_) | FailureKind::Panicked(_),
                )
                | JobOutcome::Cancelled => {}
                // the payload may still land later; nonce + 1 must not be sent before it does
                JobOutcome::TimedOut(_) | JobOutcome::Failed(FailureKind::UnknownNode(_)) => {
                    stopped = Some(if cancel.is_cancelled() {
                        JobOutcome::Cancelled
                    } else {
                        warn!(
                            %account,
                            nonce,
                            "operation unresolved; aborting remaining operations of this account"
                        );
                        JobOutcome::Aborted
                    });
                }
                // included, successfully or not
                _ => nonce += 1,
            }
            results.send(report).await?;
        }
        Ok(())
    }

    /// [`Dispatcher::execute`] with a last-resort panic guard, so a bug in one
    /// job can never take down its worker.
    async fn execute_guarded(
        &self,
        job: DispatchJob,
        expectation: Option<NonceExpectation>,
        cancel: &CancellationToken,
    ) -> JobReport {
        let fallback = job.clone();
        match catch_panic(self.execute(job, expectation, cancel)).await {
            Ok(report) => report,
            Err(panic) => {
                warn!(job_id = fallback.id, "job panicked: {panic}");
                JobReport::new(fallback, JobOutcome::Failed(FailureKind::Panicked(panic)))
            }
        }
    }

    /// Signs, admits, submits and (when required) confirms a single job.
    pub async fn execute(
        &self,
        job: DispatchJob,
        expectation: Option<NonceExpectation>,
        cancel: &CancellationToken,
    ) -> JobReport {
        let ctx = &self.ctx;
        let payload = match catch_panic(ctx.signer.sign(&job)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                let outcome = JobOutcome::Failed(FailureKind::Signing(e));
                return self.finish(JobReport::new(job, outcome));
            }
            Err(panic) => {
                let outcome = JobOutcome::Failed(FailureKind::Panicked(panic));
                return self.finish(JobReport::new(job, outcome));
            }
        };

        let node = match self.admit(&job, cancel).await {
            Ok(node) => node,
            Err(Error::Cancelled(_)) => {
                return self.finish(JobReport::new(job, JobOutcome::Cancelled));
            }
            Err(e) => {
                warn!(job_id = job.id, "no node available: {e}");
                let kind = FailureKind::Submission(ClientError::InvalidRequest(e.to_string()));
                return self.finish(JobReport::new(job, JobOutcome::Failed(kind)));
            }
        };

        let counters = &node.node.counters;
        counters.inflight.fetch_add(1, Ordering::Relaxed);
        let mut report = JobReport::new(job, JobOutcome::Submitted).on_node(&node);
        report.submitted_at_ms = Some(unix_millis());
        let start = Instant::now();
        let submission = self.submit(&node, &payload, cancel).await;
        let elapsed = start.elapsed();
        report.responded_at_ms = Some(unix_millis());
        report.submit_latency = Some(elapsed);
        if let Some(metrics) = &ctx.metrics {
            metrics.observe(node.url(), RpcMethod::Submit, elapsed);
        }

        let handle = match submission {
            Submission::Accepted(handle) => {
                counters.submitted.fetch_add(1, Ordering::Relaxed);
                handle
            }
            Submission::Failed(kind) => {
                counters.inflight.fetch_sub(1, Ordering::Relaxed);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = report.job.id, node = node.url(), "submission failed: {kind}");
                report.outcome = JobOutcome::Failed(kind);
                return self.finish(report);
            }
            Submission::TimedOut(cause) => {
                counters.inflight.fetch_sub(1, Ordering::Relaxed);
                report.outcome = JobOutcome::TimedOut(cause);
                return self.finish(report);
            }
        };
        report.handle = Some(handle.clone());

        if expectation.is_some() || ctx.confirm_jobs {
            let record = ctx
                .tracker
                .track(node.index, Some(&handle), expectation.as_ref(), cancel)
                .await;
            match &record.outcome {
                ConfirmationOutcome::Confirmed => {
                    counters.confirmed.fetch_add(1, Ordering::Relaxed);
                }
                ConfirmationOutcome::Failed(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                ConfirmationOutcome::TimedOut(_) => {}
            }
            report.outcome = record.outcome.clone().into();
            report.confirmation = Some(record);
        }
        counters.inflight.fetch_sub(1, Ordering::Relaxed);
        self.finish(report)
    }

    /// Picks a node for `job` and waits for its write permission.
    async fn admit(&self, job: &DispatchJob, cancel: &CancellationToken) -> Result<NodeHandle> {
        let ctx = &self.ctx;
        let hinted = job.node_hint.filter(|i| *i < ctx.pool.len());
        match (ctx.assignment, hinted) {
            (_, Some(index)) => {
                ctx.write_fleet.acquire_for(index, cancel).await?;
                Ok(ctx.pool.node(index)?)
            }
            (NodeAssignment::StaticPartition, None) => {
                let node = ctx.pool.select_for_write()?;
                ctx.write_fleet.acquire_for(node.index, cancel).await?;
                Ok(node)
            }
            (NodeAssignment::GlobalLeastLoaded, None) => {
                let index = ctx.write_fleet.acquire_any(cancel).await?;
                Ok(ctx.pool.node(index)?)
            }
        }
    }

    async fn submit(
        &self,
        node: &NodeHandle,
        payload: &SignedPayload,
        cancel: &CancellationToken,
    ) -> Submission {
        let client = node.client();
        let call = catch_panic(client.submit(payload));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Submission::TimedOut(TimeoutCause::Cancelled),
            res = timeout(self.ctx.submit_timeout, call) => match res {
                Ok(Ok(Ok(handle))) => Submission::Accepted(handle),
                Ok(Ok(Err(e))) => Submission::Failed(FailureKind::Submission(e)),
                Ok(Err(panic)) => {
                    warn!(node = node.url(), "node client panicked during submit: {panic}");
                    Submission::Failed(FailureKind::Panicked(panic))
                }
                Err(_) => Submission::TimedOut(TimeoutCause::SubmitDeadline),
            },
        }
    }

    fn finish(&self, report: JobReport) -> JobReport {
        if let Some(metrics) = &self.ctx.metrics {
            metrics.record_outcome(&report.outcome.kind().to_string());
        }
        debug!(
            job_id = report.job.id,
            account = %report.job.account,
            nonce = report.job.nonce,
            node = report.node_url.as_deref().unwrap_or("-"),
            outcome = %report.outcome.kind(),
            "job resolved"
        );
        report
    }
}

/// Next queued item, or `None` once the queue is closed and drained.
///
/// Workers keep draining after cancellation: an item queued at any point is
/// still handed out and reported (as cancelled), so the producer must drop
/// its sender once cancelled for the workers to exit.
async fn next_item<T>(queue: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
    queue.lock().await.recv().await
}

async fn join_all(mut workers: JoinSet<()>) -> Result<()> {
    let mut first_err = None;
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e.into()),
        None => {
            info!("all workers finished");
            Ok(())
        }
    }
}
