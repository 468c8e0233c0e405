//! Bounded polling for the eventual effect of a submitted payload.
//!
//! Each tracked job walks `Submitted -> Polling -> {Confirmed, Failed, TimedOut}`.
//! Every poll takes a read permission from the read fleet first, so
//! verification traffic obeys the same backpressure as writes.

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{AccountId, ClientError, ReceiptHandle, ReceiptStatus},
    error::{Cancelled, Error},
    fleet::RateLimiterFleet,
    metrics::{EngineMetrics, RpcMethod},
    pool::{NodeHandle, NodePool},
    util::catch_panic,
    Result,
};

pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The nonce an account must reach once the tracked operation lands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceExpectation {
    pub account: AccountId,
    pub expected: u64,
}

/// Why a job ended in `Failed`. Terminal failures are authoritative and never retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FailureKind {
    #[error("signing failed: {0}")]
    Signing(ClientError),

    #[error("submission failed: {0}")]
    Submission(ClientError),

    #[error("node client panicked: {0}")]
    Panicked(String),

    #[error("receipt reports failure")]
    Reverted,

    #[error("nonce jumped past expectation (expected {expected}, observed {observed})")]
    NonceJump { expected: u64, observed: u64 },

    #[error("could not read starting nonce: {0}")]
    NonceLookup(String),

    #[error("node {0} is not in the pool")]
    UnknownNode(usize),
}

impl FailureKind {
    /// Breaks the tracked nonce sequence of the account.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, FailureKind::NonceJump { .. })
    }

    /// Short cause name, for grouping failures in reports.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Signing(_) => "signing",
            FailureKind::Submission(_) => "submission",
            FailureKind::Panicked(_) => "panicked",
            FailureKind::Reverted => "reverted",
            FailureKind::NonceJump { .. } => "nonce_jump",
            FailureKind::NonceLookup(_) => "nonce_lookup",
            FailureKind::UnknownNode(_) => "unknown_node",
        }
    }
}

/// Why a job ended in `TimedOut`: its outcome is unknown, not failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutCause {
    /// No terminal state observed within the confirmation timeout.
    Deadline,
    /// The caller cancelled while the outcome was still open.
    Cancelled,
    /// The node did not answer the submission within the submit timeout.
    SubmitDeadline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed,
    Failed(FailureKind),
    TimedOut(TimeoutCause),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationState {
    Submitted,
    Polling,
    Resolved(ConfirmationOutcome),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationRecord {
    pub outcome: ConfirmationOutcome,
    pub polls: u32,
    pub latency: Duration,
}

impl ConfirmationRecord {
    pub fn is_confirmed(&self) -> bool {
        self.outcome == ConfirmationOutcome::Confirmed
    }
}

enum PollResult {
    Pending,
    Resolved(ConfirmationOutcome),
}

impl PollResult {
    fn timed_out(cause: TimeoutCause) -> Self {
        PollResult::Resolved(ConfirmationOutcome::TimedOut(cause))
    }
}

#[derive(Debug)]
pub struct ConfirmationTracker {
    pool: Arc<NodePool>,
    read_fleet: Arc<RateLimiterFleet>,
    config: TrackerConfig,
    metrics: Option<EngineMetrics>,
}

impl ConfirmationTracker {
    pub fn new(
        pool: Arc<NodePool>,
        read_fleet: Arc<RateLimiterFleet>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            pool,
            read_fleet,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Polls until the receipt behind `handle` (or the account nonce in
    /// `expectation`) resolves, the timeout elapses, or `cancel` fires.
    /// Receipts are read from the node the payload was submitted to.
    pub async fn track(
        &self,
        node_index: usize,
        handle: Option<&ReceiptHandle>,
        expectation: Option<&NonceExpectation>,
        cancel: &CancellationToken,
    ) -> ConfirmationRecord {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut state = ConfirmationState::Submitted;
        let mut polls = 0u32;

        let node = match self.pool.node(node_index) {
            Ok(node) => node,
            Err(e) => {
                warn!(node_index, "cannot track on unknown node: {e}");
                return ConfirmationRecord {
                    outcome: ConfirmationOutcome::Failed(FailureKind::UnknownNode(node_index)),
                    polls,
                    latency: Duration::ZERO,
                };
            }
        };
        if handle.is_none() && expectation.is_none() {
            // nothing observable; resolve immediately rather than burn the timeout
            return ConfirmationRecord {
                outcome: ConfirmationOutcome::Confirmed,
                polls,
                latency: Duration::ZERO,
            };
        }

        transition(&mut state, ConfirmationState::Polling, handle);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => PollResult::timed_out(TimeoutCause::Cancelled),
                _ = sleep_until(deadline) => PollResult::timed_out(TimeoutCause::Deadline),
                step = async {
                    ticker.tick().await;
                    polls += 1;
                    self.poll_once(&node, handle, expectation, cancel).await
                } => step,
            };
            if let PollResult::Resolved(outcome) = step {
                break outcome;
            }
        };

        transition(&mut state, ConfirmationState::Resolved(outcome.clone()), handle);
        ConfirmationRecord {
            outcome,
            polls,
            latency: Instant::now() - started,
        }
    }

    /// Tracks an operation by nonce advancement alone.
    pub async fn track_nonce_only(
        &self,
        node_index: usize,
        expectation: &NonceExpectation,
        cancel: &CancellationToken,
    ) -> ConfirmationRecord {
        self.track(node_index, None, Some(expectation), cancel).await
    }

    /// Reads an account's current nonce through the read fleet.
    pub async fn current_nonce(
        &self,
        account: &AccountId,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let node = self.pool.select_for_read()?;
        self.read_fleet.acquire_for(node.index, cancel).await?;
        let call = self.get_nonce(&node, account);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled.into()),
            res = timeout(self.config.timeout, call) => match res {
                Ok(Ok(nonce)) => Ok(nonce),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ClientError::Transport(format!(
                    "nonce lookup timed out after {:?}",
                    self.config.timeout
                ))
                .into()),
            },
        }
    }

    async fn poll_once(
        &self,
        node: &NodeHandle,
        handle: Option<&ReceiptHandle>,
        expectation: Option<&NonceExpectation>,
        cancel: &CancellationToken,
    ) -> PollResult {
        let mut nonce_reached = false;

        if let Some(expectation) = expectation {
            let reader = self.pool.select_for_read().unwrap_or_else(|_| node.clone());
            if let Err(resolved) = self.read_permission(reader.index, cancel).await {
                return resolved;
            }
            match catch_panic(self.get_nonce(&reader, &expectation.account)).await {
                Ok(Ok(observed)) if observed > expectation.expected => {
                    warn!(
                        account = %expectation.account,
                        expected = expectation.expected,
                        observed,
                        "nonce advanced past the tracked sequence"
                    );
                    return PollResult::Resolved(ConfirmationOutcome::Failed(
                        FailureKind::NonceJump {
                            expected: expectation.expected,
                            observed,
                        },
                    ));
                }
                Ok(Ok(observed)) => nonce_reached = observed == expectation.expected,
                Ok(Err(e)) => debug!(node = reader.url(), "nonce lookup failed, retrying: {e}"),
                Err(panic) => {
                    return PollResult::Resolved(ConfirmationOutcome::Failed(
                        FailureKind::Panicked(panic),
                    ))
                }
            }
        }

        if let Some(handle) = handle {
            if let Err(resolved) = self.read_permission(node.index, cancel).await {
                return resolved;
            }
            match catch_panic(self.get_receipt(node, handle)).await {
                Ok(Ok(ReceiptStatus::Success)) => {
                    return PollResult::Resolved(ConfirmationOutcome::Confirmed)
                }
                Ok(Ok(ReceiptStatus::Failed)) => {
                    return PollResult::Resolved(ConfirmationOutcome::Failed(FailureKind::Reverted))
                }
                Ok(Ok(ReceiptStatus::Pending)) => {}
                Ok(Err(e)) => {
                    debug!(node = node.url(), %handle, "receipt lookup failed, retrying: {e}")
                }
                Err(panic) => {
                    return PollResult::Resolved(ConfirmationOutcome::Failed(
                        FailureKind::Panicked(panic),
                    ))
                }
            }
        }

        if nonce_reached {
            PollResult::Resolved(ConfirmationOutcome::Confirmed)
        } else {
            PollResult::Pending
        }
    }

    async fn read_permission(
        &self,
        index: usize,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), PollResult> {
        match self.read_fleet.acquire_for(index, cancel).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled(_)) => Err(PollResult::Resolved(ConfirmationOutcome::TimedOut(
                TimeoutCause::Cancelled,
            ))),
            Err(e) => {
                warn!(node_index = index, "read permission unavailable: {e}");
                Err(PollResult::Pending)
            }
        }
    }

    async fn get_nonce(
        &self,
        node: &NodeHandle,
        account: &AccountId,
    ) -> std::result::Result<u64, ClientError> {
        node.node.counters.verify_count.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let res = node.client().get_nonce(account).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe(node.url(), RpcMethod::GetNonce, start.elapsed());
        }
        res
    }

    async fn get_receipt(
        &self,
        node: &NodeHandle,
        handle: &ReceiptHandle,
    ) -> std::result::Result<ReceiptStatus, ClientError> {
        node.node.counters.verify_count.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let res = node.client().get_receipt(handle).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe(node.url(), RpcMethod::GetReceipt, start.elapsed());
        }
        res
    }
}

fn transition(
    state: &mut ConfirmationState,
    next: ConfirmationState,
    handle: Option<&ReceiptHandle>,
) {
    debug!(
        handle = handle.map(|h| h.0.as_str()).unwrap_or("-"),
        from = ?state,
        to = ?next,
        "confirmation state"
    );
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::NodeClient,
        limiter::DEFAULT_BURST_WINDOW,
        mock::MockNodeClient,
    };

    struct Harness {
        tracker: ConfirmationTracker,
        client: Arc<MockNodeClient>,
    }

    fn harness(config: TrackerConfig) -> Harness {
        let client = Arc::new(MockNodeClient::new());
        let pool = Arc::new(NodePool::new());
        pool.add_node("http://node-0:8545", client.clone() as Arc<dyn NodeClient>)
            .unwrap();
        let read_fleet = Arc::new(
            RateLimiterFleet::new("read rate", &pool.urls(), 1000, DEFAULT_BURST_WINDOW).unwrap(),
        );
        Harness {
            tracker: ConfirmationTracker::new(pool, read_fleet, config),
            client,
        }
    }

    fn config(timeout_ms: u64, poll_ms: u64) -> TrackerConfig {
        TrackerConfig {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(poll_ms),
        }
    }

    fn account() -> AccountId {
        AccountId::new("0xabc")
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_once_receipt_succeeds() {
        let h = harness(config(10_000, 200));
        h.client.set_inclusion_delay(Duration::from_millis(450));
        let handle = h.client.submit_raw(&account(), 0).await.unwrap();

        let record = h
            .tracker
            .track(0, Some(&handle), None, &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, ConfirmationOutcome::Confirmed);
        // ticks at 0, 200, 400 see it pending; 600 sees it included
        assert_eq!(record.polls, 4);
        assert!(record.latency >= Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_not_retried() {
        let h = harness(config(10_000, 200));
        h.client.revert_nonce(0);
        let handle = h.client.submit_raw(&account(), 0).await.unwrap();

        let record = h
            .tracker
            .track(0, Some(&handle), None, &CancellationToken::new())
            .await;
        assert_eq!(
            record.outcome,
            ConfirmationOutcome::Failed(FailureKind::Reverted)
        );
        assert_eq!(record.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_node_fails_without_polling() {
        let h = harness(config(10_000, 200));
        let handle = h.client.submit_raw(&account(), 0).await.unwrap();

        let start = Instant::now();
        let record = h
            .tracker
            .track(3, Some(&handle), None, &CancellationToken::new())
            .await;
        assert_eq!(
            record.outcome,
            ConfirmationOutcome::Failed(FailureKind::UnknownNode(3))
        );
        assert_eq!(record.polls, 0);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_receipt_times_out_distinctly() {
        let h = harness(config(1_000, 150));
        h.client.set_inclusion_delay(Duration::from_secs(3600));
        let handle = h.client.submit_raw(&account(), 0).await.unwrap();

        let start = Instant::now();
        let record = h
            .tracker
            .track(0, Some(&handle), None, &CancellationToken::new())
            .await;
        assert_eq!(
            record.outcome,
            ConfirmationOutcome::TimedOut(TimeoutCause::Deadline)
        );
        assert!(Instant::now() - start >= Duration::from_millis(1_000));
        assert!(record.polls >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_jump_is_a_hard_failure() {
        let h = harness(config(10_000, 200));
        h.client.set_nonce(&account(), 7);

        let expectation = NonceExpectation {
            account: account(),
            expected: 5,
        };
        let record = h
            .tracker
            .track_nonce_only(0, &expectation, &CancellationToken::new())
            .await;
        assert_eq!(
            record.outcome,
            ConfirmationOutcome::Failed(FailureKind::NonceJump {
                expected: 5,
                observed: 7
            })
        );
        assert_eq!(record.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_reaching_expectation_confirms() {
        let h = harness(config(10_000, 200));
        h.client.set_nonce(&account(), 4);
        let client = h.client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            client.set_nonce(&AccountId::new("0xabc"), 5);
        });

        let expectation = NonceExpectation {
            account: account(),
            expected: 5,
        };
        let record = h
            .tracker
            .track_nonce_only(0, &expectation, &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, ConfirmationOutcome::Confirmed);
        assert!(record.polls >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling_promptly() {
        let h = harness(config(60_000, 1_000));
        h.client.set_inclusion_delay(Duration::from_secs(3600));
        let handle = h.client.submit_raw(&account(), 0).await.unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let record = h.tracker.track(0, Some(&handle), None, &token).await;
        assert_eq!(
            record.outcome,
            ConfirmationOutcome::TimedOut(TimeoutCause::Cancelled)
        );
        assert!(Instant::now() - start < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let h = harness(config(10_000, 100));
        h.client.fail_next_receipt_lookups(2);
        let handle = h.client.submit_raw(&account(), 0).await.unwrap();

        let record = h
            .tracker
            .track(0, Some(&handle), None, &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, ConfirmationOutcome::Confirmed);
        assert_eq!(record.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_current_nonce() {
        let h = harness(TrackerConfig::default());
        h.client.set_nonce(&account(), 11);
        let nonce = h
            .tracker
            .current_nonce(&account(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(nonce, 11);
    }
}
