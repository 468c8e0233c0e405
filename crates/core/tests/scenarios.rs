use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use pacer_core::{
    client::ClientError,
    dispatch::OutcomeKind,
    mock::{MockChain, MockNodeClient, MockSigner},
    AccountId, DispatchJob, Engine, EngineConfig, NodeAssignment, NodeClient, ReceiptHandle,
    ReceiptStatus, SignedPayload,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Records when each submission reached the node.
struct Recording {
    inner: MockNodeClient,
    submits: Mutex<Vec<Instant>>,
}

impl Recording {
    fn new(chain: &Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self {
            inner: chain.node(),
            submits: Mutex::new(vec![]),
        })
    }

    fn times(&self) -> Vec<Instant> {
        self.submits.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeClient for Recording {
    async fn submit(&self, payload: &SignedPayload) -> Result<ReceiptHandle, ClientError> {
        self.submits.lock().unwrap().push(Instant::now());
        self.inner.submit(payload).await
    }

    async fn get_receipt(&self, handle: &ReceiptHandle) -> Result<ReceiptStatus, ClientError> {
        self.inner.get_receipt(handle).await
    }

    async fn get_nonce(&self, account: &AccountId) -> Result<u64, ClientError> {
        self.inner.get_nonce(account).await
    }
}

fn jobs(n: u64) -> Vec<DispatchJob> {
    (0..n)
        .map(|id| DispatchJob {
            id,
            account: AccountId::new(format!("0x{id:040x}")),
            target: "0x000000000000000000000000000000000000dead".to_owned(),
            amount: 1_000,
            nonce: 0,
            node_hint: None,
        })
        .collect()
}

fn engine(nodes: &[Arc<Recording>], config: EngineConfig) -> Engine {
    let clients = nodes
        .iter()
        .map(|n| n.clone() as Arc<dyn NodeClient>)
        .collect();
    Engine::new(config, clients, Arc::new(MockSigner::new())).unwrap()
}

/// Largest number of events inside any window of `width` starting at an event.
fn max_in_window(times: &[Instant], width: Duration) -> usize {
    let mut sorted = times.to_vec();
    sorted.sort();
    (0..sorted.len())
        .map(|i| sorted[i..].iter().take_while(|t| **t - sorted[i] < width).count())
        .max()
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn four_nodes_at_500_per_second() {
    let chain = MockChain::new();
    let nodes = (0..4).map(|_| Recording::new(&chain)).collect::<Vec<_>>();
    let engine = engine(
        &nodes,
        EngineConfig {
            node_urls: (0..4).map(|i| format!("http://10.0.0.{i}:8545")).collect(),
            write_rate: 500,
            read_rate: 1_000,
            workers: 20,
            confirm_jobs: false,
            ..Default::default()
        },
    );
    assert_eq!(engine.workers(), 20);

    let start = Instant::now();
    let output = engine
        .run_jobs(jobs(1_000), &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(output.reports.len(), 1_000);
    assert_eq!(output.summary.count(OutcomeKind::Submitted), 1_000);
    assert!(
        elapsed >= Duration::from_millis(1_900) && elapsed <= Duration::from_millis(2_200),
        "took {elapsed:?}"
    );

    let mut all = vec![];
    for node in &nodes {
        let times = node.times();
        assert_eq!(times.len(), 250);
        // 125/s per node, plus at most one burst
        assert!(max_in_window(&times, Duration::from_secs(1)) <= 125 + 25);
        all.extend(times);
    }
    assert!(max_in_window(&all, Duration::from_secs(1)) <= 500 + 100);
}

#[tokio::test(start_paused = true)]
async fn four_nodes_at_500_per_second_resolve_every_confirmation() {
    let chain = MockChain::new();
    chain.set_inclusion_delay(Duration::from_millis(100));
    let nodes = (0..4).map(|_| Recording::new(&chain)).collect::<Vec<_>>();
    nodes[2].inner.reject_next_submissions(5);
    let engine = engine(
        &nodes,
        EngineConfig {
            node_urls: (0..4).map(|i| format!("http://10.0.0.{i}:8545")).collect(),
            write_rate: 500,
            read_rate: 4_000,
            workers: 20,
            confirm_jobs: true,
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let output = engine
        .run_jobs(jobs(1_000), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.reports.len(), 1_000);
    let summary = &output.summary;
    let resolved = summary.count(OutcomeKind::Confirmed)
        + summary.count(OutcomeKind::Failed)
        + summary.count(OutcomeKind::TimedOut);
    assert_eq!(resolved, 1_000);
    assert_eq!(summary.count(OutcomeKind::Failed), 5);
    assert_eq!(summary.count(OutcomeKind::Confirmed), 995);
    assert!(output.reports.iter().all(|r| r.outcome.kind() != OutcomeKind::Submitted));
    for node in &nodes {
        assert_eq!(node.times().len(), 250);
    }
}

#[tokio::test(start_paused = true)]
async fn single_node_at_10_per_second_spaces_concurrent_workers() {
    let chain = MockChain::new();
    let node = Recording::new(&chain);
    let engine = engine(
        std::slice::from_ref(&node),
        EngineConfig {
            node_urls: vec!["http://127.0.0.1:8545".to_owned()],
            write_rate: 10,
            read_rate: 10,
            workers: 5,
            confirm_jobs: false,
            ..Default::default()
        },
    );

    engine
        .run_jobs(jobs(5), &CancellationToken::new())
        .await
        .unwrap();

    let mut times = node.times();
    times.sort();
    assert_eq!(times.len(), 5);
    // at most the burst allowance goes out together, never all five
    assert!(max_in_window(&times, Duration::from_millis(100)) <= 2);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(99), "{:?}", pair[1] - pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn global_least_loaded_keeps_counts_equal() {
    let chain = MockChain::new();
    let nodes = (0..3).map(|_| Recording::new(&chain)).collect::<Vec<_>>();
    nodes[2]
        .inner
        .set_submit_latency(Duration::from_millis(40), Duration::from_millis(20));
    let engine = engine(
        &nodes,
        EngineConfig {
            node_urls: (0..3).map(|i| format!("http://10.0.0.{i}:8545")).collect(),
            write_rate: 300,
            read_rate: 300,
            workers: 12,
            assignment: NodeAssignment::GlobalLeastLoaded,
            confirm_jobs: false,
            ..Default::default()
        },
    );

    let output = engine
        .run_jobs(jobs(300), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.summary.count(OutcomeKind::Submitted), 300);
    for node in &nodes {
        assert_eq!(node.times().len(), 100);
    }
}

#[tokio::test(start_paused = true)]
async fn confirmed_run_reports_latencies() {
    let chain = MockChain::new();
    chain.set_inclusion_delay(Duration::from_millis(120));
    let nodes = (0..2).map(|_| Recording::new(&chain)).collect::<Vec<_>>();
    let engine = engine(
        &nodes,
        EngineConfig {
            node_urls: vec!["http://a:8545".to_owned(), "http://b:8545".to_owned()],
            write_rate: 200,
            read_rate: 400,
            workers: 10,
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let output = engine
        .run_jobs(jobs(50), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.summary.count(OutcomeKind::Confirmed), 50);
    let confirm = output.summary.confirmation_latency.unwrap();
    assert!(confirm.min >= Duration::from_millis(120));
    assert!(confirm.max <= Duration::from_millis(200));
    assert!(output.nodes.iter().all(|n| n.verify_count > 0));
    assert_eq!(chain.pending_count(), 0);
}
