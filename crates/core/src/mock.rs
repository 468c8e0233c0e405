//! In-process stand-ins for the node client and signer.
//!
//! Several [`MockNodeClient`]s can share one [`MockChain`], so a payload
//! submitted through one node is visible (receipt and nonce) through the
//! others. Payloads are included once `inclusion_delay` has passed since
//! submission and the account's nonce has reached theirs.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use crate::{
    client::{
        AccountId, ClientError, NodeClient, PayloadSigner, ReceiptHandle, ReceiptStatus,
        SignedPayload,
    },
    dispatch::DispatchJob,
};

#[derive(Debug)]
struct MockTx {
    handle: String,
    account: AccountId,
    nonce: u64,
    submitted_at: Instant,
    revert: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    nonces: HashMap<AccountId, u64>,
    pending: Vec<MockTx>,
    receipts: HashMap<String, ReceiptStatus>,
    revert_nonces: HashSet<u64>,
    inclusion_delay: Duration,
    next_handle: u64,
}

impl ChainState {
    /// Includes every pending tx whose delay has passed and whose nonce is next in line.
    fn mine(&mut self, now: Instant) {
        loop {
            let ready = self.pending.iter().position(|tx| {
                now.saturating_duration_since(tx.submitted_at) >= self.inclusion_delay
                    && self.nonces.get(&tx.account).copied().unwrap_or_default() == tx.nonce
            });
            let Some(i) = ready else {
                break;
            };
            let tx = self.pending.swap_remove(i);
            let status = if tx.revert {
                ReceiptStatus::Failed
            } else {
                ReceiptStatus::Success
            };
            self.receipts.insert(tx.handle, status);
            *self.nonces.entry(tx.account).or_default() += 1;
        }
    }
}

/// Shared ledger behind one or more mock nodes.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A new node client backed by this chain.
    pub fn node(self: &Arc<Self>) -> MockNodeClient {
        MockNodeClient::on_chain(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_nonce(&self, account: &AccountId, nonce: u64) {
        self.state().nonces.insert(account.clone(), nonce);
    }

    pub fn nonce(&self, account: &AccountId) -> u64 {
        let mut state = self.state();
        state.mine(Instant::now());
        state.nonces.get(account).copied().unwrap_or_default()
    }

    pub fn set_inclusion_delay(&self, delay: Duration) {
        self.state().inclusion_delay = delay;
    }

    /// Payloads carrying `nonce` are included with a failed receipt.
    pub fn revert_nonce(&self, nonce: u64) {
        self.state().revert_nonces.insert(nonce);
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }
}

/// Scriptable node client. Faults are per node; ledger state lives in the chain.
#[derive(Debug)]
pub struct MockNodeClient {
    chain: Arc<MockChain>,
    submitted: AtomicU64,
    reject_submissions: AtomicU64,
    panic_submissions: AtomicU64,
    failing_receipt_lookups: AtomicU64,
    submit_latency: Mutex<(Duration, Duration)>,
}

impl Default for MockNodeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNodeClient {
    /// A node on its own private chain.
    pub fn new() -> Self {
        Self::on_chain(MockChain::new())
    }

    pub fn on_chain(chain: Arc<MockChain>) -> Self {
        Self {
            chain,
            submitted: AtomicU64::new(0),
            reject_submissions: AtomicU64::new(0),
            panic_submissions: AtomicU64::new(0),
            failing_receipt_lookups: AtomicU64::new(0),
            submit_latency: Mutex::new((Duration::ZERO, Duration::ZERO)),
        }
    }

    pub fn chain(&self) -> &Arc<MockChain> {
        &self.chain
    }

    /// Payloads accepted by this node.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn set_nonce(&self, account: &AccountId, nonce: u64) {
        self.chain.set_nonce(account, nonce);
    }

    pub fn set_inclusion_delay(&self, delay: Duration) {
        self.chain.set_inclusion_delay(delay);
    }

    pub fn revert_nonce(&self, nonce: u64) {
        self.chain.revert_nonce(nonce);
    }

    pub fn reject_next_submissions(&self, count: u64) {
        self.reject_submissions.store(count, Ordering::Relaxed);
    }

    pub fn panic_on_next_submissions(&self, count: u64) {
        self.panic_submissions.store(count, Ordering::Relaxed);
    }

    pub fn fail_next_receipt_lookups(&self, count: u64) {
        self.failing_receipt_lookups.store(count, Ordering::Relaxed);
    }

    /// Each submission takes `base` plus a uniform jitter up to `jitter`.
    pub fn set_submit_latency(&self, base: Duration, jitter: Duration) {
        *self
            .submit_latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (base, jitter);
    }

    /// Submits a payload for `account` at `nonce` without going through a signer.
    pub async fn submit_raw(
        &self,
        account: &AccountId,
        nonce: u64,
    ) -> Result<ReceiptHandle, ClientError> {
        self.submit(&SignedPayload {
            account: account.clone(),
            nonce,
            bytes: vec![],
        })
        .await
    }

    fn take_one(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn latency(&self) -> Duration {
        let (base, jitter) = *self
            .submit_latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if jitter.is_zero() {
            return base;
        }
        base + jitter.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn submit(&self, payload: &SignedPayload) -> Result<ReceiptHandle, ClientError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if Self::take_one(&self.panic_submissions) {
            panic!("mock node crashed while submitting nonce {}", payload.nonce);
        }
        if Self::take_one(&self.reject_submissions) {
            return Err(ClientError::Rejected("mock rejection".to_owned()));
        }

        let now = Instant::now();
        let mut state = self.chain.state();
        state.mine(now);
        let current = state
            .nonces
            .get(&payload.account)
            .copied()
            .unwrap_or_default();
        if payload.nonce < current {
            return Err(ClientError::Rejected(format!(
                "nonce too low: next nonce {current}, tx nonce {}",
                payload.nonce
            )));
        }
        state.next_handle += 1;
        let handle = format!("0x{:064x}", state.next_handle);
        let revert = state.revert_nonces.contains(&payload.nonce);
        state.pending.push(MockTx {
            handle: handle.clone(),
            account: payload.account.clone(),
            nonce: payload.nonce,
            submitted_at: now,
            revert,
        });
        state.mine(now);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(ReceiptHandle(handle))
    }

    async fn get_receipt(&self, handle: &ReceiptHandle) -> Result<ReceiptStatus, ClientError> {
        if Self::take_one(&self.failing_receipt_lookups) {
            return Err(ClientError::Transport("mock receipt lookup failure".to_owned()));
        }
        let mut state = self.chain.state();
        state.mine(Instant::now());
        Ok(state
            .receipts
            .get(&handle.0)
            .copied()
            .unwrap_or(ReceiptStatus::Pending))
    }

    async fn get_nonce(&self, account: &AccountId) -> Result<u64, ClientError> {
        Ok(self.chain.nonce(account))
    }
}

/// Produces payloads that carry the job's account and nonce verbatim.
#[derive(Debug, Default)]
pub struct MockSigner {
    failing_jobs: Mutex<HashSet<u64>>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signing the job with this id fails.
    pub fn fail_job(&self, id: u64) {
        self.failing_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }
}

#[async_trait]
impl PayloadSigner for MockSigner {
    async fn sign(&self, job: &DispatchJob) -> Result<SignedPayload, ClientError> {
        let failing = self
            .failing_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job.id);
        if failing {
            return Err(ClientError::Signing(format!("no key for job {}", job.id)));
        }
        Ok(SignedPayload {
            account: job.account.clone(),
            nonce: job.nonce,
            bytes: format!("{}:{}:{}:{}", job.account, job.nonce, job.target, job.amount)
                .into_bytes(),
        })
    }
}
