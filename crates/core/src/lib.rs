//! Rate-controlled dispatch and confirmation engine for a fleet of RPC nodes.
//!
//! The engine admits work at a precise aggregate rate, splits that rate
//! fairly across up to 13 nodes, submits signed payloads from a bounded pool
//! of workers, and verifies their effect by polling receipts and account
//! nonces under a separate read budget.

pub mod buckets;
pub mod client;
pub mod config;
pub mod confirm;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod limiter;
pub mod metrics;
pub mod mock;
pub mod pool;
pub mod stats;
pub mod util;

pub type Result<T> = std::result::Result<T, error::Error>;

pub use client::{AccountId, NodeClient, PayloadSigner, ReceiptHandle, ReceiptStatus, SignedPayload};
pub use config::EngineConfig;
pub use dispatch::{AccountLane, DispatchJob, JobOutcome, JobReport, LaneOp, NodeAssignment};
pub use engine::{Engine, RunOutput};
pub use error::Error;
pub use stats::RunReport;
