//! Interfaces to the node client and signer the engine drives.
//!
//! Transport, wire format and signature scheme all live behind these traits;
//! the engine only needs to submit a signed payload, look up its receipt and
//! read an account's nonce.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchJob;

/// Identifies an account (e.g. a checksummed address).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque handle returned by a node for a submitted payload (e.g. a tx hash).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signed, encoded payload ready to be submitted to any node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPayload {
    pub account: AccountId,
    pub nonce: u64,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("node unreachable: {0}")]
    Transport(String),

    #[error("request rejected by node: {0}")]
    Rejected(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn submit(&self, payload: &SignedPayload) -> Result<ReceiptHandle, ClientError>;

    async fn get_receipt(&self, handle: &ReceiptHandle) -> Result<ReceiptStatus, ClientError>;

    async fn get_nonce(&self, account: &AccountId) -> Result<u64, ClientError>;
}

#[async_trait]
pub trait PayloadSigner: Send + Sync {
    async fn sign(&self, job: &DispatchJob) -> Result<SignedPayload, ClientError>;
}
