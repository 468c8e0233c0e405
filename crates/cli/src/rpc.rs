//! JSON-RPC adapters backing the engine's node client and signer traits.

use std::{collections::HashMap, str::FromStr};

use alloy::{
    eips::Encodable2718,
    network::{EthereumWallet, ReceiptResponse, TransactionBuilder},
    primitives::{Address, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use pacer_core::{
    client::ClientError, AccountId, DispatchJob, NodeClient, PayloadSigner, ReceiptHandle,
    ReceiptStatus, SignedPayload,
};
use tracing::debug;
use url::Url;

/// Gas limit of a plain value transfer.
const TRANSFER_GAS: u64 = 21_000;

fn classify(err: RpcError<TransportErrorKind>) -> ClientError {
    match err {
        RpcError::ErrorResp(payload) => ClientError::Rejected(payload.message.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}

pub struct AlloyNodeClient {
    url: Url,
    provider: DynProvider,
}

impl AlloyNodeClient {
    pub fn new(url: Url) -> Self {
        let provider = DynProvider::new(ProviderBuilder::new().connect_http(url.clone()));
        Self { url, provider }
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }
}

#[async_trait]
impl NodeClient for AlloyNodeClient {
    async fn submit(&self, payload: &SignedPayload) -> Result<ReceiptHandle, ClientError> {
        let pending = self
            .provider
            .send_raw_transaction(&payload.bytes)
            .await
            .map_err(classify)?;
        let hash = *pending.tx_hash();
        debug!(
            node = %self.url,
            account = %payload.account,
            nonce = payload.nonce,
            %hash,
            "sent tx"
        );
        Ok(ReceiptHandle(hash.to_string()))
    }

    async fn get_receipt(&self, handle: &ReceiptHandle) -> Result<ReceiptStatus, ClientError> {
        let hash = TxHash::from_str(&handle.0)
            .map_err(|e| ClientError::InvalidRequest(format!("bad tx hash {handle}: {e}")))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(classify)?;
        Ok(match receipt {
            None => ReceiptStatus::Pending,
            Some(receipt) if receipt.status() => ReceiptStatus::Success,
            Some(_) => ReceiptStatus::Failed,
        })
    }

    async fn get_nonce(&self, account: &AccountId) -> Result<u64, ClientError> {
        let address = Address::from_str(account.as_str())
            .map_err(|e| ClientError::InvalidRequest(format!("bad address {account}: {e}")))?;
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(classify)
    }
}

/// Signs legacy value transfers for a fixed set of local keys.
pub struct AlloySigner {
    wallets: HashMap<AccountId, EthereumWallet>,
    chain_id: u64,
    gas_price: u128,
}

impl AlloySigner {
    pub fn new(signers: &[PrivateKeySigner], chain_id: u64, gas_price: u128) -> Self {
        let wallets = signers
            .iter()
            .map(|s| (account_id(s.address()), EthereumWallet::from(s.clone())))
            .collect();
        Self {
            wallets,
            chain_id,
            gas_price,
        }
    }

    /// Reads chain id and gas price from `provider`, paying `gas_price_percent_add`
    /// percent above the node's suggestion.
    pub async fn from_provider(
        signers: &[PrivateKeySigner],
        provider: &DynProvider,
        gas_price_percent_add: u16,
    ) -> Result<Self, RpcError<TransportErrorKind>> {
        let chain_id = provider.get_chain_id().await?;
        let gas_price = provider.get_gas_price().await?;
        let gas_price = gas_price + gas_price * u128::from(gas_price_percent_add) / 100;
        Ok(Self::new(signers, chain_id, gas_price))
    }
}

#[async_trait]
impl PayloadSigner for AlloySigner {
    async fn sign(&self, job: &DispatchJob) -> Result<SignedPayload, ClientError> {
        let wallet = self
            .wallets
            .get(&job.account)
            .ok_or_else(|| ClientError::Signing(format!("no key for {}", job.account)))?;
        let from = Address::from_str(job.account.as_str())
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        let to = Address::from_str(&job.target)
            .map_err(|e| ClientError::InvalidRequest(format!("bad target {}: {e}", job.target)))?;

        let tx = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_value(U256::from(job.amount))
            .with_nonce(job.nonce)
            .with_chain_id(self.chain_id)
            .with_gas_limit(TRANSFER_GAS)
            .with_gas_price(self.gas_price);
        let envelope = tx
            .build(wallet)
            .await
            .map_err(|e| ClientError::Signing(e.to_string()))?;

        Ok(SignedPayload {
            account: job.account.clone(),
            nonce: job.nonce,
            bytes: envelope.encoded_2718(),
        })
    }
}

/// Checksummed address, the account id format used throughout the CLI.
pub fn account_id(address: Address) -> AccountId {
    AccountId::new(address.to_checksum(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANVIL_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn job(account: AccountId) -> DispatchJob {
        DispatchJob {
            id: 1,
            account,
            target: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".to_owned(),
            amount: 1_000,
            nonce: 3,
            node_hint: None,
        }
    }

    #[tokio::test]
    async fn signs_transfers_for_known_keys() {
        let key = PrivateKeySigner::from_str(ANVIL_KEY).unwrap();
        let account = account_id(key.address());
        assert_eq!(account.as_str(), "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

        let signer = AlloySigner::new(&[key], 31337, 1_000_000_000);
        let payload = signer.sign(&job(account.clone())).await.unwrap();
        assert_eq!(payload.account, account);
        assert_eq!(payload.nonce, 3);
        assert!(!payload.bytes.is_empty());
    }

    #[tokio::test]
    async fn unknown_account_cannot_sign() {
        let key = PrivateKeySigner::from_str(ANVIL_KEY).unwrap();
        let signer = AlloySigner::new(&[key], 31337, 1);
        let err = signer
            .sign(&job(AccountId::new("0x0000000000000000000000000000000000000001")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Signing(_)));
    }

    #[tokio::test]
    async fn rejects_malformed_handles_without_network() {
        let client = AlloyNodeClient::new("http://127.0.0.1:1".parse().unwrap());
        let err = client
            .get_receipt(&ReceiptHandle("not-a-hash".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }
}
