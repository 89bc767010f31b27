//! JSON-RPC ledger backend for EVM-compatible nodes.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, b256};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use super::{LedgerClient, LedgerError, Transaction, classify_error};
use crate::{
    abi,
    builder::load_bytecode,
    config::{Config, GasPriceStrategy, NetworkConfig},
    signer::Signer,
    types::DeploymentReceipt,
};

/// EIP-1967 implementation slot: `keccak256("eip1967.proxy.implementation") - 1`.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between receipt polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Ledger reached through an Ethereum JSON-RPC endpoint.
///
/// Transactions are sent with `eth_sendTransaction`, so the node must manage
/// the signer's account (Hardhat, Anvil, or a node with an unlocked key).
#[derive(Debug, Clone)]
pub struct JsonRpcLedger {
    client: reqwest::Client,
    url: String,
    chain_id: u64,
    gas_price: GasPriceStrategy,
    /// Creation code of the ERC1967 proxy, without constructor arguments.
    proxy_bytecode: Bytes,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_address: Option<Address>,
}

/// Outcome of one receipt poll.
#[derive(Debug)]
enum ReceiptPoll {
    Pending,
    Failed(LedgerError),
}

impl JsonRpcLedger {
    pub fn new(
        network: &NetworkConfig,
        gas_price: GasPriceStrategy,
        proxy_bytecode: Bytes,
    ) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: network.endpoint_url.clone(),
            chain_id: network.chain_id,
            gas_price,
            proxy_bytecode,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Build a ledger from the operator configuration, loading the proxy artifact.
    pub fn from_config(config: &Config) -> Result<Self, anyhow::Error> {
        let proxy_bytecode = load_bytecode(&config.proxy_artifact).with_context(|| {
            format!(
                "Failed to load proxy artifact {}",
                config.proxy_artifact.display()
            )
        })?;
        Self::new(&config.network, config.gas_price, proxy_bytecode)
    }

    /// Build a ledger for upgrades, which never create proxies and so do not
    /// need the proxy artifact.
    pub fn without_proxy(config: &Config) -> Result<Self, anyhow::Error> {
        Self::new(&config.network, config.gas_price, Bytes::new())
    }

    /// Ledger used only for reads; it cannot create proxies.
    pub fn read_only(network: &NetworkConfig) -> Result<Self, anyhow::Error> {
        Self::new(network, GasPriceStrategy::Auto, Bytes::new())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Check that the endpoint serves the configured chain.
    pub async fn verify_chain_id(&self) -> Result<(), LedgerError> {
        let raw: String = self.call("eth_chainId", vec![]).await?;
        let chain_id = parse_hex_u64(&raw)
            .ok_or_else(|| LedgerError::Transport(format!("invalid chain id `{raw}`")))?;
        if chain_id != self.chain_id {
            return Err(LedgerError::Transport(format!(
                "endpoint {} serves chain {} but chain {} is configured",
                self.url, chain_id, self.chain_id
            )));
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, LedgerError> {
        json_rpc_call(&self.client, &self.url, method, params).await
    }

    fn transaction_request(&self, tx: &Transaction, from: Address) -> Value {
        let (to, data): (Option<Address>, Bytes) = match tx {
            Transaction::DeployImplementation { bytecode } => (None, bytecode.clone()),
            Transaction::CreateProxy {
                implementation,
                init_data,
            } => {
                let mut data = self.proxy_bytecode.to_vec();
                data.extend(abi::encode_proxy_constructor(*implementation, init_data));
                (None, data.into())
            }
            Transaction::UpgradeProxy {
                proxy,
                implementation,
            } => (Some(*proxy), abi::encode_upgrade_to(*implementation)),
        };

        let mut request = serde_json::json!({
            "from": from,
            "data": data,
        });
        if let Some(to) = to {
            request["to"] = serde_json::json!(to);
        }
        if let Some(wei) = self.gas_price.wei() {
            request["gasPrice"] = Value::String(format!("0x{:x}", wei));
        }
        request
    }

    async fn poll_receipt(&self, tx_hash: B256) -> Result<RpcReceipt, ReceiptPoll> {
        let receipt: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", vec![serde_json::json!(tx_hash)])
            .await
            .map_err(ReceiptPoll::Failed)?;
        receipt.ok_or(ReceiptPoll::Pending)
    }
}

impl LedgerClient for JsonRpcLedger {
    async fn submit(
        &self,
        tx: &Transaction,
        signer: &Signer,
    ) -> Result<DeploymentReceipt, LedgerError> {
        if matches!(tx, Transaction::CreateProxy { .. }) && self.proxy_bytecode.is_empty() {
            return Err(LedgerError::Rejected(
                "no proxy creation code loaded; configure `proxy_artifact`".into(),
            ));
        }
        let request = self.transaction_request(tx, signer.address());
        let tx_hash: B256 = self.call("eth_sendTransaction", vec![request]).await?;

        tracing::info!(tx_hash = %tx_hash, kind = %tx.kind(), "Transaction sent, waiting for receipt");

        // Polling only reads the receipt; the transaction itself is never resent.
        // The caller's confirmation timeout bounds the loop.
        let receipt = (|| self.poll_receipt(tx_hash))
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.poll_interval)
                    .without_max_times(),
            )
            .notify(|poll, after| {
                tracing::trace!(tx_hash = %tx_hash, poll = ?poll, after = ?after, "Receipt not available yet");
            })
            .await
            .map_err(|poll| match poll {
                ReceiptPoll::Failed(err) => err,
                ReceiptPoll::Pending => LedgerError::Transport("receipt polling stopped".into()),
            })?;

        let success = receipt.status.as_deref().and_then(parse_hex_u64) == Some(1);
        Ok(DeploymentReceipt {
            transaction_hash: receipt.transaction_hash,
            block_reference: receipt.block_number.as_deref().and_then(parse_hex_u64),
            deployed_address: receipt.contract_address,
            success,
        })
    }

    async fn implementation_address(&self, proxy: Address) -> Result<Address, LedgerError> {
        let word: B256 = self
            .call(
                "eth_getStorageAt",
                vec![
                    serde_json::json!(proxy),
                    serde_json::json!(IMPLEMENTATION_SLOT),
                    serde_json::json!("latest"),
                ],
            )
            .await?;
        Ok(Address::from_slice(&word[12..]))
    }

    async fn current_account(&self, signer: &Signer) -> Result<Address, LedgerError> {
        Ok(signer.address())
    }
}

/// Parse a `0x`-prefixed hex quantity.
fn parse_hex_u64(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result. Error responses are classified into [`LedgerError`]
/// variants from their message.
pub(crate) async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, LedgerError> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| LedgerError::Transport(format!("failed to send {method} request: {e}")))?;

    let result: Value = response
        .json()
        .await
        .map_err(|e| LedgerError::Transport(format!("failed to parse {method} response: {e}")))?;

    if let Some(error) = result.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown");
        return Err(classify_error(message));
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| LedgerError::Transport(format!("no result in {method} response")))?;

    serde_json::from_value(result_value)
        .map_err(|e| LedgerError::Transport(format!("failed to deserialize {method} result: {e}")))
}
