//! JSON-RPC implementation of [`ChainClient`].

use crate::error::{Error, Result};
use crate::payment::chain::{
    confirmations_at, ChainClient, Receipt, TransferFilter, TransferLog, TRANSFER_TOPIC,
};
use crate::payment::wallet::{EvmAddress, TxHash};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Ethereum JSON-RPC client.
#[derive(Debug)]
pub struct JsonRpcChain {
    http: reqwest::Client,
    url: String,
    poll_interval: Duration,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    transaction_hash: String,
    block_number: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
}

impl JsonRpcChain {
    /// Create a client for the node at `url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(url: &str, request_timeout: Duration, poll_interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build RPC client: {e}")))?;
        Ok(Self {
            http,
            url: url.to_string(),
            poll_interval,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("RPC {} #{}", method, id);

        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id,
            }))
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{method}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{method}: bad response: {e}")))?;

        if let Some(err) = body.error {
            return Err(Error::UpstreamUnavailable(format!(
                "{method}: RPC error {}: {}",
                err.code, err.message
            )));
        }
        Ok(body.result)
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>> {
        let raw: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", json!([tx.to_string()]))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        // Pending transactions report a receipt without a block.
        let Some(block) = raw.block_number else {
            return Ok(None);
        };
        Ok(Some(Receipt {
            tx_hash: raw
                .transaction_hash
                .parse()
                .map_err(|e| Error::UpstreamUnavailable(format!("receipt hash: {e}")))?,
            block_number: parse_quantity(&block)?,
            success: raw.status.as_deref() != Some("0x0"),
        }))
    }
}

#[async_trait]
impl ChainClient for JsonRpcChain {
    async fn block_number(&self) -> Result<u64> {
        let raw: Option<String> = self.call("eth_blockNumber", json!([])).await?;
        let raw = raw.ok_or_else(|| {
            Error::UpstreamUnavailable("eth_blockNumber returned no result".to_string())
        })?;
        parse_quantity(&raw)
    }

    async fn transfer_logs(&self, filter: &TransferFilter) -> Result<Vec<TransferLog>> {
        let mut query = json!({
            "fromBlock": format!("{:#x}", filter.from_block),
            "toBlock": format!("{:#x}", filter.to_block),
            "topics": [TRANSFER_TOPIC, filter.from.to_topic(), filter.to.to_topic()],
        });
        if let Some(token) = filter.token {
            query["address"] = Value::String(token.to_string());
        }

        let logs: Vec<RpcLog> = self
            .call("eth_getLogs", json!([query]))
            .await?
            .unwrap_or_default();
        debug!(
            "eth_getLogs {}..{} returned {} transfer(s)",
            filter.from_block,
            filter.to_block,
            logs.len()
        );

        logs.iter().map(decode_transfer).collect()
    }

    async fn wait_for_confirmations(
        &self,
        tx: &TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Option<Receipt>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(receipt) = self.receipt(tx).await? {
                let latest = self.block_number().await?;
                let depth = confirmations_at(receipt.block_number, latest);
                if depth >= confirmations {
                    return Ok(Some(receipt));
                }
                trace!("{} has {}/{} confirmations", tx, depth, confirmations);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Parse a `0x`-prefixed hex quantity.
///
/// # Errors
///
/// Returns `UpstreamUnavailable` for malformed node output.
pub fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::UpstreamUnavailable(format!("bad quantity {raw:?}: {e}")))
}

/// Decode a 32-byte big-endian uint256 into `u128`, saturating.
fn decode_value(data: &str) -> Result<u128> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    let bytes = hex::decode(digits)
        .map_err(|e| Error::UpstreamUnavailable(format!("bad log data: {e}")))?;
    if bytes.len() > 32 {
        return Err(Error::UpstreamUnavailable(format!(
            "log data is {} bytes, expected at most 32",
            bytes.len()
        )));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    if word[..16].iter().any(|&b| b != 0) {
        return Ok(u128::MAX);
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

/// An indexed address is the low 20 bytes of a 32-byte topic word.
fn decode_topic_address(topic: &str) -> Result<EvmAddress> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    let word = hex::decode(digits)
        .map_err(|e| Error::UpstreamUnavailable(format!("bad address topic {topic:?}: {e}")))?;
    if word.len() != 32 {
        return Err(Error::UpstreamUnavailable(format!(
            "bad address topic {topic:?}"
        )));
    }
    let mut address = [0u8; 20];
    address.copy_from_slice(&word[12..]);
    Ok(EvmAddress::new(address))
}

fn decode_transfer(log: &RpcLog) -> Result<TransferLog> {
    if log.topics.len() < 3 {
        return Err(Error::UpstreamUnavailable(
            "transfer log without indexed addresses".to_string(),
        ));
    }
    Ok(TransferLog {
        token: log
            .address
            .parse()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad log emitter: {e}")))?,
        tx_hash: log
            .transaction_hash
            .parse()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad log tx hash: {e}")))?,
        from: decode_topic_address(&log.topics[1])?,
        to: decode_topic_address(&log.topics[2])?,
        value: decode_value(&log.data)?,
        block_number: parse_quantity(&log.block_number)?,
    })
}
