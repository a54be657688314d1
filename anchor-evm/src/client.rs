use std::time::Duration;

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, Bytes, TxHash, B256, U128, U64},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::Filter,
    sol_types::SolEvent,
    transports::http::{Client, Http},
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use passport_anchor_service::TxReceipt;
use passport_metrics::Recorder;

use crate::{
    contract::Anchored,
    endpoints::Connector,
    fees::FeeSnapshot,
    metrics::{FallbackEvent, Metrics},
    raw_rpc::RawRpcClient,
    transport::with_raw_fallback,
};

/// Block fields read over raw JSON-RPC.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    timestamp: U64,
    #[serde(default)]
    base_fee_per_gas: Option<U128>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    block_number: Option<U64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    topics: Vec<B256>,
    data: Bytes,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    log_index: Option<U64>,
    #[serde(default)]
    transaction_hash: Option<B256>,
}

/// A contract log as read from either rpc path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    pub tx_hash: Option<TxHash>,
}

impl From<RawLog> for ChainLog {
    fn from(log: RawLog) -> Self {
        Self {
            topics: log.topics,
            data: log.data.to_vec(),
            block_number: log.block_number.map(|n| n.to::<u64>()),
            log_index: log.log_index.map(|n| n.to::<u64>()),
            tx_hash: log.transaction_hash,
        }
    }
}

/// Read access to one RPC endpoint.
///
/// Every read goes through the typed provider first and is retried once over raw JSON-RPC when the
/// provider fails or is slower than the fallback timeout.
#[derive(Clone)]
pub struct RpcClient {
    provider: RootProvider<Http<Client>>,
    raw: RawRpcClient,
    fallback_timeout: Duration,
    metrics: Metrics,
}

impl RpcClient {
    pub fn new(url: &str, fallback_timeout: Duration, metrics: Metrics) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid rpc url {url}"))?;
        let http = reqwest::Client::new();
        Ok(Self {
            provider: ProviderBuilder::new().on_http(parsed),
            raw: RawRpcClient::new(url, http),
            fallback_timeout,
            metrics,
        })
    }

    fn fallback_used(&self, operation: &'static str) {
        self.metrics.record(&FallbackEvent { operation });
    }

    pub async fn block_number(&self) -> Result<u64> {
        with_raw_fallback(
            "block_number",
            async { Ok::<_, anyhow::Error>(self.provider.get_block_number().await?) },
            self.fallback_timeout,
            || async {
                self.fallback_used("block_number");
                let n: U64 = self.raw.request("eth_blockNumber", json!([])).await?;
                Ok::<_, anyhow::Error>(n.to::<u64>())
            },
        )
        .await
    }

    async fn block(&self, number: BlockNumberOrTag) -> Result<Option<RawBlock>> {
        with_raw_fallback(
            "block",
            async {
                Ok::<_, anyhow::Error>(self
                    .provider
                    .raw_request::<_, Option<RawBlock>>(
                        "eth_getBlockByNumber".into(),
                        (number, false),
                    )
                    .await?)
            },
            self.fallback_timeout,
            || async {
                self.fallback_used("block");
                self.raw
                    .request("eth_getBlockByNumber", json!([number, false]))
                    .await
            },
        )
        .await
    }

    /// Unix timestamp of a block, if the node knows the block.
    pub async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>> {
        Ok(self
            .block(BlockNumberOrTag::Number(block_number))
            .await?
            .map(|b| b.timestamp.to::<u64>()))
    }

    /// Receipt of a mined transaction through the typed provider only.
    pub async fn typed_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>> {
        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        Ok(receipt.block_number.map(|block_number| TxReceipt {
            tx_hash: format!("0x{:x}", tx_hash),
            success: receipt.status(),
            block_number,
        }))
    }

    /// Receipt of a mined transaction over raw JSON-RPC only.
    pub async fn raw_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>> {
        let receipt: Option<RawReceipt> = self
            .raw
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(receipt.and_then(|r| {
            r.block_number.map(|block_number| TxReceipt {
                tx_hash: format!("0x{:x}", tx_hash),
                success: r.status == Some(U64::from(1)),
                block_number: block_number.to::<u64>(),
            })
        }))
    }

    pub async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>> {
        with_raw_fallback(
            "transaction_receipt",
            self.typed_receipt(tx_hash),
            self.fallback_timeout,
            || async {
                self.fallback_used("transaction_receipt");
                self.raw_receipt(tx_hash).await
            },
        )
        .await
    }

    /// `Anchored` logs emitted by `contract` in the inclusive block range.
    pub async fn anchored_logs(&self, contract: Address, from: u64, to: u64) -> Result<Vec<ChainLog>> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(Anchored::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);
        with_raw_fallback(
            "logs",
            async {
                let logs = self.provider.get_logs(&filter).await?;
                Ok::<_, anyhow::Error>(logs
                    .into_iter()
                    .map(|log| ChainLog {
                        topics: log.inner.data.topics().to_vec(),
                        data: log.inner.data.data.to_vec(),
                        block_number: log.block_number,
                        log_index: log.log_index,
                        tx_hash: log.transaction_hash,
                    })
                    .collect())
            },
            self.fallback_timeout,
            || async {
                self.fallback_used("logs");
                let logs: Vec<RawLog> = self
                    .raw
                    .request(
                        "eth_getLogs",
                        json!([{
                            "address": contract,
                            "topics": [Anchored::SIGNATURE_HASH],
                            "fromBlock": format!("0x{from:x}"),
                            "toBlock": format!("0x{to:x}"),
                        }]),
                    )
                    .await?;
                Ok::<_, anyhow::Error>(logs.into_iter().map(ChainLog::from).collect())
            },
        )
        .await
    }

    /// Any JSON-RPC read, for methods without a typed wrapper.
    pub async fn request<T>(&self, method: &'static str, params: serde_json::Value) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Send + Sync + Unpin + std::fmt::Debug + 'static,
    {
        with_raw_fallback(
            method,
            async {
                Ok::<_, anyhow::Error>(
                    self.provider
                        .raw_request::<_, T>(method.into(), params.clone())
                        .await?,
                )
            },
            self.fallback_timeout,
            || async {
                self.fallback_used("request");
                self.raw.request(method, params.clone()).await
            },
        )
        .await
    }

    /// Transaction count of `address` including transactions still in the node's pool.
    pub async fn pending_nonce(&self, address: Address) -> Result<u64> {
        let count: U64 = self
            .request("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        Ok(count.to::<u64>())
    }

    async fn gas_price(&self) -> Result<u128> {
        with_raw_fallback(
            "gas_price",
            async { Ok::<_, anyhow::Error>(self.provider.get_gas_price().await?) },
            self.fallback_timeout,
            || async {
                self.fallback_used("gas_price");
                let price: U128 = self.raw.request("eth_gasPrice", json!([])).await?;
                Ok::<_, anyhow::Error>(price.to::<u128>())
            },
        )
        .await
    }

    async fn eip1559_fees(&self) -> Result<(u128, u128)> {
        with_raw_fallback(
            "eip1559_fees",
            async {
                let estimate = self.provider.estimate_eip1559_fees(None).await?;
                Ok::<_, anyhow::Error>((estimate.max_fee_per_gas, estimate.max_priority_fee_per_gas))
            },
            self.fallback_timeout,
            || async {
                self.fallback_used("eip1559_fees");
                let priority: U128 = self
                    .raw
                    .request("eth_maxPriorityFeePerGas", json!([]))
                    .await?;
                let priority = priority.to::<u128>();
                let base_fee = self
                    .block(BlockNumberOrTag::Latest)
                    .await?
                    .and_then(|b| b.base_fee_per_gas)
                    .ok_or_else(|| anyhow!("latest block has no base fee"))?
                    .to::<u128>();
                Ok::<_, anyhow::Error>((base_fee.saturating_mul(2).saturating_add(priority), priority))
            },
        )
        .await
    }

    /// Current fee estimates. A value the node cannot provide is left empty and the fee strategy
    /// falls back to its floors.
    pub async fn fee_snapshot(&self) -> FeeSnapshot {
        let (eip1559, gas_price) = tokio::join!(self.eip1559_fees(), self.gas_price());
        if let Err(err) = &eip1559 {
            tracing::debug!(%err, "no eip1559 fee estimate");
        }
        let (max_fee_per_gas, max_priority_fee_per_gas) = match eip1559 {
            Ok((max, priority)) => (Some(max), Some(priority)),
            Err(_) => (None, None),
        };
        FeeSnapshot {
            max_fee_per_gas,
            max_priority_fee_per_gas,
            gas_price: gas_price.ok(),
        }
    }
}

/// Connects [`RpcClient`]s and probes them with `eth_blockNumber`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    fallback_timeout: Duration,
    metrics: Metrics,
}

impl HttpConnector {
    pub fn new(fallback_timeout: Duration, metrics: Metrics) -> Self {
        Self {
            fallback_timeout,
            metrics,
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Client = RpcClient;

    async fn connect(&self, url: &str) -> Result<RpcClient> {
        let client = RpcClient::new(url, self.fallback_timeout, self.metrics.clone())?;
        // Probe the typed path only. A node that needs the raw fallback for a block number is not
        // healthy enough to be preferred.
        client
            .provider
            .get_block_number()
            .await
            .with_context(|| format!("probe of {url} failed"))?;
        Ok(client)
    }
}
