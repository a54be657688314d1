use std::{future::Future, sync::Arc, time::Duration};

use alloy::{
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, TxHash},
    providers::{Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol_types::SolEvent,
    transports::RpcError,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use passport_anchor_service::{AnchorCall, AnchorChain, AnchorEvent, Error, Result, TxReceipt};
use passport_core::{Digest, PassportId};

use crate::{
    client::{ChainLog, HttpConnector, RpcClient},
    config::EvmConfig,
    contract::{anchor_calldata, Anchored},
    endpoints::{Endpoint, EndpointSelector},
    fees::FeePlan,
    metrics::Metrics,
};

/// The anchor contract on an EVM chain.
///
/// Holds the endpoint selector, the signing wallet and the contract address. Construct it once and
/// share it.
pub struct EvmAnchorChain {
    config: EvmConfig,
    contract: Address,
    signer: Option<Signer>,
    selector: Arc<EndpointSelector<HttpConnector>>,
    /// Nonce after the last transaction this process broadcast. Held across nonce assignment and
    /// broadcast.
    next_nonce: tokio::sync::Mutex<Option<u64>>,
}

struct Signer {
    wallet: EthereumWallet,
    address: Address,
}

impl EvmAnchorChain {
    /// A chain that can submit anchors.
    pub fn new(config: EvmConfig, metrics: Metrics) -> Result<Self> {
        config.validate()?;
        let key = config
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&config.private_key);
        let key = hex::decode(key)
            .map_err(|e| Error::Configuration(format!("Invalid private key hex: {e}")))?;
        let signer = PrivateKeySigner::from_slice(&key)
            .map_err(|e| Error::Configuration(format!("Invalid private key: {e}")))?;
        let address = signer.address();
        info!(%address, network = %config.network, "anchor signer loaded");
        Self::build(
            config,
            Some(Signer {
                wallet: EthereumWallet::from(signer),
                address,
            }),
            metrics,
        )
    }

    /// A chain for verification and status reads only. Submissions fail with a configuration
    /// error.
    pub fn read_only(config: EvmConfig, metrics: Metrics) -> Result<Self> {
        config.validate_read_only()?;
        Self::build(config, None, metrics)
    }

    fn build(config: EvmConfig, signer: Option<Signer>, metrics: Metrics) -> Result<Self> {
        let contract = config
            .contract_address
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid contract address: {e}")))?;
        let selector = Arc::new(EndpointSelector::new(
            config.endpoint_pool(),
            HttpConnector::new(config.endpoints.fallback_timeout, metrics.clone()),
            config.endpoints.clone(),
            metrics,
        ));
        Ok(Self {
            config,
            contract,
            signer,
            selector,
            next_nonce: tokio::sync::Mutex::new(None),
        })
    }

    /// Re-probe the cached endpoint in the background at the configured interval.
    pub fn spawn_revalidation(&self) -> JoinHandle<()> {
        self.selector
            .clone()
            .spawn_revalidation(self.config.endpoints.revalidate_interval)
    }

    async fn endpoint(&self) -> Result<Endpoint<RpcClient>> {
        self.selector.get_working_endpoint().await
    }

    /// Convert a read that failed on both rpc paths. The endpoint is skipped for a while.
    fn network_error(&self, endpoint: &Endpoint<RpcClient>, err: anyhow::Error) -> Error {
        self.selector.invalidate(&endpoint.url);
        Error::Network(err)
    }
}

fn parse_tx_hash(tx_hash: &str) -> Result<TxHash> {
    tx_hash
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("invalid transaction hash {tx_hash}: {e}")))
}

#[async_trait]
impl AnchorChain for EvmAnchorChain {
    #[instrument(skip_all, fields(passport_id = %call.passport_id, version = call.version))]
    async fn submit(&self, call: &AnchorCall) -> Result<String> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            Error::Configuration("no private key configured, submissions are disabled".to_owned())
        })?;
        let endpoint = self.endpoint().await?;

        let snapshot = endpoint.client.fee_snapshot().await;
        let plan = self
            .config
            .fees
            .plan_with_overrides(&snapshot, &call.fees);
        debug!(?snapshot, ?plan, "fees planned");
        let tx = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(anchor_calldata(call))
            .with_chain_id(self.config.network.chain_id())
            .with_gas_limit(self.config.fees.gas_limit(&call.fees));
        let tx = match plan {
            FeePlan::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => tx
                .with_max_fee_per_gas(max_fee_per_gas)
                .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
            FeePlan::Legacy { gas_price } => tx.with_gas_price(gas_price),
        };

        let url = url::Url::parse(&endpoint.url)
            .map_err(|e| Error::Configuration(format!("Invalid RPC url: {e}")))?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(signer.wallet.clone())
            .on_http(url);

        // The node's pending count misses transactions it has not seen yet, so it is only a lower
        // bound next to the nonce this process already used.
        let mut next_nonce = self.next_nonce.lock().await;
        let pending_count = endpoint
            .client
            .pending_nonce(signer.address)
            .await
            .map_err(|err| self.network_error(&endpoint, err))?;
        let nonce = next_nonce.map_or(pending_count, |next| next.max(pending_count));
        match provider.send_transaction(tx.with_nonce(nonce)).await {
            Ok(pending) => {
                *next_nonce = Some(nonce + 1);
                let tx_hash = format!("0x{:x}", pending.tx_hash());
                info!(%tx_hash, nonce, "anchor transaction sent");
                Ok(tx_hash)
            }
            Err(RpcError::Transport(err)) => {
                self.selector.invalidate(&endpoint.url);
                Err(Error::Network(anyhow!(err)))
            }
            Err(RpcError::ErrorResp(payload)) => {
                warn!(code = payload.code, message = %payload.message, "node rejected anchor transaction");
                Err(Error::submission(payload.message))
            }
            Err(err) => Err(Error::submission(err)),
        }
    }

    #[instrument(skip(self))]
    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt> {
        let hash = parse_tx_hash(tx_hash)?;
        let endpoint = self.endpoint().await?;
        let confirmation = &self.config.confirmation;
        let client = &endpoint.client;

        let primary = async {
            loop {
                if let Some(receipt) = client.typed_receipt(hash).await? {
                    return Ok::<_, anyhow::Error>(receipt);
                }
                tokio::time::sleep(confirmation.poll_interval).await;
            }
        };
        wait_with_polling_fallback(
            primary,
            confirmation.timeout,
            || client.raw_receipt(hash),
            confirmation.poll_interval,
            confirmation.poll_attempts,
        )
        .await
        .ok_or_else(|| Error::ConfirmationTimeout {
            tx_hash: tx_hash.to_owned(),
            detail: format!(
                "no receipt after waiting {:?} and {} polls",
                confirmation.timeout, confirmation.poll_attempts
            ),
        })
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>> {
        let hash = parse_tx_hash(tx_hash)?;
        let endpoint = self.endpoint().await?;
        endpoint
            .client
            .transaction_receipt(hash)
            .await
            .map_err(|err| self.network_error(&endpoint, err))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<DateTime<Utc>>> {
        let endpoint = self.endpoint().await?;
        let timestamp = endpoint
            .client
            .block_timestamp(block_number)
            .await
            .map_err(|err| self.network_error(&endpoint, err))?;
        Ok(timestamp
            .and_then(|ts| i64::try_from(ts).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0)))
    }

    #[instrument(skip(self))]
    async fn anchor_events(&self, passport_id: &PassportId) -> Result<Vec<AnchorEvent>> {
        let endpoint = self.endpoint().await?;
        let head = endpoint
            .client
            .block_number()
            .await
            .map_err(|err| self.network_error(&endpoint, err))?;

        let mut events = Vec::new();
        for (from, to) in block_ranges(self.config.start_block, head, self.config.log_chunk_size) {
            let logs = endpoint
                .client
                .anchored_logs(self.contract, from, to)
                .await
                .map_err(|err| {
                    Error::Verification(err.context(format!("reading logs of blocks {from}..={to}")))
                })?;
            events.extend(
                logs.iter()
                    .filter_map(decode_anchored)
                    .filter(|e| &e.passport_id == passport_id),
            );
        }
        debug!(count = events.len(), head, "anchor events scanned");
        Ok(events)
    }
}

fn decode_anchored(log: &ChainLog) -> Option<AnchorEvent> {
    let decoded = match Anchored::decode_raw_log(log.topics.iter().copied(), &log.data, true) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(%err, "skipping undecodable anchor log");
            return None;
        }
    };
    Some(AnchorEvent {
        passport_id: PassportId::from_bytes(decoded.passportId.0),
        digest: Digest::from_bytes(decoded.digest.0),
        algo: decoded.algo,
        uri: decoded.uri,
        version: decoded.version.saturating_to::<u64>(),
        tx_hash: log
            .tx_hash
            .map(|h| format!("0x{:x}", h))
            .unwrap_or_default(),
        block_number: log.block_number?,
        log_index: log.log_index.unwrap_or_default(),
    })
}

/// Inclusive block ranges covering `from..=to` with at most `chunk` blocks each.
pub fn block_ranges(from: u64, to: u64, chunk: u64) -> Vec<(u64, u64)> {
    let chunk = chunk.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(chunk - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

/// Wait for `primary` up to `timeout`. If it fails or times out, call `poll` up to `attempts`
/// times, `interval` apart. `None` when no receipt appeared.
pub(crate) async fn wait_with_polling_fallback<P, F, Fut>(
    primary: P,
    timeout: Duration,
    mut poll: F,
    interval: Duration,
    attempts: u32,
) -> Option<TxReceipt>
where
    P: Future<Output = anyhow::Result<TxReceipt>>,
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<TxReceipt>>>,
{
    match tokio::time::timeout(timeout, primary).await {
        Ok(Ok(receipt)) => return Some(receipt),
        Ok(Err(err)) => warn!(%err, "receipt wait failed, polling raw json-rpc"),
        Err(_) => warn!(?timeout, "receipt wait timed out, polling raw json-rpc"),
    }
    for attempt in 1..=attempts {
        match poll().await {
            Ok(Some(receipt)) => return Some(receipt),
            Ok(None) => debug!(attempt, "no receipt yet"),
            Err(err) => warn!(attempt, %err, "receipt poll failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{
        consensus::{Transaction, TxEnvelope},
        eips::eip2718::Decodable2718,
        primitives::{FixedBytes, U256},
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_log::test;

    fn receipt(block_number: u64) -> TxReceipt {
        TxReceipt {
            tx_hash: format!("0x{:064x}", 1),
            success: true,
            block_number,
        }
    }

    #[test]
    fn ranges_cover_every_block_once() {
        assert_eq!(block_ranges(0, 25_000, 10_000), vec![
            (0, 9_999),
            (10_000, 19_999),
            (20_000, 25_000)
        ]);
        assert_eq!(block_ranges(5, 5, 10_000), vec![(5, 5)]);
        assert!(block_ranges(10, 9, 10_000).is_empty());
        assert_eq!(block_ranges(0, 2, 0), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test(tokio::test)]
    async fn primary_receipt_skips_polling() {
        let polls = AtomicU32::new(0);
        let found = wait_with_polling_fallback(
            async { Ok(receipt(7)) },
            Duration::from_secs(300),
            || async {
                polls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            },
            Duration::from_secs(10),
            30,
        )
        .await;
        assert_eq!(found, Some(receipt(7)));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn timed_out_wait_polls_until_found() {
        tokio::time::pause();
        let polls = AtomicU32::new(0);
        let found = wait_with_polling_fallback(
            std::future::pending(),
            Duration::from_secs(300),
            || async {
                let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then(|| receipt(9)))
            },
            Duration::from_secs(10),
            30,
        )
        .await;
        assert_eq!(found, Some(receipt(9)));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test)]
    async fn polling_gives_up_after_attempts() {
        tokio::time::pause();
        let start = tokio::time::Instant::now();
        let polls = AtomicU32::new(0);
        let found = wait_with_polling_fallback(
            async { Err(anyhow!("deserialization error")) },
            Duration::from_secs(300),
            || async {
                polls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("connection reset"))
            },
            Duration::from_secs(10),
            30,
        )
        .await;
        assert_eq!(found, None);
        assert_eq!(polls.load(Ordering::SeqCst), 30);
        // 29 sleeps between 30 polls, each rounded up to the timer resolution.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(290) && elapsed < Duration::from_secs(291),
            "{elapsed:?}"
        );
    }

    #[test]
    fn decodes_anchored_log() {
        let event = Anchored {
            passportId: FixedBytes::from(*PassportId::from_record_id("obj1").as_bytes()),
            digest: FixedBytes::from([0x22; 32]),
            algo: "keccak256".to_owned(),
            uri: "ipfs://x".to_owned(),
            version: U256::from(2),
        };
        let log = ChainLog {
            topics: vec![Anchored::SIGNATURE_HASH],
            data: event.encode_data(),
            block_number: Some(1000),
            log_index: Some(3),
            tx_hash: Some(TxHash::with_last_byte(1)),
        };
        let decoded = decode_anchored(&log).unwrap();
        assert_eq!(decoded.passport_id, PassportId::from_record_id("obj1"));
        assert_eq!(decoded.digest, Digest::from_bytes([0x22; 32]));
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.block_number, 1000);
        assert_eq!(decoded.log_index, 3);
        assert_eq!(decoded.tx_hash, format!("0x{:064x}", 1));

        let pending = ChainLog {
            block_number: None,
            ..log.clone()
        };
        assert!(decode_anchored(&pending).is_none());
        let garbage = ChainLog {
            data: vec![1, 2, 3],
            ..log
        };
        assert!(decode_anchored(&garbage).is_none());
    }

    /// A node that answers every JSON-RPC method from a fixed table.
    async fn mock_node(responses: serde_json::Value) -> wiremock::MockServer {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(move |req: &wiremock::Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let method = body["method"].as_str().unwrap_or_default();
                let response = match responses.get(method) {
                    Some(result) => {
                        serde_json::json!({"jsonrpc": "2.0", "id": body["id"], "result": result})
                    }
                    None => serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": body["id"],
                        "error": {"code": -32601, "message": format!("method {method} not found")}
                    }),
                };
                wiremock::ResponseTemplate::new(200).set_body_json(response)
            })
            .mount(&server)
            .await;
        server
    }

    /// Bodies of the requests the node received for `method`.
    async fn requests_for(server: &wiremock::MockServer, method: &str) -> Vec<serde_json::Value> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|req| serde_json::from_slice::<serde_json::Value>(&req.body).unwrap())
            .filter(|body| body["method"] == method)
            .collect()
    }

    fn anchor_call(version: u64) -> AnchorCall {
        AnchorCall {
            passport_id: PassportId::from_record_id("obj1"),
            digest: Digest::from_bytes([0x22; 32]),
            algo: "keccak256".to_owned(),
            uri: "ipfs://x".to_owned(),
            version,
            fees: Default::default(),
        }
    }

    #[test(tokio::test)]
    async fn back_to_back_submissions_use_increasing_nonces() {
        // The node keeps reporting 5 because neither transaction reaches its pool.
        let server = mock_node(serde_json::json!({
            "eth_blockNumber": "0x10",
            "eth_gasPrice": "0x3b9aca00",
            "eth_getTransactionCount": "0x5",
            "eth_sendRawTransaction": format!("0x{:064x}", 1),
        }))
        .await;
        let chain = EvmAnchorChain::new(
            EvmConfig {
                rpc_urls: vec![server.uri()],
                private_key: "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
                    .to_owned(),
                contract_address: "0x1234567890123456789012345678901234567890".to_owned(),
                ..Default::default()
            },
            Metrics::default(),
        )
        .unwrap();

        chain.submit(&anchor_call(1)).await.unwrap();
        chain.submit(&anchor_call(2)).await.unwrap();

        let counts = requests_for(&server, "eth_getTransactionCount").await;
        assert_eq!(counts.len(), 2);
        assert!(counts.iter().all(|body| body["params"][1] == "pending"));

        let nonces: Vec<u64> = requests_for(&server, "eth_sendRawTransaction")
            .await
            .iter()
            .map(|body| {
                let raw = hex::decode(
                    body["params"][0]
                        .as_str()
                        .unwrap()
                        .trim_start_matches("0x"),
                )
                .unwrap();
                TxEnvelope::decode_2718(&mut raw.as_slice()).unwrap().nonce()
            })
            .collect();
        assert_eq!(nonces, vec![5, 6]);
    }

    #[test]
    fn read_only_chain_refuses_to_submit() {
        let chain = EvmAnchorChain::read_only(
            EvmConfig {
                contract_address: "0x1234567890123456789012345678901234567890".to_owned(),
                ..Default::default()
            },
            Metrics::default(),
        )
        .unwrap();
        assert!(chain.signer.is_none());
        assert!(matches!(
            EvmAnchorChain::new(EvmConfig::default(), Metrics::default()),
            Err(Error::Configuration(_))
        ));
    }
}
