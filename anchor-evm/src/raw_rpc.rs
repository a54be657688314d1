use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Plain JSON-RPC over HTTP, without the typed provider layer.
///
/// Used as the fallback path when the typed provider fails to decode a node's response or takes
/// too long.
#[derive(Debug, Clone)]
pub struct RawRpcClient {
    url: String,
    client: reqwest::Client,
    next_id: std::sync::Arc<AtomicU64>,
}

impl RawRpcClient {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
            next_id: Default::default(),
        }
    }

    /// Call `method` and decode its result. A missing result decodes from `null`, so `Option`
    /// targets read absent objects as `None`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .error_for_status()
            .with_context(|| format!("{method} returned an error status"))?
            .json()
            .await
            .with_context(|| format!("{method} returned invalid json"))?;

        if let Some(err) = response.error {
            return Err(anyhow!("{method} failed ({}): {}", err.code, err.message));
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        debug!(method, %result, "raw rpc response");
        serde_json::from_value(result).with_context(|| format!("{method} returned an unexpected result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U64;
    use serde_json::json;
    use test_log::test;

    async fn mock_server(result: serde_json::Value) -> wiremock::MockServer {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(result))
            .mount(&server)
            .await;
        server
    }

    #[test(tokio::test)]
    async fn decodes_result() {
        let server = mock_server(json!({"jsonrpc": "2.0", "id": 1, "result": "0x69b5b"})).await;
        let client = RawRpcClient::new(server.uri(), reqwest::Client::new());
        let block: U64 = client.request("eth_blockNumber", json!([])).await.unwrap();
        assert_eq!(block.to::<u64>(), 0x69b5b);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["method"], "eth_blockNumber");
        assert_eq!(body["jsonrpc"], "2.0");
    }

    #[test(tokio::test)]
    async fn null_result_is_none() {
        let server = mock_server(json!({"jsonrpc": "2.0", "id": 1, "result": null})).await;
        let client = RawRpcClient::new(server.uri(), reqwest::Client::new());
        let receipt: Option<serde_json::Value> = client
            .request("eth_getTransactionReceipt", json!(["0x01"]))
            .await
            .unwrap();
        assert!(receipt.is_none());
    }

    #[test(tokio::test)]
    async fn error_object_is_an_error() {
        let server = mock_server(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32000, "message": "header not found"}
        }))
        .await;
        let client = RawRpcClient::new(server.uri(), reqwest::Client::new());
        let err = client
            .request::<String>("eth_blockNumber", json!([]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("header not found"), "{err}");
    }
}
