//! JSON API over the anchor service.
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use passport_anchor_service::{
    AnchorService, BatchReport, Error, LatestAnchor, SubmitOutcome, SubmitRequest,
    TransactionStatus, Verification,
};
use passport_core::{DigestKind, Record};
use passport_metrics::MetricsHandle;

use crate::http_metrics::{self, Metrics};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Build the API router.
pub fn router(
    service: Arc<AnchorService>,
    metrics: Metrics,
    cors_allow_origins: &[String],
) -> Router {
    Router::new()
        .route("/api/v0/anchors", post(submit_anchor))
        .route("/api/v0/anchors/confirm", post(run_confirmation_batch))
        .route("/api/v0/anchors/verify", post(verify_anchor))
        .route("/api/v0/anchors/latest", post(latest_anchor_event))
        .route("/api/v0/anchors/:object_id", get(get_anchoring))
        .route("/api/v0/transactions/:tx_hash", get(transaction_status))
        .route("/metrics", get(encode_metrics))
        .route_layer(middleware::from_fn_with_state(metrics, http_metrics::track))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        .layer(cors(cors_allow_origins))
}

fn cors(allow_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allow_origins.is_empty() || allow_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(origin, %err, "ignoring invalid cors origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// An anchoring error rendered as `{error, kind}`.
#[derive(Debug)]
pub struct ApiError(Error);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Configuration(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoAvailableEndpoint(_) | Error::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Submission { .. } => StatusCode::CONFLICT,
            Error::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::OnChainFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Verification(_) | Error::Network(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        Self(value)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self(Error::InvalidArgument(value.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, err = %self.0, "request failed");
        } else {
            debug!(%status, err = %self.0, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
                kind: self.0.kind(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    record: Record,
    #[serde(default)]
    kind: DigestKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestRequest {
    record: Record,
}

async fn submit_anchor(
    State(service): State<Arc<AnchorService>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitOutcome>)> {
    let Json(request) = payload?;
    let outcome = service.submit_anchor(request).await?;
    let status = match outcome {
        SubmitOutcome::Async { .. } => StatusCode::ACCEPTED,
        SubmitOutcome::Sync { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn run_confirmation_batch(
    State(service): State<Arc<AnchorService>>,
) -> ApiResult<Json<BatchReport>> {
    Ok(Json(service.run_confirmation_batch().await?))
}

async fn verify_anchor(
    State(service): State<Arc<AnchorService>>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> ApiResult<Json<Verification>> {
    let Json(request) = payload?;
    Ok(Json(
        service.verify_anchor(&request.record, request.kind).await?,
    ))
}

async fn latest_anchor_event(
    State(service): State<Arc<AnchorService>>,
    payload: Result<Json<LatestRequest>, JsonRejection>,
) -> ApiResult<Json<Option<LatestAnchor>>> {
    let Json(request) = payload?;
    Ok(Json(service.latest_anchor_event(&request.record).await?))
}

async fn get_anchoring(
    State(service): State<Arc<AnchorService>>,
    Path(object_id): Path<String>,
) -> ApiResult<Response> {
    Ok(match service.get_anchoring(&object_id).await? {
        Some(anchoring) => Json(anchoring).into_response(),
        None => Json(json!({ "isAnchored": false })).into_response(),
    })
}

async fn transaction_status(
    State(service): State<Arc<AnchorService>>,
    Path(tx_hash): Path<String>,
) -> ApiResult<Json<TransactionStatus>> {
    Ok(Json(service.get_transaction_status(&tx_hash).await?))
}

async fn encode_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
        MetricsHandle::encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use passport_anchor_service::{
        mock::{InMemoryAnchoringStore, InMemoryJobStore, MockChain},
        ServiceConfig,
    };
    use prometheus_client::registry::Registry;
    use serde_json::Value;
    use test_log::test;
    use tower::ServiceExt;

    struct Harness {
        chain: Arc<MockChain>,
        service: Arc<AnchorService>,
        app: Router,
    }

    fn harness() -> Harness {
        let chain = Arc::new(MockChain::new());
        let service = Arc::new(AnchorService::new(
            chain.clone(),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryAnchoringStore::new()),
            ServiceConfig::default(),
            passport_anchor_service::Metrics::register(&mut Registry::default()),
        ));
        let app = router(
            service.clone(),
            Metrics::register(&mut Registry::default()),
            &["*".to_owned()],
        );
        Harness {
            chain,
            service,
            app,
        }
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body
            .map(|b| Body::from(b.to_string()))
            .unwrap_or_else(Body::empty);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn watch() -> Value {
        json!({
            "id": "obj1",
            "title": "Watch",
            "maker": "Omega",
            "year": 1969,
            "ownershipChain": [{"owner": "alice"}]
        })
    }

    fn tx(n: u64) -> String {
        format!("0x{n:064x}")
    }

    #[test(tokio::test)]
    async fn async_anchor_is_confirmed_and_verified() {
        let h = harness();
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        assert_eq!(body["mode"], "async");
        assert_eq!(body["txHash"], tx(1));
        assert!(h.service.get_job(&tx(1)).await.unwrap().is_some());

        let (status, body) = call(&h.app, Method::GET, "/api/v0/anchors/obj1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"isAnchored": false}));

        h.chain.mine(&tx(1), 1000, true);
        let (status, body) = call(&h.app, Method::POST, "/api/v0/anchors/confirm", None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["processedCount"], 1);
        assert_eq!(body["results"][0]["outcome"], "confirmed");

        let (_, body) = call(&h.app, Method::GET, "/api/v0/anchors/obj1", None).await;
        assert_eq!(body["isAnchored"], true);
        assert_eq!(body["txHash"], tx(1));
        assert_eq!(body["blockNumber"], 1000);
        assert_eq!(body["version"], 1);

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors/verify",
            Some(json!({"record": watch()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"isAnchored": true, "txHash": tx(1), "blockNumber": 1000})
        );

        // The full digest covers the ownership chain and was never anchored.
        let (_, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors/verify",
            Some(json!({"record": watch(), "kind": "full"})),
        )
        .await;
        assert_eq!(body, json!({"isAnchored": false}));

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors/latest",
            Some(json!({"record": watch()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uri"], "ipfs://bafy");
        assert_eq!(body["blockNumber"], 1000);

        let (status, body) = call(
            &h.app,
            Method::GET,
            &format!("/api/v0/transactions/{}", tx(1)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"confirmed": true, "status": "success", "blockNumber": 1000})
        );
    }

    #[test(tokio::test)]
    async fn sync_anchor_returns_block() {
        let h = harness();
        h.chain.mine_on_submit(42, true);
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 3, "mode": "sync"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["mode"], "sync");
        assert_eq!(body["blockNumber"], 42);
        assert_eq!(body["superseded"], false);
        assert_eq!(body["passportId"], json!(passport_core::PassportId::from_record_id("obj1")));

        // Stored version 3 rejects anything not newer.
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalidArgument");
    }

    #[test(tokio::test)]
    async fn unknown_state_is_not_an_error() {
        let h = harness();
        let (status, body) = call(
            &h.app,
            Method::GET,
            &format!("/api/v0/transactions/{}", tx(9)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"confirmed": false, "status": "pending"}));

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors/latest",
            Some(json!({"record": {"id": "nothing"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);

        let (status, body) = call(&h.app, Method::POST, "/api/v0/anchors/confirm", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"processedCount": 0, "results": []}));
    }

    #[test(tokio::test)]
    async fn errors_map_to_status_and_kind() {
        let h = harness();

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalidArgument");

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v0/anchors")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{"))
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 1, "mode": "sync"})),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["kind"], "confirmationTimeout");

        h.chain.break_receipts(&tx(1));
        let (status, body) = call(
            &h.app,
            Method::GET,
            &format!("/api/v0/transactions/{}", tx(1)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "network");

        h.chain.mine_on_submit(7, false);
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 1, "mode": "sync"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "onChainFailure");

        h.chain
            .reject_submissions("insufficient funds for gas * price + value");
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/api/v0/anchors",
            Some(json!({"record": watch(), "uri": "ipfs://bafy", "version": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "insufficientFunds");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("insufficient funds"));
    }

    #[test]
    fn remaining_errors_have_statuses() {
        for (err, status) in [
            (
                Error::Configuration("missing key".to_owned()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::NoAvailableEndpoint("all probes failed".to_owned()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::Verification(anyhow::anyhow!("logs")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                Error::Store(anyhow::anyhow!("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::StoreUnavailable(anyhow::anyhow!("database is locked")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ] {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test(tokio::test)]
    async fn serves_metrics() {
        let h = harness();
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            OPENMETRICS_CONTENT_TYPE
        );
    }
}
