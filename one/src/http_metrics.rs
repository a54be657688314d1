use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use passport_metrics::Recorder;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};

/// Metrics for the HTTP API
#[derive(Clone)]
pub struct Metrics {
    requests: Family<RequestLabels, Counter>,
    request_durations: Family<RequestLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    method: String,
    path: String,
    status: u16,
}

impl From<&Event> for RequestLabels {
    fn from(value: &Event) -> Self {
        Self {
            method: value.method.clone(),
            path: value.path.clone(),
            status: value.status_code,
        }
    }
}

impl Metrics {
    /// Register and construct Metrics
    pub fn register(registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("http_api");

        let requests = Family::<RequestLabels, Counter>::default();
        sub_registry.register("requests", "Number of HTTP requests", requests.clone());

        let request_durations = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 20))
        });
        sub_registry.register(
            "request_durations",
            "Duration of HTTP requests",
            request_durations.clone(),
        );

        Self {
            requests,
            request_durations,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub(crate) path: String,
    pub(crate) method: String,
    pub(crate) status_code: u16,
    pub(crate) duration: Duration,
}

impl Recorder<Event> for Metrics {
    fn record(&self, event: &Event) {
        let labels = event.into();
        self.requests.get_or_create(&labels).inc();
        self.request_durations
            .get_or_create(&labels)
            .observe(event.duration.as_secs_f64());
    }
}

/// Record every routed request. Paths are labeled by route template so object ids and
/// transaction hashes do not create new series.
pub async fn track<B>(State(metrics): State<Metrics>, req: Request<B>, next: Next<B>) -> Response {
    let start = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    metrics.record(&Event {
        path,
        method,
        status_code: response.status().as_u16(),
        duration: start.elapsed(),
    });
    response
}
