use passport_metrics::{register, Recorder};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProbeLabels {
    host: String,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FallbackLabels {
    operation: &'static str,
}

#[derive(Debug, Clone)]
/// Chain access metrics
pub struct Metrics {
    endpoint_probes: Family<ProbeLabels, Counter>,
    raw_fallbacks: Family<FallbackLabels, Counter>,
}

impl Metrics {
    /// Register and construct Metrics
    pub fn register(registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("evm");

        register!(
            endpoint_probes,
            "Number of RPC endpoint liveness probes by host and outcome",
            Family::<ProbeLabels, Counter>::default(),
            sub_registry
        );

        register!(
            raw_fallbacks,
            "Number of reads retried over raw JSON-RPC, by operation",
            Family::<FallbackLabels, Counter>::default(),
            sub_registry
        );

        Self {
            endpoint_probes,
            raw_fallbacks,
        }
    }
}

impl Default for Metrics {
    /// Metrics that are not exported anywhere.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

#[derive(Debug)]
pub struct ProbeEvent {
    /// Host of the endpoint. Never the full url, vendor urls carry api keys.
    pub host: String,
    pub ok: bool,
}

impl ProbeEvent {
    pub fn new(url: &str, ok: bool) -> Self {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_owned());
        Self { host, ok }
    }
}

impl Recorder<ProbeEvent> for Metrics {
    fn record(&self, event: &ProbeEvent) {
        self.endpoint_probes
            .get_or_create(&ProbeLabels {
                host: event.host.clone(),
                outcome: if event.ok { "ok" } else { "failed" },
            })
            .inc();
    }
}

#[derive(Debug)]
pub struct FallbackEvent {
    pub operation: &'static str,
}

impl Recorder<FallbackEvent> for Metrics {
    fn record(&self, event: &FallbackEvent) {
        self.raw_fallbacks
            .get_or_create(&FallbackLabels {
                operation: event.operation,
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_host_drops_path() {
        let event = ProbeEvent::new("https://polygon-amoy.g.alchemy.com/v2/secret", true);
        assert_eq!(event.host, "polygon-amoy.g.alchemy.com");
        assert_eq!(ProbeEvent::new("not a url", false).host, "unknown");
    }
}
