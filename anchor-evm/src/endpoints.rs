use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use passport_anchor_service::Error;
use passport_metrics::Recorder;

use crate::{
    config::EndpointConfig,
    metrics::{Metrics, ProbeEvent},
};

/// Builds a client for an endpoint url and proves the endpoint is alive.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    /// Connect to `url` and run a liveness probe against it.
    async fn connect(&self, url: &str) -> anyhow::Result<Self::Client>;
}

/// A validated endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint<T> {
    pub url: String,
    pub client: T,
}

struct Cached<T> {
    endpoint: Endpoint<T>,
    validated_at: Instant,
}

struct State<T> {
    cached: Option<Cached<T>>,
    /// Endpoints skipped until the instant, after a failed probe or a transport error.
    open_until: HashMap<String, Instant>,
}

/// Picks the first live endpoint from a priority ordered pool.
///
/// The chosen endpoint is cached for a bounded time. An endpoint that fails is moved behind the
/// healthy ones for a cooldown period. It is still probed, in priority order, when every endpoint
/// ahead of it has failed.
pub struct EndpointSelector<C: Connector> {
    urls: Vec<String>,
    connector: C,
    config: EndpointConfig,
    state: std::sync::Mutex<State<C::Client>>,
    probing: tokio::sync::Mutex<()>,
    metrics: Metrics,
}

impl<C: Connector> EndpointSelector<C> {
    pub fn new(urls: Vec<String>, connector: C, config: EndpointConfig, metrics: Metrics) -> Self {
        Self {
            urls,
            connector,
            config,
            state: std::sync::Mutex::new(State {
                cached: None,
                open_until: HashMap::new(),
            }),
            probing: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<C::Client>> {
        // The state holds no invariant a panicking holder could break.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self) -> Option<Endpoint<C::Client>> {
        let state = self.state();
        state
            .cached
            .as_ref()
            .filter(|c| c.validated_at.elapsed() < self.config.cache_ttl)
            .map(|c| c.endpoint.clone())
    }

    /// Return a live endpoint, probing candidates in priority order when the cache is stale.
    pub async fn get_working_endpoint(&self) -> Result<Endpoint<C::Client>, Error> {
        if let Some(endpoint) = self.cached() {
            return Ok(endpoint);
        }
        let _probing = self.probing.lock().await;
        // Another caller may have probed while this one waited.
        if let Some(endpoint) = self.cached() {
            return Ok(endpoint);
        }

        let candidates: Vec<String> = {
            let state = self.state();
            let now = Instant::now();
            let (closed, cooling): (Vec<&String>, Vec<&String>) = self
                .urls
                .iter()
                .partition(|u| state.open_until.get(*u).map_or(true, |until| *until <= now));
            if !cooling.is_empty() {
                debug!(cooling = cooling.len(), "endpoints in cooldown are tried last");
            }
            closed.into_iter().chain(cooling).cloned().collect()
        };

        let mut last_error = None;
        for url in candidates {
            match self.probe(&url).await {
                Ok(client) => {
                    let endpoint = Endpoint {
                        url: url.clone(),
                        client,
                    };
                    let mut state = self.state();
                    state.open_until.remove(&url);
                    state.cached = Some(Cached {
                        endpoint: endpoint.clone(),
                        validated_at: Instant::now(),
                    });
                    info!(host = %ProbeEvent::new(&url, true).host, "using rpc endpoint");
                    return Ok(endpoint);
                }
                Err(err) => {
                    self.open(&url);
                    last_error = Some(err);
                }
            }
        }
        Err(Error::NoAvailableEndpoint(match last_error {
            Some(err) => format!("all {} endpoints failed, last error: {err:#}", self.urls.len()),
            None => "no endpoints configured".to_owned(),
        }))
    }

    async fn probe(&self, url: &str) -> anyhow::Result<C::Client> {
        let res = match tokio::time::timeout(self.config.probe_timeout, self.connector.connect(url))
            .await
        {
            Ok(res) => res,
            Err(_) => Err(anyhow::anyhow!(
                "probe timed out after {:?}",
                self.config.probe_timeout
            )),
        };
        let event = ProbeEvent::new(url, res.is_ok());
        if let Err(err) = &res {
            warn!(host = %event.host, %err, "rpc endpoint probe failed");
        }
        self.metrics.record(&event);
        res
    }

    fn open(&self, url: &str) {
        let mut state = self.state();
        state
            .open_until
            .insert(url.to_owned(), Instant::now() + self.config.cooldown);
        if state
            .cached
            .as_ref()
            .is_some_and(|c| c.endpoint.url == url)
        {
            state.cached = None;
        }
    }

    /// Drop the endpoint from the cache and skip it for the cooldown period. Called after a
    /// transport level failure.
    pub fn invalidate(&self, url: &str) {
        warn!(host = %ProbeEvent::new(url, false).host, "invalidating rpc endpoint");
        self.open(url);
    }

    /// Probe the cached endpoint again and drop it when the probe fails. Selection is not blocked
    /// while the probe runs.
    pub async fn revalidate(&self) {
        let Some(url) = self.state().cached.as_ref().map(|c| c.endpoint.url.clone()) else {
            return;
        };
        match self.probe(&url).await {
            Ok(client) => {
                let mut state = self.state();
                if let Some(cached) = state.cached.as_mut().filter(|c| c.endpoint.url == url) {
                    cached.endpoint.client = client;
                    cached.validated_at = Instant::now();
                }
            }
            Err(_) => self.open(&url),
        }
    }

    /// Revalidate the cached endpoint every `interval` until the handle is aborted.
    pub fn spawn_revalidation(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.revalidate().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_log::test;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct FakeConnector {
        behavior: Mutex<HashMap<String, Behavior>>,
        probes: Mutex<Vec<String>>,
    }

    impl FakeConnector {
        fn with(endpoints: &[(&str, Behavior)]) -> Self {
            let connector = Self::default();
            for (url, behavior) in endpoints {
                connector.set(url, *behavior);
            }
            connector
        }

        fn set(&self, url: &str, behavior: Behavior) {
            self.behavior
                .lock()
                .unwrap()
                .insert(url.to_owned(), behavior);
        }
    }

    #[async_trait]
    impl Connector for Arc<FakeConnector> {
        type Client = String;

        async fn connect(&self, url: &str) -> anyhow::Result<String> {
            self.probes.lock().unwrap().push(url.to_owned());
            let behavior = self.behavior.lock().unwrap().get(url).copied();
            match behavior {
                Some(Behavior::Ok) => Ok(url.to_owned()),
                Some(Behavior::Hang) => std::future::pending().await,
                Some(Behavior::Fail) | None => Err(anyhow::anyhow!("connection refused")),
            }
        }
    }

    fn selector(
        endpoints: &[(&str, Behavior)],
    ) -> (EndpointSelector<Arc<FakeConnector>>, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::with(endpoints));
        let urls = endpoints.iter().map(|(u, _)| u.to_string()).collect();
        (
            EndpointSelector::new(
                urls,
                connector.clone(),
                EndpointConfig::default(),
                Metrics::default(),
            ),
            connector,
        )
    }

    fn probes(connector: &FakeConnector) -> Vec<String> {
        std::mem::take(&mut *connector.probes.lock().unwrap())
    }

    #[test(tokio::test)]
    async fn first_live_endpoint_wins() {
        let (selector, connector) = selector(&[
            ("http://a", Behavior::Fail),
            ("http://b", Behavior::Ok),
            ("http://c", Behavior::Ok),
        ]);
        let endpoint = selector.get_working_endpoint().await.unwrap();
        assert_eq!(endpoint.url, "http://b");
        assert_eq!(probes(&connector), vec!["http://a", "http://b"]);

        // cached
        let endpoint = selector.get_working_endpoint().await.unwrap();
        assert_eq!(endpoint.url, "http://b");
        assert!(probes(&connector).is_empty());
    }

    #[test(tokio::test)]
    async fn all_failing_is_one_error() {
        let (selector, connector) =
            selector(&[("http://a", Behavior::Fail), ("http://b", Behavior::Fail)]);
        let err = selector.get_working_endpoint().await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableEndpoint(_)), "{err}");
        assert_eq!(probes(&connector), vec!["http://a", "http://b"]);

        // Both are cooling down, so both are probed again.
        assert!(selector.get_working_endpoint().await.is_err());
        assert_eq!(probes(&connector), vec!["http://a", "http://b"]);
    }

    #[test(tokio::test)]
    async fn failed_endpoint_cools_down() {
        tokio::time::pause();
        let (selector, connector) = selector(&[
            ("http://a", Behavior::Fail),
            ("http://b", Behavior::Ok),
            ("http://c", Behavior::Ok),
        ]);
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://b"
        );
        probes(&connector);

        selector.invalidate("http://b");
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://c"
        );
        assert_eq!(probes(&connector), vec!["http://c"]);

        // Cache expired, a and b still cooling down.
        tokio::time::advance(Duration::from_secs(31)).await;
        connector.set("http://a", Behavior::Ok);
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://c"
        );
        assert_eq!(probes(&connector), vec!["http://c"]);

        // Cooldown over, a is preferred again.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://a"
        );
        assert_eq!(probes(&connector), vec!["http://a"]);
    }

    #[test(tokio::test)]
    async fn cooling_endpoints_are_tried_after_healthy_ones_fail() {
        tokio::time::pause();
        let (selector, connector) =
            selector(&[("http://a", Behavior::Fail), ("http://b", Behavior::Ok)]);
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://b"
        );
        probes(&connector);

        tokio::time::advance(Duration::from_secs(40)).await;
        selector.invalidate("http://b");
        tokio::time::advance(Duration::from_secs(25)).await;

        // a left its cooldown and still fails, b is cooling down but live.
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://b"
        );
        assert_eq!(probes(&connector), vec!["http://a", "http://b"]);
    }

    #[test(tokio::test)]
    async fn hanging_probe_times_out() {
        tokio::time::pause();
        let (selector, connector) =
            selector(&[("http://a", Behavior::Hang), ("http://b", Behavior::Ok)]);
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://b"
        );
        assert_eq!(probes(&connector), vec!["http://a", "http://b"]);
    }

    #[test(tokio::test)]
    async fn revalidation_drops_dead_endpoint() {
        let (selector, connector) =
            selector(&[("http://a", Behavior::Ok), ("http://b", Behavior::Ok)]);
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://a"
        );
        connector.set("http://a", Behavior::Fail);
        selector.revalidate().await;
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://b"
        );
    }

    #[test(tokio::test)]
    async fn revalidation_does_not_hold_up_selection() {
        tokio::time::pause();
        let (selector, connector) =
            selector(&[("http://b", Behavior::Fail), ("http://a", Behavior::Ok)]);
        let selector = Arc::new(selector);
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://a"
        );

        connector.set("http://a", Behavior::Hang);
        connector.set("http://b", Behavior::Ok);
        tokio::time::advance(Duration::from_secs(61)).await;
        let revalidation = tokio::spawn({
            let selector = selector.clone();
            async move { selector.revalidate().await }
        });
        tokio::task::yield_now().await;

        let start = Instant::now();
        assert_eq!(
            selector.get_working_endpoint().await.unwrap().url,
            "http://b"
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        revalidation.await.unwrap();
    }
}
