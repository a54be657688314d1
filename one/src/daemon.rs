use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use clap::Args;
use passport_anchor_service::AnchorService;
use passport_metrics::{config::Config as MetricsConfig, MetricsHandle};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{handle_signals, http, http_metrics, AnchorOpts, ChainAccess, Info, LogOpts};

#[derive(Args, Debug)]
pub(crate) struct DaemonOpts {
    #[command(flatten)]
    pub(crate) anchor: AnchorOpts,

    /// Bind address of the API endpoint.
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:5102",
        env = "PASSPORT_ONE_BIND_ADDRESS"
    )]
    bind_address: String,

    /// Seconds between confirmation batches. 0 disables the internal trigger, leaving
    /// confirmation to callers of the confirm endpoint.
    #[arg(long, default_value_t = 60, env = "PASSPORT_ONE_CONFIRM_INTERVAL")]
    confirm_interval: u64,

    /// When true metrics will be pushed to the gateway
    #[arg(long, default_value_t = false, env = "PASSPORT_ONE_METRICS")]
    metrics: bool,

    /// Prometheus push gateway used when metrics are pushed.
    #[arg(
        long,
        default_value = "http://localhost:9091",
        env = "PASSPORT_ONE_METRICS_GATEWAY"
    )]
    metrics_gateway: String,

    /// Allowed CORS origins. Should include the transport e.g. https:// or http://.
    #[arg(
        long,
        default_values_t = vec!["*".to_string()],
        use_value_delimiter = true,
        value_delimiter = ',',
        env = "PASSPORT_ONE_CORS_ALLOW_ORIGINS"
    )]
    cors_allow_origins: Vec<String>,
}

/// Serve the API until a shutdown signal arrives.
pub(crate) async fn run(opts: DaemonOpts, log_opts: LogOpts) -> Result<()> {
    let info = Info::new();

    let mut metrics_config = MetricsConfig {
        export: opts.metrics,
        prom_gateway_endpoint: opts.metrics_gateway.clone(),
        log_format: log_opts.format(),
        ..Default::default()
    };
    info.apply_to_metrics_config(&mut metrics_config);

    let _metrics = MetricsHandle::register(|registry| {
        crate::metrics::Metrics::register(info.clone(), registry)
    });
    let http_metrics = MetricsHandle::register(http_metrics::Metrics::register);

    // Logging and metrics are initialized here,
    // debug,info etc will not work until after this line
    let metrics_handle = MetricsHandle::new(metrics_config)
        .await
        .map_err(|err| anyhow!("failed to initialize metrics: {err}"))?;
    info!(
        service__name = info.service_name,
        version = info.version,
        build = info.build,
        instance_id = info.instance_id,
    );
    debug!(?opts, "using daemon options");

    let (service, chain) = opts.anchor.service(ChainAccess::Submit).await?;
    let service = Arc::new(service);
    let revalidation_handle = chain.spawn_revalidation();

    let (shutdown_signal_tx, mut shutdown_signal) = broadcast::channel::<()>(1);
    let signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    let handle = signals.handle();

    let confirm_handle = if opts.confirm_interval > 0 {
        let interval = Duration::from_secs(opts.confirm_interval);
        info!(?interval, "starting confirmation loop");
        Some(tokio::spawn(confirm_loop(
            service.clone(),
            interval,
            shutdown_signal.resubscribe(),
        )))
    } else {
        info!("internal confirmation trigger disabled");
        None
    };

    let app = http::router(service, http_metrics, &opts.cors_allow_origins);

    debug!("starting signal handler task");
    let signals_handle = tokio::spawn(handle_signals(signals, shutdown_signal_tx));

    // The server task blocks until we are ready to start shutdown
    let addr: SocketAddr = opts.bind_address.parse()?;
    info!("starting api server at address {}", opts.bind_address);
    hyper::server::Server::try_bind(&addr)
        .map_err(|e| anyhow!("Failed to bind address: {}. {}", opts.bind_address, e))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_signal.recv().await;
        })
        .await?;
    debug!("api server finished, starting shutdown...");

    if let Some(confirm_handle) = confirm_handle {
        if let Err(err) = confirm_handle.await {
            warn!(%err, "confirmation task error");
        }
    }
    revalidation_handle.abort();

    metrics_handle.shutdown();
    debug!("metrics stopped");

    // Wait for signal handler to finish
    handle.close();
    signals_handle.await?;
    debug!("signal handler stopped");

    Ok(())
}

/// Run a confirmation batch every `interval` until shutdown. A batch in progress finishes before
/// the loop exits.
async fn confirm_loop(
    service: Arc<AnchorService>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("confirmation loop stopping");
                return;
            }
            _ = ticker.tick() => {
                match service.run_confirmation_batch().await {
                    Ok(report) => debug!(processed = report.processed_count, "confirmation tick"),
                    Err(err) => warn!(%err, "confirmation batch failed"),
                }
            }
        }
    }
}
