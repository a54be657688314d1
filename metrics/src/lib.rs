//! Logging and metrics for the passport anchoring services.
//!
//! Logging goes through `tracing` with a subscriber whose output format is selected at startup.
//! Metrics are registered into a single process wide prometheus registry and are either served
//! over HTTP by the caller (see [`MetricsHandle::encode`]) or pushed to a gateway.
#[macro_use]
mod macros;
pub mod config;
mod core;

#[macro_use]
extern crate lazy_static;

use crate::config::Config;
use crate::core::CORE;
use prometheus_client::registry::Registry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, metadata::LevelFilter, warn};
use tracing_subscriber::{
    fmt::{
        self,
        format::{Compact, DefaultFields, Json, JsonFields, Pretty},
        time::SystemTime,
        FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Recorder that can record metrics about an event.
pub trait Recorder<Event> {
    /// Record the given event.
    fn record(&self, event: &Event);
}

impl<S, Event> Recorder<Event> for std::sync::Arc<S>
where
    S: Recorder<Event>,
{
    fn record(&self, event: &Event) {
        self.as_ref().record(event);
    }
}

#[derive(Debug)]
pub struct MetricsHandle {
    metrics_task: Option<JoinHandle<()>>,
}

impl MetricsHandle {
    /// Shutdown the metrics subsystem.
    pub fn shutdown(&self) {
        if let Some(mt) = &self.metrics_task {
            mt.abort();
        }
    }

    /// Initialize the tracing and metrics subsystems.
    pub async fn new(cfg: Config) -> Result<Self, Box<dyn std::error::Error>> {
        init_tracer(cfg.clone())?;
        let metrics_task = init_metrics(cfg).await;
        Ok(MetricsHandle { metrics_task })
    }

    pub fn register<T, F>(f: F) -> T
    where
        F: FnOnce(&mut Registry) -> T,
    {
        CORE.register(f)
    }

    pub fn encode() -> Vec<u8> {
        CORE.encode()
    }
}

/// Initialize the metrics subsystem.
async fn init_metrics(cfg: Config) -> Option<JoinHandle<()>> {
    if cfg.export {
        let prom_gateway_uri = format!(
            "{}/metrics/job/{}/instance/{}",
            cfg.prom_gateway_endpoint, cfg.service_name, cfg.instance_id
        );
        let push_client = reqwest::Client::new();
        return Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let buff = CORE.encode();
                let res = match push_client.post(&prom_gateway_uri).body(buff).send().await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("failed to push metrics: {}", e);
                        continue;
                    }
                };
                match res.status() {
                    reqwest::StatusCode::OK => {
                        debug!("pushed metrics to gateway");
                    }
                    status => {
                        let body = res.text().await.unwrap_or_default();
                        warn!(%status, body, "failed to push metrics to gateway");
                    }
                }
            }
        }));
    }
    None
}

// Implement a FormatEvent type that can be configured to one of a set of log formats.
struct EventFormat {
    kind: config::LogFormat,
    single: tracing_subscriber::fmt::format::Format<Compact, SystemTime>,
    multi: tracing_subscriber::fmt::format::Format<Pretty, SystemTime>,
    json: tracing_subscriber::fmt::format::Format<Json, SystemTime>,
}

impl EventFormat {
    fn new(kind: config::LogFormat) -> Self {
        Self {
            kind,
            single: fmt::format().compact(),
            multi: fmt::format().pretty(),
            json: fmt::format().json(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for EventFormat
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        writer: fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        match self.kind {
            config::LogFormat::SingleLine => self.single.format_event(ctx, writer, event),
            config::LogFormat::MultiLine => self.multi.format_event(ctx, writer, event),
            config::LogFormat::Json => self.json.format_event(ctx, writer, event),
        }
    }
}

// Implement a FormatFields type that can be configured to one of a set of log formats.
pub struct FieldsFormat {
    kind: config::LogFormat,
    default_fields: DefaultFields,
    json_fields: JsonFields,
}

impl FieldsFormat {
    pub fn new(kind: config::LogFormat) -> Self {
        Self {
            kind,
            default_fields: DefaultFields::new(),
            json_fields: JsonFields::new(),
        }
    }
}

impl<'writer> FormatFields<'writer> for FieldsFormat {
    fn format_fields<R: tracing_subscriber::prelude::__tracing_subscriber_field_RecordFields>(
        &self,
        writer: fmt::format::Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        match self.kind {
            config::LogFormat::SingleLine => self.default_fields.format_fields(writer, fields),
            config::LogFormat::MultiLine => self.default_fields.format_fields(writer, fields),
            config::LogFormat::Json => self.json_fields.format_fields(writer, fields),
        }
    }
}

/// For use in CLI tools that are writing to stdout without exporting metrics.
pub fn init_local_tracing(format: config::LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    init_tracer(Config {
        log_format: format,
        ..Default::default()
    })
}

/// Initialize the tracing subsystem.
fn init_tracer(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Default to INFO if no env is specified
    let filter_builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());

    let log_filter = filter_builder.from_env()?;

    // Configure both the fields and event formats.
    let fields_format = FieldsFormat::new(cfg.log_format.clone());
    let event_format = EventFormat::new(cfg.log_format);

    let log_subscriber = fmt::layer()
        // The JSON format ignore the ansi setting and always format without colors.
        .with_ansi(true)
        .event_format(event_format)
        .fmt_fields(fields_format)
        .with_filter(log_filter);

    tracing_subscriber::registry()
        .with(log_subscriber)
        .try_init()?;

    Ok(())
}
