use std::time::Duration;

use passport_metrics::{register, Recorder};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};

use crate::worker::JobOutcome;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SubmissionLabels {
    mode: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct JobLabels {
    outcome: &'static str,
}

#[derive(Debug, Clone)]
/// Anchoring metrics
pub struct Metrics {
    submissions: Family<SubmissionLabels, Counter>,
    job_outcomes: Family<JobLabels, Counter>,
    batch_durations: Histogram,
}

impl Metrics {
    /// Register and construct Metrics
    pub fn register(registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("anchor");

        register!(
            submissions,
            "Number of anchor submissions by mode and outcome",
            Family::<SubmissionLabels, Counter>::default(),
            sub_registry
        );

        register!(
            job_outcomes,
            "Number of anchor jobs processed by the confirmation worker, by outcome",
            Family::<JobLabels, Counter>::default(),
            sub_registry
        );

        register!(
            batch_durations,
            "Durations of confirmation batches in seconds",
            Histogram::new(exponential_buckets(0.01, 2.0, 16)),
            sub_registry
        );

        Self {
            submissions,
            job_outcomes,
            batch_durations,
        }
    }
}

#[derive(Debug)]
pub struct SubmissionEvent {
    pub mode: &'static str,
    pub outcome: &'static str,
}

impl Recorder<SubmissionEvent> for Metrics {
    fn record(&self, event: &SubmissionEvent) {
        self.submissions
            .get_or_create(&SubmissionLabels {
                mode: event.mode,
                outcome: event.outcome,
            })
            .inc();
    }
}

impl Recorder<JobOutcome> for Metrics {
    fn record(&self, event: &JobOutcome) {
        self.job_outcomes
            .get_or_create(&JobLabels {
                outcome: event.as_str(),
            })
            .inc();
    }
}

#[derive(Debug)]
pub struct BatchEvent {
    pub duration: Duration,
}

impl Recorder<BatchEvent> for Metrics {
    fn record(&self, event: &BatchEvent) {
        self.batch_durations.observe(event.duration.as_secs_f64());
    }
}
