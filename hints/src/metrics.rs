use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [crate::lifecycle::Manager].
#[derive(Debug, Default)]
pub struct Metrics {
    /// Number of constructions started
    pub created: Counter,
    /// Number of constructions that adopted a scheme
    pub completed: Counter,
    /// Number of constructions abandoned by a superseding transition
    pub abandoned: Counter,
    /// Number of gossiped records applied to state
    pub accepted: Counter,
    /// Number of gossiped records rejected at ingestion
    pub rejected: Counter,
    /// Id of the construction currently used for signing
    pub signing: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given
    /// context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "created",
            "Number of constructions started",
            metrics.created.clone(),
        );
        context.register(
            "completed",
            "Number of constructions that adopted a scheme",
            metrics.completed.clone(),
        );
        context.register(
            "abandoned",
            "Number of constructions abandoned by a superseding transition",
            metrics.abandoned.clone(),
        );
        context.register(
            "accepted",
            "Number of gossiped records applied to state",
            metrics.accepted.clone(),
        );
        context.register(
            "rejected",
            "Number of gossiped records rejected at ingestion",
            metrics.rejected.clone(),
        );
        context.register(
            "signing",
            "Id of the construction currently used for signing",
            metrics.signing.clone(),
        );
        metrics
    }
}
