// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers both halves of the event store:
// - Write path: appends, version conflicts, snapshots
// - Read path: aggregate loads and replayed events
// - Dispatch: delivered events, handler failures, dead letters, batch latency
// - Retries: attempts and outcomes per operation
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry, shared by the store and the dispatcher
pub struct Metrics {
    registry: Registry,

    // Write path
    pub events_appended: IntCounterVec,
    pub append_conflicts: IntCounterVec,
    pub snapshots_taken: IntCounterVec,

    // Read path
    pub aggregates_loaded: IntCounterVec,
    pub events_replayed: IntCounterVec,

    // Dispatch
    pub events_dispatched: IntCounterVec,
    pub handler_failures: IntCounterVec,
    pub dead_letters_total: IntCounter,
    pub dead_letters_by_subscription: IntCounterVec,
    pub dispatch_batch_duration: HistogramVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_success: IntCounterVec,
    pub retry_failure: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Write path
        let events_appended = IntCounterVec::new(
            Opts::new("es_events_appended_total", "Total events appended to the store"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let append_conflicts = IntCounterVec::new(
            Opts::new("es_append_conflicts_total", "Appends rejected by the version check"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(append_conflicts.clone()))?;

        let snapshots_taken = IntCounterVec::new(
            Opts::new("es_snapshots_taken_total", "Aggregate snapshots written"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(snapshots_taken.clone()))?;

        // Read path
        let aggregates_loaded = IntCounterVec::new(
            Opts::new("es_aggregates_loaded_total", "Aggregates reconstructed from the store"),
            &["aggregate_type", "source"],
        )?;
        registry.register(Box::new(aggregates_loaded.clone()))?;

        let events_replayed = IntCounterVec::new(
            Opts::new("es_events_replayed_total", "Events folded while loading aggregates"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(events_replayed.clone()))?;

        // Dispatch
        let events_dispatched = IntCounterVec::new(
            Opts::new("es_events_dispatched_total", "Events delivered to subscription handlers"),
            &["subscription"],
        )?;
        registry.register(Box::new(events_dispatched.clone()))?;

        let handler_failures = IntCounterVec::new(
            Opts::new("es_handler_failures_total", "Subscription handler invocations that failed"),
            &["subscription", "event_kind"],
        )?;
        registry.register(Box::new(handler_failures.clone()))?;

        let dead_letters_total = IntCounter::new(
            "es_dead_letters_total",
            "Total events parked as dead letters",
        )?;
        registry.register(Box::new(dead_letters_total.clone()))?;

        let dead_letters_by_subscription = IntCounterVec::new(
            Opts::new("es_dead_letters_by_subscription", "Dead letters by subscription"),
            &["subscription"],
        )?;
        registry.register(Box::new(dead_letters_by_subscription.clone()))?;

        let dispatch_batch_duration = HistogramVec::new(
            HistogramOpts::new("es_dispatch_batch_duration_seconds", "Duration of one dispatch pass")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["subscription"],
        )?;
        registry.register(Box::new(dispatch_batch_duration.clone()))?;

        // Retry Metrics
        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_success = IntCounterVec::new(
            Opts::new("retry_success_total", "Total successful retries"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_success.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Total failed retries after all attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            append_conflicts,
            snapshots_taken,
            aggregates_loaded,
            events_replayed,
            events_dispatched,
            handler_failures,
            dead_letters_total,
            dead_letters_by_subscription,
            dispatch_batch_duration,
            retry_attempts_total,
            retry_success,
            retry_failure,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_append(&self, aggregate_type: &str, event_count: usize) {
        self.events_appended
            .with_label_values(&[aggregate_type])
            .inc_by(event_count as u64);
    }

    pub fn record_conflict(&self, aggregate_type: &str) {
        self.append_conflicts.with_label_values(&[aggregate_type]).inc();
    }

    pub fn record_snapshot(&self, aggregate_type: &str) {
        self.snapshots_taken.with_label_values(&[aggregate_type]).inc();
    }

    /// `from_snapshot` tells whether replay was seeded by a snapshot
    pub fn record_load(&self, aggregate_type: &str, replayed: usize, from_snapshot: bool) {
        let source = if from_snapshot { "snapshot" } else { "replay" };
        self.aggregates_loaded
            .with_label_values(&[aggregate_type, source])
            .inc();
        self.events_replayed
            .with_label_values(&[aggregate_type])
            .inc_by(replayed as u64);
    }

    /// Helper to record one dispatch pass
    pub fn record_batch(&self, subscription: &str, delivered: usize, duration_secs: f64) {
        self.events_dispatched
            .with_label_values(&[subscription])
            .inc_by(delivered as u64);
        self.dispatch_batch_duration
            .with_label_values(&[subscription])
            .observe(duration_secs);
    }

    pub fn record_handler_failure(&self, subscription: &str, event_kind: &str) {
        self.handler_failures
            .with_label_values(&[subscription, event_kind])
            .inc();
    }

    pub fn record_dead_letter(&self, subscription: &str) {
        self.dead_letters_total.inc();
        self.dead_letters_by_subscription
            .with_label_values(&[subscription])
            .inc();
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total
            .with_label_values(&[operation, &attempt.to_string()])
            .inc();
    }

    /// Helper to record retry outcome
    pub fn record_retry_outcome(&self, operation: &str, success: bool) {
        if success {
            self.retry_success.with_label_values(&[operation]).inc();
        } else {
            self.retry_failure.with_label_values(&[operation]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> f64 {
        let gathered = metrics.registry.gather();
        let family = gathered.iter().find(|m| m.name() == name).unwrap();
        family.metric.iter().map(|m| m.counter.value.unwrap_or(0.0)).sum()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("ApiEndpoint", 1);
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_append_and_conflict() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("ApiEndpoint", 3);
        metrics.record_append("ApiEndpoint", 2);
        metrics.record_conflict("ApiEndpoint");

        assert_eq!(counter_value(&metrics, "es_events_appended_total"), 5.0);
        assert_eq!(counter_value(&metrics, "es_append_conflicts_total"), 1.0);
    }

    #[test]
    fn test_record_load_splits_by_source() {
        let metrics = Metrics::new().unwrap();
        metrics.record_load("ApiEndpoint", 4, false);
        metrics.record_load("ApiEndpoint", 1, true);

        let gathered = metrics.registry.gather();
        let loaded = gathered.iter().find(|m| m.name() == "es_aggregates_loaded_total").unwrap();
        assert_eq!(loaded.metric.len(), 2);
        assert_eq!(counter_value(&metrics, "es_events_replayed_total"), 5.0);
    }

    #[test]
    fn test_record_retry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_retry_attempt("endpoint_projection", 1);
        metrics.record_retry_attempt("endpoint_projection", 2);
        metrics.record_retry_outcome("endpoint_projection", true);

        let gathered = metrics.registry.gather();
        let attempts = gathered.iter().find(|m| m.name() == "retry_attempts_total").unwrap();
        assert_eq!(attempts.metric.len(), 2); // Two different attempt labels
    }

    #[test]
    fn test_record_dead_letter() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dead_letter("endpoint_projection");
        metrics.record_dead_letter("audit_log");

        assert_eq!(counter_value(&metrics, "es_dead_letters_total"), 2.0);
    }
}
