// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

// Re-export for public API
pub use server::{spawn_http_server, start_http_server};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Message handling (throughput, latency, outcome per record kind)
// - Local retries and requeues
// - Dead letter queue statistics
// - Subscriber acknowledgements and reconnects
// - Component health (store, broker)
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Handling Metrics
    pub messages_received: IntCounter,
    pub messages_handled: IntCounterVec,
    pub handle_duration: HistogramVec,

    // Retry Metrics
    pub local_retries: IntCounter,
    pub requeued_total: IntCounter,
    pub requeue_failures: IntCounter,

    // DLQ Metrics
    pub dead_letter_total: IntCounterVec,
    pub dead_letter_failures: IntCounter,

    // Subscriber Metrics
    pub acknowledgements: IntCounterVec,
    pub subscriber_reconnects: IntCounter,

    // Health Metrics
    pub component_health: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Handling Metrics
        let messages_received = IntCounter::new(
            "messages_received_total",
            "Total messages delivered by the broker",
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_handled = IntCounterVec::new(
            Opts::new("messages_handled_total", "Total messages handled by outcome"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(messages_handled.clone()))?;

        let handle_duration = HistogramVec::new(
            HistogramOpts::new("message_handle_duration_seconds", "Message handling duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["kind"],
        )?;
        registry.register(Box::new(handle_duration.clone()))?;

        // Retry Metrics
        let local_retries = IntCounter::new(
            "local_retry_attempts_total",
            "Total in-process write retries",
        )?;
        registry.register(Box::new(local_retries.clone()))?;

        let requeued_total = IntCounter::new(
            "requeued_messages_total",
            "Total messages sent back to the broker for a later retry",
        )?;
        registry.register(Box::new(requeued_total.clone()))?;

        let requeue_failures = IntCounter::new(
            "requeue_failures_total",
            "Total requeue sends that failed",
        )?;
        registry.register(Box::new(requeue_failures.clone()))?;

        // DLQ Metrics
        let dead_letter_total = IntCounterVec::new(
            Opts::new("dlq_messages_total", "Total messages rejected to the dead letter queue"),
            &["reason"],
        )?;
        registry.register(Box::new(dead_letter_total.clone()))?;

        let dead_letter_failures = IntCounter::new(
            "dlq_store_failures_total",
            "Total rejection records the dead letter sink failed to store",
        )?;
        registry.register(Box::new(dead_letter_failures.clone()))?;

        // Subscriber Metrics
        let acknowledgements = IntCounterVec::new(
            Opts::new("acknowledgements_total", "Broker acknowledgements by result"),
            &["result"],
        )?;
        registry.register(Box::new(acknowledgements.clone()))?;

        let subscriber_reconnects = IntCounter::new(
            "subscriber_reconnects_total",
            "Total successful subscriber reconnects",
        )?;
        registry.register(Box::new(subscriber_reconnects.clone()))?;

        // Health Metrics
        let component_health = IntGaugeVec::new(
            Opts::new("component_health_status", "Component health (0=Down, 1=Up)"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            messages_handled,
            handle_duration,
            local_retries,
            requeued_total,
            requeue_failures,
            dead_letter_total,
            dead_letter_failures,
            acknowledgements,
            subscriber_reconnects,
            component_health,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Helper to record the outcome of one handled message
    pub fn record_outcome(&self, kind: &str, outcome: &str, duration_secs: f64) {
        self.messages_handled.with_label_values(&[kind, outcome]).inc();
        self.handle_duration.with_label_values(&[kind]).observe(duration_secs);
    }

    /// Helper to record DLQ message
    pub fn record_dead_letter(&self, reason: &str) {
        self.dead_letter_total.with_label_values(&[reason]).inc();
    }

    pub fn record_ack(&self, acked: bool) {
        let result = if acked { "ack" } else { "nack" };
        self.acknowledgements.with_label_values(&[result]).inc();
    }

    pub fn set_component_health(&self, component: &str, up: bool) {
        self.component_health
            .with_label_values(&[component])
            .set(i64::from(up));
    }
}
