use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{HealthHandler, HealthReport, State};
use crate::metrics::Metrics;
use crate::utils::Shutdown;

// ============================================================================
// Health Monitor - periodic background health polling
// ============================================================================
//
// Responsibilities:
// - Poll every component on a fixed interval
// - Log transitions between up and down
// - Publish per-component health gauges
//
// ============================================================================

pub struct HealthMonitor {
    handler: Arc<HealthHandler>,
    metrics: Option<Arc<Metrics>>,
    last: HashMap<String, bool>,
}

impl HealthMonitor {
    pub fn new(handler: Arc<HealthHandler>) -> Self {
        Self {
            handler,
            metrics: None,
            last: HashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn poll_once(&mut self) -> HealthReport {
        let report = self.handler.check().await;

        for (component, detail) in &report.details {
            let up = detail.status == State::Up;
            if let Some(metrics) = &self.metrics {
                metrics.set_component_health(component, up);
            }

            match self.last.insert(component.clone(), up) {
                Some(previous) if previous == up => {}
                _ if up => tracing::info!(component = %component, "Component is up"),
                _ => tracing::warn!(
                    component = %component,
                    error = detail.error.as_deref().unwrap_or(""),
                    "Component is down"
                ),
            }
        }

        report
    }

    pub async fn run(mut self, every: Duration, shutdown: Shutdown) {
        tracing::info!(interval_secs = every.as_secs(), "HealthMonitor started");

        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }

        tracing::info!("HealthMonitor stopped");
    }
}
