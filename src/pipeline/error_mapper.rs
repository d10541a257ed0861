use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::dead_letter::{DeadLetterSink, LogDeadLetterSink, RejectReason, RejectionRecord};
use crate::errors::Violation;
use crate::messaging::{HeaderNames, Message};
use crate::metrics::Metrics;

/// Turns a rejected message into a `RejectionRecord` and hands it to the
/// dead-letter sink.
///
/// Rejection is terminal and never fails the caller: if the sink is down the
/// failure is counted and the full record goes to the fallback sink (the log
/// unless overridden), and the message is still considered handled.
#[derive(Clone)]
pub struct ErrorMapper {
    sink: Arc<dyn DeadLetterSink>,
    fallback: Arc<dyn DeadLetterSink>,
    headers: HeaderNames,
    record_kind: &'static str,
    metrics: Option<Arc<Metrics>>,
}

impl ErrorMapper {
    pub fn new(sink: Arc<dyn DeadLetterSink>, headers: HeaderNames, record_kind: &'static str) -> Self {
        Self {
            sink,
            fallback: Arc::new(LogDeadLetterSink),
            headers,
            record_kind,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn DeadLetterSink>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Reject a message that failed validation, keeping every violation.
    pub async fn reject_with_map(&self, message: &Message, violations: &[Violation]) {
        let record = self.build(message, RejectReason::Validation, violations.to_vec(), None);
        self.deliver(record).await;
    }

    /// Reject a message for any other terminal reason.
    pub async fn reject(&self, message: &Message, reason: RejectReason, error: &str) {
        let record = self.build(message, reason, Vec::new(), Some(error.to_string()));
        self.deliver(record).await;
    }

    pub(crate) fn build(
        &self,
        message: &Message,
        reason: RejectReason,
        violations: Vec<Violation>,
        error: Option<String>,
    ) -> RejectionRecord {
        let envelope = self.headers.envelope(&message.headers);
        RejectionRecord {
            id: Uuid::new_v4(),
            message_id: envelope.message_id,
            record_kind: self.record_kind.to_string(),
            reason,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            headers: message.headers.clone(),
            violations,
            error,
            retry_count: envelope.retry_count,
            first_seen_at: envelope.first_seen,
            rejected_at: Utc::now(),
        }
    }

    async fn deliver(&self, record: RejectionRecord) {
        tracing::error!(
            rejection_id = %record.id,
            message_id = %record.message_id,
            reason = %record.reason,
            retry_count = record.retry_count,
            violations = record.violations.len(),
            error = record.error.as_deref().unwrap_or(""),
            sink = self.sink.name(),
            "💀 Rejecting message to dead letter queue"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter(record.reason.as_str());
        }

        if let Err(e) = self.sink.store(&record).await {
            tracing::error!(
                rejection_id = %record.id,
                message_id = %record.message_id,
                sink = self.sink.name(),
                error = %e,
                "Failed to store rejection record"
            );
            if let Some(metrics) = &self.metrics {
                metrics.dead_letter_failures.inc();
            }

            if let Err(e) = self.fallback.store(&record).await {
                tracing::error!(
                    rejection_id = %record.id,
                    message_id = %record.message_id,
                    sink = self.fallback.name(),
                    payload = %record.payload,
                    error = %e,
                    "Fallback dead letter sink failed"
                );
            }
        }
    }
}
