use async_trait::async_trait;
use chrono::Utc;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use super::dead_letter::RejectReason;
use super::error_mapper::ErrorMapper;
use super::policy::RetryPolicy;
use super::validator::Validator;
use super::writer::Writer;
use crate::errors::{ProcessingError, StorageError};
use crate::messaging::{Envelope, HeaderNames, Headers, Message, MessageHandler, Sender};
use crate::metrics::Metrics;
use crate::models::{decode, Record};
use crate::utils::{retry_on_transient, RetryResult, Shutdown, Sleeper, TokioSleeper};

// ============================================================================
// Retry Handler
// ============================================================================
//
// Per-message state machine:
//
//   Received -> Decoding -> Validating -> Writing
//
//   Decoding   fails            -> Rejected (decode)
//   Validating fails            -> Rejected (validation, all violations)
//   Writing    succeeds         -> Processed
//   Writing    fails permanently-> Rejected (permanent_storage)
//   Writing    exhausts local retries:
//       requeue allowed         -> Requeued (retry count + 1)
//       requeue not allowed     -> Rejected (retries_exhausted)
//   Requeue send fails          -> Err, delivery is not acknowledged
//   Shutdown during retries     -> Err(Cancelled), delivery is not acknowledged
//
// Every terminal state is reached exactly once per delivery.
//
// ============================================================================

/// Terminal state of one handled delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Written to the store after `attempts` write attempts
    Processed { attempts: u32 },
    /// Sent back to the broker carrying `retry_count`
    Requeued { retry_count: u32 },
    /// Handed to the dead-letter sink
    Rejected { reason: RejectReason },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Processed { .. } => "processed",
            Disposition::Requeued { .. } => "requeued",
            Disposition::Rejected { .. } => "rejected",
        }
    }
}

pub struct RetryHandler<T: Record> {
    validator: Arc<dyn Validator<T>>,
    writer: Arc<dyn Writer<T>>,
    error_mapper: ErrorMapper,
    sender: Option<Arc<dyn Sender>>,
    policy: Arc<RetryPolicy>,
    headers: HeaderNames,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<Metrics>>,
    log_info: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> RetryHandler<T> {
    pub fn new(
        validator: Arc<dyn Validator<T>>,
        writer: Arc<dyn Writer<T>>,
        error_mapper: ErrorMapper,
        policy: Arc<RetryPolicy>,
        headers: HeaderNames,
    ) -> Self {
        Self {
            validator,
            writer,
            error_mapper,
            sender: None,
            policy,
            headers,
            sleeper: Arc::new(TokioSleeper),
            metrics: None,
            log_info: false,
            _record: PhantomData,
        }
    }

    /// Where exhausted messages are requeued. Without a sender they are
    /// rejected instead.
    pub fn with_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Log every received and processed message at info level.
    pub fn with_info_logging(mut self, enabled: bool) -> Self {
        self.log_info = enabled;
        self
    }

    pub async fn handle(
        &self,
        payload: &[u8],
        headers: &Headers,
        shutdown: &Shutdown,
    ) -> Result<Disposition, ProcessingError> {
        let started = Instant::now();
        let result = self.process(payload, headers, shutdown).await;

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(disposition) => disposition.label(),
                Err(_) => "failed",
            };
            metrics.record_outcome(T::KIND, outcome, started.elapsed().as_secs_f64());
        }
        result
    }

    async fn process(
        &self,
        payload: &[u8],
        headers: &Headers,
        shutdown: &Shutdown,
    ) -> Result<Disposition, ProcessingError> {
        let envelope = self.headers.envelope(headers);

        // Pin the message id so every record of this delivery agrees on it
        let mut headers = headers.clone();
        headers
            .entry(self.headers.message_id.clone())
            .or_insert_with(|| envelope.message_id.clone());
        let message = Message::new(payload, headers);

        if self.log_info {
            tracing::info!(
                kind = T::KIND,
                message_id = %envelope.message_id,
                retry_count = envelope.retry_count,
                "📨 Received message"
            );
        }
        tracing::debug!(
            message_id = %envelope.message_id,
            payload = %String::from_utf8_lossy(payload),
            "Message payload"
        );

        // Decoding
        let record: T = match decode(payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(message_id = %envelope.message_id, error = %e, "Failed to decode message");
                self.error_mapper
                    .reject(&message, RejectReason::Decode, &e.to_string())
                    .await;
                return Ok(Disposition::Rejected {
                    reason: RejectReason::Decode,
                });
            }
        };

        // Validating
        if let Err(e) = self.validator.validate(&record) {
            tracing::warn!(
                message_id = %envelope.message_id,
                key = record.key(),
                error = %e,
                "Message failed validation"
            );
            self.error_mapper.reject_with_map(&message, &e.violations).await;
            return Ok(Disposition::Rejected {
                reason: RejectReason::Validation,
            });
        }

        // Writing
        let writer = &self.writer;
        let metrics = &self.metrics;
        let record_ref = &record;
        let outcome = retry_on_transient(
            self.policy.local.retries,
            &self.policy.local.backoff,
            self.sleeper.as_ref(),
            shutdown,
            move |attempt| {
                if attempt > 1 {
                    if let Some(metrics) = metrics {
                        metrics.local_retries.inc();
                    }
                }
                writer.write(record_ref)
            },
        )
        .await;

        match outcome {
            RetryResult::Success { attempts, .. } => {
                if self.log_info {
                    tracing::info!(
                        kind = T::KIND,
                        message_id = %envelope.message_id,
                        key = record.key(),
                        attempts = attempts,
                        "✅ Message processed"
                    );
                }
                Ok(Disposition::Processed { attempts })
            }
            RetryResult::PermanentFailure { error, .. } => {
                self.error_mapper
                    .reject(&message, RejectReason::PermanentStorage, &error.to_string())
                    .await;
                Ok(Disposition::Rejected {
                    reason: RejectReason::PermanentStorage,
                })
            }
            RetryResult::Cancelled { last_error, attempts } => {
                tracing::warn!(
                    message_id = %envelope.message_id,
                    attempts = attempts,
                    last_error = last_error.map(|e| e.to_string()).unwrap_or_default(),
                    "Processing cancelled by shutdown"
                );
                Err(ProcessingError::Cancelled)
            }
            RetryResult::Exhausted { error, attempts } => {
                tracing::warn!(
                    message_id = %envelope.message_id,
                    attempts = attempts,
                    error = %error,
                    "Local retries exhausted"
                );
                self.escalate(&message, &envelope, &error).await
            }
        }
    }

    /// Requeue through the broker, or reject once the requeue budget is spent.
    async fn escalate(
        &self,
        message: &Message,
        envelope: &Envelope,
        error: &StorageError,
    ) -> Result<Disposition, ProcessingError> {
        let sender = match &self.sender {
            Some(sender) if self.policy.requeue.allows(envelope.retry_count) => sender,
            _ => {
                tracing::error!(
                    message_id = %envelope.message_id,
                    retry_count = envelope.retry_count,
                    max_retries = self.policy.requeue.max_retries,
                    requeue_enabled = self.policy.requeue.enabled,
                    "Retry budget spent, rejecting message"
                );
                self.error_mapper
                    .reject(
                        message,
                        RejectReason::RetriesExhausted,
                        &format!("retries exhausted: {error}"),
                    )
                    .await;
                return Ok(Disposition::Rejected {
                    reason: RejectReason::RetriesExhausted,
                });
            }
        };

        let next = self
            .headers
            .for_requeue(&message.headers, envelope, &error.to_string(), Utc::now());
        let retry_count = envelope.retry_count.saturating_add(1);

        if let Err(e) = sender.send_with_frame(message, &next).await {
            tracing::error!(
                message_id = %envelope.message_id,
                destination = sender.destination(),
                error = %e,
                "Failed to requeue message"
            );
            if let Some(metrics) = &self.metrics {
                metrics.requeue_failures.inc();
            }
            return Err(ProcessingError::Requeue(e));
        }

        tracing::warn!(
            message_id = %envelope.message_id,
            retry_count = retry_count,
            destination = sender.destination(),
            "🔁 Message requeued"
        );
        if let Some(metrics) = &self.metrics {
            metrics.requeued_total.inc();
        }
        Ok(Disposition::Requeued { retry_count })
    }
}

#[async_trait]
impl<T: Record> MessageHandler for RetryHandler<T> {
    async fn handle(
        &self,
        payload: &[u8],
        headers: &Headers,
        shutdown: &Shutdown,
    ) -> Result<Disposition, ProcessingError> {
        RetryHandler::handle(self, payload, headers, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Violation;
    use crate::models::{encode, User};
    use crate::pipeline::{LocalRetryPolicy, RequeuePolicy, UserValidator};
    use crate::testing::{
        sample_user, FlakyWriter, MemoryWriter, RecordingSender, RecordingSink, RecordingSleeper,
        StalledSleeper,
    };
    use crate::utils::{shutdown_channel, Backoff};
    use std::time::Duration;

    struct Harness {
        handler: RetryHandler<User>,
        sink: Arc<RecordingSink>,
        sender: Arc<RecordingSender>,
        sleeper: Arc<RecordingSleeper>,
    }

    fn policy(local_retries: u32, max_retries: u32, limit_retry: bool) -> Arc<RetryPolicy> {
        Arc::new(RetryPolicy {
            local: LocalRetryPolicy {
                retries: local_retries,
                backoff: Backoff::constant(Duration::from_millis(50)),
            },
            requeue: RequeuePolicy {
                enabled: true,
                max_retries,
                limit_retry,
            },
        })
    }

    fn harness(writer: Arc<dyn Writer<User>>, policy: Arc<RetryPolicy>, sender: RecordingSender) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let sender = Arc::new(sender);
        let sleeper = Arc::new(RecordingSleeper::default());
        let mapper = ErrorMapper::new(sink.clone(), HeaderNames::default(), User::KIND);

        let handler = RetryHandler::new(
            Arc::new(UserValidator::new()),
            writer,
            mapper,
            policy,
            HeaderNames::default(),
        )
        .with_sender(sender.clone())
        .with_sleeper(sleeper.clone());

        Harness {
            handler,
            sink,
            sender,
            sleeper,
        }
    }

    fn payload(user: &User) -> Vec<u8> {
        encode(user).unwrap()
    }

    #[tokio::test]
    async fn test_valid_message_is_written_once() {
        let writer = Arc::new(MemoryWriter::default());
        let h = harness(writer.clone(), policy(2, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
            .await
            .unwrap();

        assert_eq!(result, Disposition::Processed { attempts: 1 });
        assert_eq!(writer.calls(), 1);
        assert_eq!(writer.get("u-1"), Some(sample_user("u-1")));
        assert!(h.sink.records().is_empty());
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_rejected_without_writing() {
        let writer = Arc::new(MemoryWriter::default());
        let h = harness(writer.clone(), policy(2, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();

        let bad_payloads: [&[u8]; 4] = [b"{not json", b"", b"   ", br#"{"id":42}"#];
        for bad in bad_payloads {
            let result = h.handler.handle(bad, &Headers::new(), &shutdown).await.unwrap();
            assert_eq!(
                result,
                Disposition::Rejected {
                    reason: RejectReason::Decode
                }
            );
        }

        assert_eq!(writer.calls(), 0);
        let records = h.sink.records();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.reason == RejectReason::Decode));
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_record_keeps_every_violation() {
        let writer = Arc::new(MemoryWriter::default());
        let h = harness(writer.clone(), policy(2, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();

        let mut user = sample_user("u-1");
        user.username = String::new();
        user.phone = "call me".into();
        user.email = Some("not-an-email".into());

        let result = h
            .handler
            .handle(&payload(&user), &Headers::new(), &shutdown)
            .await
            .unwrap();

        assert_eq!(
            result,
            Disposition::Rejected {
                reason: RejectReason::Validation
            }
        );
        assert_eq!(writer.calls(), 0);

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        let fields: Vec<&str> = records[0].violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"username"));
        assert!(fields.contains(&"phone"));
        assert!(fields.contains(&"email"));
        assert!(records[0]
            .violations
            .contains(&Violation::new("username", "required", "username is required")));
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_do_not_requeue() {
        let writer = Arc::new(FlakyWriter::failing_times(2));
        let h = harness(writer.clone(), policy(2, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
            .await
            .unwrap();

        assert_eq!(result, Disposition::Processed { attempts: 3 });
        assert_eq!(writer.calls(), 3);
        assert_eq!(h.sleeper.delays().len(), 2);
        assert!(h.sender.sent().is_empty());
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_cycle_ends_in_exactly_one_rejection() {
        let writer = Arc::new(FlakyWriter::always());
        let h = harness(writer.clone(), policy(1, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();
        let body = payload(&sample_user("u-1"));

        // Replay each requeued copy as the broker would redeliver it
        let mut headers = Headers::from([("x-message-id".to_string(), "m-1".to_string())]);
        let mut dispositions = Vec::new();
        loop {
            let result = h.handler.handle(&body, &headers, &shutdown).await.unwrap();
            dispositions.push(result.clone());
            match result {
                Disposition::Requeued { .. } => {
                    let sent = h.sender.sent();
                    let (message, next) = sent.last().unwrap();
                    assert_eq!(message.payload, body);
                    headers = next.clone();
                }
                _ => break,
            }
        }

        assert_eq!(
            dispositions,
            vec![
                Disposition::Requeued { retry_count: 1 },
                Disposition::Requeued { retry_count: 2 },
                Disposition::Requeued { retry_count: 3 },
                Disposition::Rejected {
                    reason: RejectReason::RetriesExhausted
                },
            ]
        );

        let counts: Vec<String> = h
            .sender
            .sent()
            .iter()
            .map(|(_, headers)| headers["x-retry-count"].clone())
            .collect();
        assert_eq!(counts, vec!["1", "2", "3"]);

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_id, "m-1");
        assert_eq!(records[0].retry_count, 3);
        // Two write attempts per delivery, four deliveries
        assert_eq!(writer.calls(), 8);
    }

    #[tokio::test]
    async fn test_requeue_headers_keep_identity_and_first_seen() {
        let h = harness(Arc::new(FlakyWriter::always()), policy(0, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();
        let body = payload(&sample_user("u-1"));

        h.handler.handle(&body, &Headers::new(), &shutdown).await.unwrap();
        let (_, first) = h.sender.sent()[0].clone();
        h.handler.handle(&body, &first, &shutdown).await.unwrap();
        let (_, second) = h.sender.sent()[1].clone();

        assert!(!first["x-message-id"].is_empty());
        assert_eq!(first["x-message-id"], second["x-message-id"]);
        assert_eq!(first["x-first-seen"], second["x-first-seen"]);
        assert_eq!(second["x-retry-count"], "2");
        assert!(second["x-error-reason"].contains("unavailable"));
    }

    #[tokio::test]
    async fn test_unlimited_requeue_ignores_max() {
        let h = harness(Arc::new(FlakyWriter::always()), policy(0, 3, false), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();
        let headers = Headers::from([("x-retry-count".to_string(), "50".to_string())]);

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &headers, &shutdown)
            .await
            .unwrap();

        assert_eq!(result, Disposition::Requeued { retry_count: 51 });
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_unlimited_requeue_rejects_at_count_ceiling() {
        let h = harness(Arc::new(FlakyWriter::always()), policy(0, 3, false), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();
        let headers = Headers::from([("x-retry-count".to_string(), u32::MAX.to_string())]);

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &headers, &shutdown)
            .await
            .unwrap();

        assert_eq!(
            result,
            Disposition::Rejected {
                reason: RejectReason::RetriesExhausted
            }
        );
        assert!(h.sender.sent().is_empty());
        assert_eq!(h.sink.records()[0].retry_count, u32::MAX);
    }

    #[tokio::test]
    async fn test_requeue_disabled_rejects_after_local_retries() {
        let mut disabled = (*policy(1, 3, true)).clone();
        disabled.requeue.enabled = false;
        let h = harness(Arc::new(FlakyWriter::always()), Arc::new(disabled), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
            .await
            .unwrap();

        assert_eq!(
            result,
            Disposition::Rejected {
                reason: RejectReason::RetriesExhausted
            }
        );
        assert!(h.sender.sent().is_empty());
        assert_eq!(h.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_requeue_surfaces_error() {
        let h = harness(Arc::new(FlakyWriter::always()), policy(0, 3, true), RecordingSender::failing());
        let (_trigger, shutdown) = shutdown_channel();

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
            .await;

        assert!(matches!(result, Err(ProcessingError::Requeue(_))));
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_storage_error_is_rejected_immediately() {
        let writer = Arc::new(FlakyWriter::permanent());
        let h = harness(writer.clone(), policy(3, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();

        let result = h
            .handler
            .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
            .await
            .unwrap();

        assert_eq!(
            result,
            Disposition::Rejected {
                reason: RejectReason::PermanentStorage
            }
        );
        assert_eq!(writer.calls(), 1);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let writer = Arc::new(MemoryWriter::default());
        let h = harness(writer.clone(), policy(2, 3, true), RecordingSender::default());
        let (_trigger, shutdown) = shutdown_channel();
        let body = payload(&sample_user("u-1"));

        for _ in 0..3 {
            h.handler.handle(&body, &Headers::new(), &shutdown).await.unwrap();
        }

        assert_eq!(writer.len(), 1);
        assert_eq!(writer.get("u-1"), Some(sample_user("u-1")));
    }

    #[tokio::test]
    async fn test_shutdown_during_local_retry_cancels() {
        let sink = Arc::new(RecordingSink::default());
        let sender = Arc::new(RecordingSender::default());
        let sleeper = Arc::new(StalledSleeper::default());
        let handler = Arc::new(
            RetryHandler::new(
                Arc::new(UserValidator::new()),
                Arc::new(FlakyWriter::always()),
                ErrorMapper::new(sink.clone(), HeaderNames::default(), User::KIND),
                policy(3, 3, true),
                HeaderNames::default(),
            )
            .with_sender(sender.clone())
            .with_sleeper(sleeper.clone()),
        );
        let (trigger, shutdown) = shutdown_channel();

        let task = tokio::spawn({
            let handler = handler.clone();
            async move {
                handler
                    .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
                    .await
            }
        });

        sleeper.wait_until_sleeping().await;
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(ProcessingError::Cancelled)));
        assert!(sender.sent().is_empty());
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_outcomes_are_counted() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let handler = RetryHandler::new(
            Arc::new(UserValidator::new()),
            Arc::new(FlakyWriter::failing_times(1)),
            ErrorMapper::new(sink, HeaderNames::default(), User::KIND),
            policy(2, 3, true),
            HeaderNames::default(),
        )
        .with_sleeper(Arc::new(RecordingSleeper::default()))
        .with_metrics(metrics.clone());
        let (_trigger, shutdown) = shutdown_channel();

        handler
            .handle(&payload(&sample_user("u-1")), &Headers::new(), &shutdown)
            .await
            .unwrap();
        handler.handle(b"garbage", &Headers::new(), &shutdown).await.unwrap();

        assert_eq!(
            metrics.messages_handled.with_label_values(&["user", "processed"]).get(),
            1
        );
        assert_eq!(
            metrics.messages_handled.with_label_values(&["user", "rejected"]).get(),
            1
        );
        assert_eq!(metrics.local_retries.get(), 1);
    }
}
