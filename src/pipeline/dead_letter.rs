use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::Violation;
use crate::messaging::{Headers, Message, Sender};

// ============================================================================
// Dead Letter Queue
// ============================================================================
//
// Terminal destination for messages the pipeline gives up on. A record keeps
// the original payload and headers, the reason, and every violation, so a
// message can be inspected and replayed by hand.
//
// Sinks:
// - ScyllaDeadLetterSink: row in the dead_letter_queue table
// - TopicDeadLetterSink:  JSON document on a dead-letter topic
// - LogDeadLetterSink:    structured error log line only
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Decode,
    Validation,
    RetriesExhausted,
    PermanentStorage,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Decode => "decode",
            RejectReason::Validation => "validation",
            RejectReason::RetriesExhausted => "retries_exhausted",
            RejectReason::PermanentStorage => "permanent_storage",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub id: Uuid,
    pub message_id: String,
    pub record_kind: String,
    pub reason: RejectReason,
    /// Original payload, lossily decoded as UTF-8
    pub payload: String,
    pub headers: Headers,
    pub violations: Vec<Violation>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub rejected_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    fn name(&self) -> &str;

    async fn store(&self, record: &RejectionRecord) -> anyhow::Result<()>;
}

pub struct ScyllaDeadLetterSink {
    session: Arc<Session>,
    statement: String,
}

impl ScyllaDeadLetterSink {
    pub fn new(session: Arc<Session>, table: &str) -> Self {
        Self {
            session,
            statement: format!(
                "INSERT INTO {table} (
                    id, message_id, record_kind, reason, payload, headers,
                    violations, error_message, retry_count, first_seen_at, rejected_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
        }
    }
}

#[async_trait]
impl DeadLetterSink for ScyllaDeadLetterSink {
    fn name(&self) -> &str {
        "table"
    }

    async fn store(&self, record: &RejectionRecord) -> anyhow::Result<()> {
        let violations = serde_json::to_string(&record.violations)?;
        let retry_count = i32::try_from(record.retry_count).unwrap_or(i32::MAX);

        self.session
            .query_unpaged(
                self.statement.as_str(),
                (
                    record.id,
                    &record.message_id,
                    &record.record_kind,
                    record.reason.as_str(),
                    &record.payload,
                    &record.headers,
                    violations,
                    &record.error,
                    retry_count,
                    record.first_seen_at,
                    record.rejected_at,
                ),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to insert into DLQ: {}", e))?;

        tracing::info!(
            rejection_id = %record.id,
            message_id = %record.message_id,
            "Message successfully stored in DLQ"
        );
        Ok(())
    }
}

pub struct TopicDeadLetterSink {
    sender: Arc<dyn Sender>,
}

impl TopicDeadLetterSink {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl DeadLetterSink for TopicDeadLetterSink {
    fn name(&self) -> &str {
        "topic"
    }

    async fn store(&self, record: &RejectionRecord) -> anyhow::Result<()> {
        let document = serde_json::to_vec(record)?;
        let mut headers = record.headers.clone();
        headers.insert("x-reject-reason".to_string(), record.reason.to_string());

        let message = Message::new(document, record.headers.clone());
        self.sender.send_with_frame(&message, &headers).await?;
        Ok(())
    }
}

/// Only logs the rejection. Useful when no durable sink is available.
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn store(&self, record: &RejectionRecord) -> anyhow::Result<()> {
        let document = serde_json::to_string(record)?;
        tracing::error!(
            rejection_id = %record.id,
            message_id = %record.message_id,
            reason = %record.reason,
            record = %document,
            "Dead-lettered message"
        );
        Ok(())
    }
}
