use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::errors::{RequeueError, StorageError};
use crate::messaging::{Headers, Message, Sender};
use crate::models::{Record, User};
use crate::pipeline::{DeadLetterSink, RejectionRecord, Writer};
use crate::utils::Sleeper;

// ============================================================================
// In-memory doubles shared by unit tests
// ============================================================================

pub fn sample_user(id: &str) -> User {
    User {
        id: id.to_string(),
        username: "ada.lovelace".to_string(),
        email: Some("ada@example.com".to_string()),
        phone: "+44 20 7946 0958".to_string(),
        date_of_birth: Utc.with_ymd_and_hms(1990, 12, 10, 0, 0, 0).single(),
    }
}

// ============================================================================
// Sleepers
// ============================================================================

/// Returns immediately and remembers every requested delay.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Never wakes up. Lets a test observe that a retry loop is mid-delay.
#[derive(Default)]
pub struct StalledSleeper {
    entered: Notify,
}

impl StalledSleeper {
    pub async fn wait_until_sleeping(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl Sleeper for StalledSleeper {
    async fn sleep(&self, _duration: Duration) {
        // notify_one keeps a permit if nobody is waiting yet
        self.entered.notify_one();
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Upserts users into a map keyed by id.
#[derive(Default)]
pub struct MemoryWriter {
    rows: Mutex<HashMap<String, User>>,
    calls: AtomicU32,
}

impl MemoryWriter {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn get(&self, id: &str) -> Option<User> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Writer<User> for MemoryWriter {
    async fn write(&self, user: &User) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rows
            .lock()
            .unwrap()
            .insert(user.key().to_string(), user.clone());
        Ok(())
    }
}

/// Fails the first `failures` writes, then behaves like MemoryWriter.
pub struct FlakyWriter {
    failures: u32,
    error: StorageError,
    inner: MemoryWriter,
}

impl FlakyWriter {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures,
            error: StorageError::Unavailable("connection reset".into()),
            inner: MemoryWriter::default(),
        }
    }

    pub fn always() -> Self {
        Self::failing_times(u32::MAX)
    }

    pub fn permanent() -> Self {
        Self {
            failures: u32::MAX,
            error: StorageError::Permanent("unconfigured table users".into()),
            inner: MemoryWriter::default(),
        }
    }

    pub fn calls(&self) -> u32 {
        self.inner.calls()
    }
}

#[async_trait]
impl Writer<User> for FlakyWriter {
    async fn write(&self, user: &User) -> Result<(), StorageError> {
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        self.inner
            .rows
            .lock()
            .unwrap()
            .insert(user.key().to_string(), user.clone());
        Ok(())
    }
}

// ============================================================================
// Sender and Dead Letter Sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(Message, Headers)>>,
    fail: bool,
}

impl RecordingSender {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(Message, Headers)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    fn destination(&self) -> &str {
        "users.retry"
    }

    async fn send_with_frame(&self, message: &Message, headers: &Headers) -> Result<(), RequeueError> {
        if self.fail {
            return Err(RequeueError {
                destination: self.destination().to_string(),
                reason: "broker unavailable".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((message.clone(), headers.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<RejectionRecord>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<RejectionRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, record: &RejectionRecord) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("dead letter table unavailable");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
