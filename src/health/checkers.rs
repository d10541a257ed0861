use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, Producer};
use scylla::client::session::Session;
use std::sync::Arc;
use std::time::Duration;

use super::{HealthChecker, HealthStatus};

const STORE_PROBE: &str = "SELECT now() FROM system.local";

/// Round-trips a trivial query through the session.
pub struct ScyllaHealthChecker {
    name: String,
    session: Arc<Session>,
}

impl ScyllaHealthChecker {
    pub fn new(name: impl Into<String>, session: Arc<Session>) -> Self {
        Self {
            name: name.into(),
            session,
        }
    }
}

#[async_trait]
impl HealthChecker for ScyllaHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> HealthStatus {
        match self.session.query_unpaged(STORE_PROBE, ()).await {
            Ok(_) => HealthStatus::up(&self.name),
            Err(e) => HealthStatus::down(&self.name, e.to_string()),
        }
    }
}

/// Fetches cluster metadata; the broker is up when at least one broker
/// answers.
pub struct KafkaHealthChecker {
    name: String,
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaHealthChecker {
    pub fn new(name: impl Into<String>, producer: FutureProducer, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            producer,
            timeout,
        }
    }
}

#[async_trait]
impl HealthChecker for KafkaHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> HealthStatus {
        let producer = self.producer.clone();
        let timeout = self.timeout;

        // fetch_metadata blocks the calling thread
        let probe = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await;

        match probe {
            Ok(Ok(brokers)) if brokers > 0 => HealthStatus::up(&self.name),
            Ok(Ok(_)) => HealthStatus::down(&self.name, "no brokers in cluster metadata"),
            Ok(Err(e)) => HealthStatus::down(&self.name, e.to_string()),
            Err(e) => HealthStatus::down(&self.name, format!("metadata probe panicked: {e}")),
        }
    }
}
