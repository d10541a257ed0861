mod checkers;
mod monitor;

pub use checkers::{KafkaHealthChecker, ScyllaHealthChecker};
pub use monitor::HealthMonitor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Health Check Abstractions
// ============================================================================
//
// Each external dependency (store, broker) gets a HealthChecker that probes
// it directly. Checks never touch the message path, so a stalled handler
// does not make a healthy store look down, and vice versa.
//
// Report shape:
//   {"status":"UP|DOWN","details":{"<name>":{"status":"UP|DOWN","error":"..."}}}
//
// ============================================================================

/// Result of probing one component
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub name: String,
    pub up: bool,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn up(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: true,
            error: None,
        }
    }

    pub fn down(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Up,
    Down,
}

impl From<bool> for State {
    fn from(up: bool) -> Self {
        if up {
            State::Up
        } else {
            State::Down
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentReport {
    pub status: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate over all components; DOWN if any component is down.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: State,
    pub details: BTreeMap<String, ComponentReport>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_statuses(statuses: Vec<HealthStatus>) -> Self {
        let all_up = statuses.iter().all(|s| s.up);
        let details = statuses
            .into_iter()
            .map(|s| {
                (
                    s.name,
                    ComponentReport {
                        status: State::from(s.up),
                        error: s.error,
                    },
                )
            })
            .collect();

        Self {
            status: State::from(all_up),
            details,
            checked_at: Utc::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == State::Up
    }
}

/// Runs every registered checker concurrently, each under the same timeout.
pub struct HealthHandler {
    checkers: Vec<Arc<dyn HealthChecker>>,
    timeout: Duration,
}

impl HealthHandler {
    pub fn new(checkers: Vec<Arc<dyn HealthChecker>>, timeout: Duration) -> Self {
        Self { checkers, timeout }
    }

    pub async fn check(&self) -> HealthReport {
        let checks = self.checkers.iter().map(|checker| async move {
            match tokio::time::timeout(self.timeout, checker.check()).await {
                Ok(status) => status,
                Err(_) => HealthStatus::down(
                    checker.name(),
                    format!("health check timed out after {}ms", self.timeout.as_millis()),
                ),
            }
        });

        HealthReport::from_statuses(join_all(checks).await)
    }
}
