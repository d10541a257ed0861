use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::IsTransient;

// ============================================================================
// Error Taxonomy
// ============================================================================
//
// Permanent:  DecodeError, ValidationError, StorageError::Permanent
// Retryable:  StorageError::Unavailable
// Escalated:  RequeueError (message is not acknowledged)
// Fatal:      ConnectivityError, ConfigError
//
// Permanent errors never leave the RetryHandler. Only ProcessingError is
// returned to the Subscriber.
//
// ============================================================================

/// The payload could not be turned into a domain record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A single field-level rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl Violation {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
            param: None,
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

/// Set of violations reported for one record. Never empty.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("validation failed with {} violation(s)", .violations.len())]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Returns `None` when there is nothing to report.
    /// Entries with the same field and code are collapsed.
    pub fn from_violations(violations: Vec<Violation>) -> Option<Self> {
        let mut unique: Vec<Violation> = Vec::with_capacity(violations.len());
        for violation in violations {
            let duplicate = unique
                .iter()
                .any(|v| v.field == violation.field && v.code == violation.code);
            if !duplicate {
                unique.push(violation);
            }
        }

        if unique.is_empty() {
            None
        } else {
            Some(Self { violations: unique })
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Store unreachable, timed out or overloaded. Worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the write for a reason retrying cannot fix.
    #[error("store rejected write: {0}")]
    Permanent(String),
}

impl IsTransient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Publishing the retry or dead-letter copy failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to publish to {destination}: {reason}")]
pub struct RequeueError {
    pub destination: String,
    pub reason: String,
}

/// A broker or store connection could not be established or was lost
/// beyond the reconnect budget.
#[derive(Debug, thiserror::Error)]
#[error("{component} connectivity lost: {reason}")]
pub struct ConnectivityError {
    pub component: String,
    pub reason: String,
}

impl ConnectivityError {
    pub fn new(component: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that escape the RetryHandler. The current delivery must not be
/// acknowledged when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Requeue(#[from] RequeueError),

    #[error("processing cancelled before completion")]
    Cancelled,
}

/// Broker transport failure seen by the subscriber loop.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,

    #[error("broker error: {0}")]
    Transport(String),
}

impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        BrokerError::Transport(err.to_string())
    }
}
