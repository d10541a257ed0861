use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

// ============================================================================
// Domain Models
// ============================================================================

/// A record that can travel through the ingest pipeline.
///
/// Records are decoded from and encoded to JSON, and carry a logical key the
/// store upserts on.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used in logs and metric labels
    const KIND: &'static str;

    /// Natural identity of the record
    fn key(&self) -> &str;
}

pub fn decode<T: Record>(payload: &[u8]) -> Result<T, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode<T: Record>(record: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<DateTime<Utc>>,
}

impl Record for User {
    const KIND: &'static str = "user";

    fn key(&self) -> &str {
        &self.id
    }
}
