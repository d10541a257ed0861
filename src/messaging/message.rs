use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub type Headers = HashMap<String, String>;

/// One unit of work: opaque payload plus string headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, headers: Headers) -> Self {
        Self {
            payload: payload.into(),
            headers,
        }
    }
}

/// Header names the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderNames {
    pub retry_count: String,
    pub first_seen: String,
    pub error: String,
    pub message_id: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            retry_count: "x-retry-count".to_string(),
            first_seen: "x-first-seen".to_string(),
            error: "x-error-reason".to_string(),
            message_id: "x-message-id".to_string(),
        }
    }
}

/// Pipeline metadata pulled out of a message's headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: String,
    pub retry_count: u32,
    pub first_seen: Option<DateTime<Utc>>,
}

impl HeaderNames {
    /// Read pipeline metadata. A missing or unparsable retry count reads as
    /// zero; a missing message id is generated.
    pub fn envelope(&self, headers: &Headers) -> Envelope {
        let retry_count = match headers.get(&self.retry_count) {
            None => 0,
            Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                tracing::warn!(
                    header = %self.retry_count,
                    value = %raw,
                    "Unparsable retry count header, treating as 0"
                );
                0
            }),
        };

        let first_seen = headers
            .get(&self.first_seen)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let message_id = headers
            .get(&self.message_id)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Envelope {
            message_id,
            retry_count,
            first_seen,
        }
    }

    /// Header set for the next requeue of a message.
    pub fn for_requeue(
        &self,
        headers: &Headers,
        envelope: &Envelope,
        error: &str,
        now: DateTime<Utc>,
    ) -> Headers {
        let mut next = headers.clone();
        next.insert(
            self.retry_count.clone(),
            envelope.retry_count.saturating_add(1).to_string(),
        );
        next.insert(self.message_id.clone(), envelope.message_id.clone());
        next.insert(
            self.first_seen.clone(),
            envelope.first_seen.unwrap_or(now).to_rfc3339(),
        );
        next.insert(self.error.clone(), error.to_string());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_envelope_defaults() {
        let names = HeaderNames::default();
        let envelope = names.envelope(&Headers::new());

        assert_eq!(envelope.retry_count, 0);
        assert!(envelope.first_seen.is_none());
        assert!(!envelope.message_id.is_empty());
    }

    #[test]
    fn test_envelope_reads_headers() {
        let names = HeaderNames::default();
        let envelope = names.envelope(&headers(&[
            ("x-retry-count", "2"),
            ("x-first-seen", "2026-01-02T03:04:05Z"),
            ("x-message-id", "m-1"),
        ]));

        assert_eq!(envelope.retry_count, 2);
        assert_eq!(envelope.message_id, "m-1");
        assert_eq!(
            envelope.first_seen,
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap())
        );
    }

    #[test]
    fn test_garbage_retry_count_reads_as_zero() {
        let names = HeaderNames::default();
        let envelope = names.envelope(&headers(&[("x-retry-count", "many")]));
        assert_eq!(envelope.retry_count, 0);
    }

    #[test]
    fn test_requeue_headers_increment_and_keep_first_seen() {
        let names = HeaderNames::default();
        let original = headers(&[
            ("x-retry-count", "1"),
            ("x-first-seen", "2026-01-02T03:04:05+00:00"),
            ("x-message-id", "m-1"),
            ("tenant", "acme"),
        ]);
        let envelope = names.envelope(&original);
        let now = Utc.with_ymd_and_hms(2026, 5, 5, 0, 0, 0).unwrap();

        let next = names.for_requeue(&original, &envelope, "store unavailable", now);

        assert_eq!(next["x-retry-count"], "2");
        assert_eq!(next["x-first-seen"], "2026-01-02T03:04:05+00:00");
        assert_eq!(next["x-error-reason"], "store unavailable");
        assert_eq!(next["x-message-id"], "m-1");
        assert_eq!(next["tenant"], "acme");
    }

    #[test]
    fn test_requeue_headers_stamp_first_seen_once() {
        let names = HeaderNames::default();
        let original = Headers::new();
        let envelope = names.envelope(&original);
        let now = Utc.with_ymd_and_hms(2026, 5, 5, 0, 0, 0).unwrap();

        let next = names.for_requeue(&original, &envelope, "timeout", now);

        assert_eq!(next["x-retry-count"], "1");
        assert_eq!(next["x-first-seen"], now.to_rfc3339());
        assert_eq!(next["x-message-id"], envelope.message_id);
    }
}
