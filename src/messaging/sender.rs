use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

use super::message::{Headers, Message};
use crate::errors::RequeueError;

/// Publishes a message, payload untouched, with a replacement header set.
#[async_trait]
pub trait Sender: Send + Sync {
    fn destination(&self) -> &str;

    async fn send_with_frame(&self, message: &Message, headers: &Headers) -> Result<(), RequeueError>;
}

pub struct KafkaSender {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
    key_header: String,
}

impl KafkaSender {
    /// `key_header` names the header whose value becomes the record key, so
    /// every copy of a message lands on the same partition.
    pub fn new(producer: FutureProducer, topic: &str, timeout: Duration, key_header: &str) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
            timeout,
            key_header: key_header.to_string(),
        }
    }
}

pub(crate) fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            })
        })
}

#[async_trait]
impl Sender for KafkaSender {
    fn destination(&self) -> &str {
        &self.topic
    }

    async fn send_with_frame(&self, message: &Message, headers: &Headers) -> Result<(), RequeueError> {
        let mut record = FutureRecord::<str, [u8]>::to(&self.topic)
            .payload(message.payload.as_slice())
            .headers(to_kafka_headers(headers));
        if let Some(key) = headers.get(&self.key_header) {
            record = record.key(key.as_str());
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok(_) => {
                tracing::debug!(topic = %self.topic, "Published to Redpanda");
                Ok(())
            }
            Err((e, _)) => {
                tracing::error!(
                    error = %e,
                    topic = %self.topic,
                    "Failed to publish to Redpanda"
                );
                Err(RequeueError {
                    destination: self.topic.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers as _;

    #[test]
    fn test_headers_are_copied_verbatim() {
        let headers = Headers::from([
            ("x-retry-count".to_string(), "3".to_string()),
            ("x-message-id".to_string(), "m-1".to_string()),
        ]);

        let kafka = to_kafka_headers(&headers);
        assert_eq!(kafka.count(), 2);

        let mut copied = Headers::new();
        for header in kafka.iter() {
            let value = header.value.map(|v| String::from_utf8_lossy(v).into_owned());
            copied.insert(header.key.to_string(), value.unwrap_or_default());
        }
        assert_eq!(copied, headers);
    }
}
