use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers as _, Message as _};
use rdkafka::producer::FutureProducer;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

use super::message::{Headers, Message};
use super::subscriber::{Delivery, Frame, FrameSource};
use crate::config::{AckMode, BrokerConfig};
use crate::errors::{BrokerError, ConnectivityError};

// ============================================================================
// Redpanda / Kafka Transport
// ============================================================================
//
// Acknowledgement mapping:
// - auto:   enable.auto.commit=true; ack and nack are no-ops
// - client: ack commits offset+1 for the frame's partition,
//           nack seeks the partition back to the frame so it is redelivered
//
// ============================================================================

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and security settings shared by producer and consumer.
pub fn client_config(cfg: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &cfg.brokers);

    if let Some(protocol) = &cfg.security_protocol {
        client.set("security.protocol", protocol);
    }
    if let Some(mechanism) = &cfg.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }
    if let (Some(username), Some(password)) = (&cfg.sasl_username, &cfg.sasl_password) {
        client.set("sasl.username", username);
        client.set("sasl.password", password);
    }

    client
}

pub fn consumer_config(cfg: &BrokerConfig) -> ClientConfig {
    let auto_commit = cfg.ack_mode == AckMode::Auto;

    let mut client = client_config(cfg);
    client
        .set("group.id", &cfg.group_id)
        .set("enable.auto.commit", auto_commit.to_string())
        .set("auto.offset.reset", &cfg.auto_offset_reset)
        .set("session.timeout.ms", cfg.session_timeout_ms.to_string())
        .set("enable.partition.eof", "false");
    client
}

/// Source topic plus the requeue topic when it differs, so requeued copies
/// come back to the same consumer group.
pub fn subscription_topics(cfg: &BrokerConfig) -> Vec<&str> {
    let mut topics = vec![cfg.topic.as_str()];
    let retry_topic = cfg.retry_topic();
    if retry_topic != cfg.topic {
        topics.push(retry_topic);
    }
    topics
}

pub fn create_producer(cfg: &BrokerConfig) -> Result<FutureProducer, ConnectivityError> {
    let mut client = client_config(cfg);
    client
        .set("message.timeout.ms", cfg.send_timeout_ms.to_string())
        .set("acks", "all")
        .set("enable.idempotence", "true");

    client.create().map_err(|e| {
        tracing::error!(error = %e, "Failed to create Redpanda producer");
        ConnectivityError::new("broker", e)
    })
}

fn frame_from(message: &BorrowedMessage<'_>) -> Frame {
    let mut headers = Headers::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    Frame {
        message: Message::new(message.payload().unwrap_or_default(), headers),
        delivery: Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
    }
}

pub struct KafkaFrameSource {
    config: BrokerConfig,
    consumer: Option<StreamConsumer>,
}

impl KafkaFrameSource {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            consumer: None,
        }
    }

    fn consumer(&self) -> Result<&StreamConsumer, BrokerError> {
        self.consumer.as_ref().ok_or(BrokerError::NotConnected)
    }
}

#[async_trait]
impl FrameSource for KafkaFrameSource {
    fn ack_mode(&self) -> AckMode {
        self.config.ack_mode
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        // Drop any previous consumer first so its group membership is released
        self.consumer = None;

        let topics = subscription_topics(&self.config);
        let consumer: StreamConsumer = consumer_config(&self.config).create()?;
        consumer.subscribe(&topics)?;

        tracing::info!(
            topics = ?topics,
            group_id = %self.config.group_id,
            ack_mode = ?self.config.ack_mode,
            "Kafka consumer subscribed"
        );
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame, BrokerError> {
        let message = self.consumer()?.recv().await?;
        Ok(frame_from(&message))
    }

    async fn ack(&mut self, frame: &Frame) -> Result<(), BrokerError> {
        if self.config.ack_mode == AckMode::Auto {
            return Ok(());
        }

        let delivery = &frame.delivery;
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )?;
        self.consumer()?.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn nack(&mut self, frame: &Frame) -> Result<(), BrokerError> {
        if self.config.ack_mode == AckMode::Auto {
            return Ok(());
        }

        let delivery = &frame.delivery;
        self.consumer()?.seek(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset),
            SEEK_TIMEOUT,
        )?;
        tracing::debug!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "Rewound partition for redelivery"
        );
        Ok(())
    }
}
