use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::message::{Headers, Message};
use crate::config::{AckMode, ReconnectConfig};
use crate::errors::{BrokerError, ConnectivityError, ProcessingError};
use crate::metrics::Metrics;
use crate::pipeline::Disposition;
use crate::utils::{Backoff, Shutdown, Sleeper, TokioSleeper};

// ============================================================================
// Subscriber Loop
// ============================================================================
//
// One subscriber owns one broker connection and dispatches frames to the
// handler one at a time. Concurrency comes from running several subscribers.
//
// Acknowledgement:
// - auto mode:   every frame is acked once the handler returns
// - client mode: ack on Ok, nack (redeliver) on Err
//
// Connection failures are retried with capped exponential backoff; after
// `max_attempts` consecutive failures the loop gives up with a
// ConnectivityError.
//
// ============================================================================

/// Where a frame came from, so it can be acknowledged later.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub message: Message,
    pub delivery: Delivery,
}

/// Broker connection seen by the subscriber loop.
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn ack_mode(&self) -> AckMode;

    /// (Re)establish the connection and subscription.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    async fn receive(&mut self) -> Result<Frame, BrokerError>;

    async fn ack(&mut self, frame: &Frame) -> Result<(), BrokerError>;

    async fn nack(&mut self, frame: &Frame) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &[u8],
        headers: &Headers,
        shutdown: &Shutdown,
    ) -> Result<Disposition, ProcessingError>;
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff: cfg.backoff(),
        }
    }
}

pub struct Subscriber<S> {
    name: String,
    source: S,
    reconnect: ReconnectPolicy,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<Metrics>>,
}

impl<S: FrameSource> Subscriber<S> {
    pub fn new(name: impl Into<String>, source: S, reconnect: ReconnectPolicy) -> Self {
        Self {
            name: name.into(),
            source,
            reconnect,
            sleeper: Arc::new(TokioSleeper),
            metrics: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Consume until shutdown (returns Ok) or until the broker stays
    /// unreachable past the reconnect budget (returns the error).
    pub async fn subscribe(
        &mut self,
        handler: &dyn MessageHandler,
        shutdown: Shutdown,
    ) -> Result<(), ConnectivityError> {
        let mut failures: u32 = 0;

        // Initial connection
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.source.connect().await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    if !self.back_off(failures, &e, &shutdown).await? {
                        return Ok(());
                    }
                }
            }
        }

        tracing::info!(subscriber = %self.name, "🎧 Subscriber started");
        failures = 0;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(subscriber = %self.name, "Subscriber stopping");
                    return Ok(());
                }
                received = self.source.receive() => received,
            };

            match received {
                Ok(frame) => {
                    failures = 0;
                    self.dispatch(handler, frame, &shutdown).await;
                }
                Err(e) => {
                    failures += 1;
                    if !self.back_off(failures, &e, &shutdown).await? {
                        return Ok(());
                    }
                    match self.source.connect().await {
                        Ok(()) => {
                            tracing::info!(subscriber = %self.name, "Subscriber reconnected");
                            if let Some(metrics) = &self.metrics {
                                metrics.subscriber_reconnects.inc();
                            }
                        }
                        Err(e) => {
                            // The next receive fails too and counts against the budget
                            tracing::warn!(subscriber = %self.name, error = %e, "Reconnect failed");
                        }
                    }
                }
            }
        }
    }

    /// Sleep before the next connection attempt. Returns Ok(false) when
    /// shutdown interrupts the wait.
    async fn back_off(
        &self,
        failures: u32,
        error: &BrokerError,
        shutdown: &Shutdown,
    ) -> Result<bool, ConnectivityError> {
        if failures >= self.reconnect.max_attempts {
            tracing::error!(
                subscriber = %self.name,
                failures = failures,
                error = %error,
                "Broker unreachable, giving up"
            );
            return Err(ConnectivityError::new("broker", error));
        }

        let delay = self.reconnect.backoff.delay_for(failures);
        tracing::warn!(
            subscriber = %self.name,
            failures = failures,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Broker connection failed, backing off"
        );

        tokio::select! {
            _ = self.sleeper.sleep(delay) => Ok(true),
            _ = shutdown.cancelled() => Ok(false),
        }
    }

    async fn dispatch(&mut self, handler: &dyn MessageHandler, frame: Frame, shutdown: &Shutdown) {
        let started = Instant::now();
        if let Some(metrics) = &self.metrics {
            metrics.messages_received.inc();
        }

        let result = handler
            .handle(&frame.message.payload, &frame.message.headers, shutdown)
            .await;

        let ack = match (&result, self.source.ack_mode()) {
            (_, AckMode::Auto) => true,
            (Ok(_), AckMode::Client) => true,
            (Err(_), AckMode::Client) => false,
        };

        match &result {
            Ok(disposition) => tracing::debug!(
                subscriber = %self.name,
                offset = frame.delivery.offset,
                disposition = ?disposition,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Frame handled"
            ),
            Err(e) => tracing::warn!(
                subscriber = %self.name,
                offset = frame.delivery.offset,
                error = %e,
                acked = ack,
                "Frame handling failed"
            ),
        }

        let outcome = if ack {
            self.source.ack(&frame).await
        } else {
            self.source.nack(&frame).await
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_ack(ack);
        }
        if let Err(e) = outcome {
            tracing::warn!(
                subscriber = %self.name,
                topic = %frame.delivery.topic,
                partition = frame.delivery.partition,
                offset = frame.delivery.offset,
                error = %e,
                "Failed to acknowledge frame"
            );
        }
    }
}
