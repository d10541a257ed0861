use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::{AppConfig, DeadLetterSinkKind};
use crate::db;
use crate::errors::ConnectivityError;
use crate::health::{HealthChecker, HealthHandler, HealthMonitor, KafkaHealthChecker, ScyllaHealthChecker};
use crate::messaging::{create_producer, KafkaFrameSource, KafkaSender, ReconnectPolicy, Sender, Subscriber};
use crate::metrics::{self, Metrics};
use crate::models::{Record, User};
use crate::pipeline::{
    DeadLetterSink, ErrorMapper, LogDeadLetterSink, RetryHandler, ScyllaDeadLetterSink,
    ScyllaUserWriter, TopicDeadLetterSink, UserValidator,
};
use crate::utils::Shutdown;

// ============================================================================
// Application Context
// ============================================================================
//
// Built once at startup, in dependency order:
//   metrics -> store session -> producer (broker probe) -> dead-letter sink
//   -> error mapper -> retry handler -> health handler
//
// Any connectivity failure during construction aborts startup.
//
// ============================================================================

pub struct ApplicationContext {
    config: AppConfig,
    handler: Arc<RetryHandler<User>>,
    health: Arc<HealthHandler>,
    metrics: Arc<Metrics>,
}

impl ApplicationContext {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        tracing::info!("Initializing metrics");
        let metrics = Arc::new(Metrics::new()?);

        let session = db::connect(&config.store).await?;

        let producer = create_producer(&config.broker)?;
        let health_timeout = Duration::from_millis(config.health.timeout_ms);
        let broker_check = KafkaHealthChecker::new("broker", producer.clone(), health_timeout);
        let probe = broker_check.check().await;
        if !probe.up {
            let reason = probe.error.unwrap_or_default();
            tracing::error!(brokers = %config.broker.brokers, error = %reason, "Cannot reach Redpanda");
            return Err(ConnectivityError::new("broker", reason).into());
        }
        tracing::info!(brokers = %config.broker.brokers, "Connected to Redpanda");

        let headers = config.retry.header_names();
        let send_timeout = Duration::from_millis(config.broker.send_timeout_ms);

        let sink: Arc<dyn DeadLetterSink> = match config.dead_letter.sink {
            DeadLetterSinkKind::Table => Arc::new(ScyllaDeadLetterSink::new(
                session.clone(),
                &config.store.dead_letter_table,
            )),
            DeadLetterSinkKind::Topic => {
                let topic = config.broker.dead_letter_topic();
                Arc::new(TopicDeadLetterSink::new(Arc::new(KafkaSender::new(
                    producer.clone(),
                    &topic,
                    send_timeout,
                    &headers.message_id,
                ))))
            }
            DeadLetterSinkKind::Log => Arc::new(LogDeadLetterSink),
        };
        tracing::info!(sink = sink.name(), "Dead letter sink ready");

        let error_mapper = ErrorMapper::new(sink, headers.clone(), User::KIND).with_metrics(metrics.clone());

        let retry_sender: Arc<dyn Sender> = Arc::new(KafkaSender::new(
            producer,
            config.broker.retry_topic(),
            send_timeout,
            &headers.message_id,
        ));

        let policy = Arc::new(config.retry.policy());
        tracing::info!(
            local_retries = policy.local.retries,
            requeue = policy.requeue.enabled,
            max_retries = policy.requeue.max_retries,
            limit_retry = policy.requeue.limit_retry,
            retry_topic = retry_sender.destination(),
            "Retry policy loaded"
        );

        let handler = RetryHandler::new(
            Arc::new(UserValidator::new()),
            Arc::new(ScyllaUserWriter::new(session.clone(), &config.store.table)),
            error_mapper,
            policy,
            headers,
        )
        .with_sender(retry_sender)
        .with_metrics(metrics.clone())
        .with_info_logging(tracing::enabled!(tracing::Level::INFO));

        let checkers: Vec<Arc<dyn HealthChecker>> = vec![
            Arc::new(ScyllaHealthChecker::new("store", session.clone())),
            Arc::new(broker_check),
        ];
        let health = Arc::new(HealthHandler::new(checkers, health_timeout));

        Ok(Self {
            config,
            handler: Arc::new(handler),
            health,
            metrics,
        })
    }

    /// Run until shutdown fires or a subscriber loses the broker for good.
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        metrics::spawn_http_server(
            self.metrics.registry().clone(),
            self.health.clone(),
            self.config.server.port,
        );

        let monitor = HealthMonitor::new(self.health.clone()).with_metrics(self.metrics.clone());
        let monitor_task = tokio::spawn(monitor.run(
            Duration::from_secs(self.config.health.interval_secs),
            shutdown.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker in 0..self.config.broker.workers {
            let source = KafkaFrameSource::new(self.config.broker.clone());
            let mut subscriber = Subscriber::new(
                format!("worker-{worker}"),
                source,
                ReconnectPolicy::from(&self.config.broker.reconnect),
            )
            .with_metrics(self.metrics.clone());
            let handler = self.handler.clone();
            let shutdown = shutdown.clone();

            workers.spawn(async move { subscriber.subscribe(&*handler, shutdown).await });
        }
        tracing::info!(
            workers = self.config.broker.workers,
            topic = %self.config.broker.topic,
            "🚀 Consuming"
        );

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => anyhow::Error::from(e),
                Err(e) => anyhow::anyhow!("subscriber task failed: {}", e),
            };
            tracing::error!(error = %failure, "Subscriber stopped, shutting down remaining workers");
            workers.abort_all();
            result = Err(failure);
            break;
        }

        monitor_task.abort();
        tracing::info!("Application stopped");
        result
    }
}
