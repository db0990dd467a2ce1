pub mod backoff;
pub mod batcher;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod handlers;
pub mod identity;
pub mod message;
pub mod metrics_defs;
pub mod model;
pub mod producer;
pub mod rollup;
pub mod store;

#[cfg(test)]
mod testutils;

use backoff::{RetryError, RetryPolicy, retry_with_backoff};
use batcher::Batcher;
use broker::{BrokerError, Connector, NatsBroker};
use config::{Config, PostgresConfig, ValidationError};
use consumer::{Consumer, ConsumerConfig, ConsumerError, MessageHandler};
use handlers::{EventHandler, LogHandler};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use store::{Store, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("invalid config: {0}")]
    Config(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("postgres unavailable: {0}")]
    StoreUnavailable(#[source] RetryError<StoreError>),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[source] RetryError<BrokerError>),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error("consumer for {0} stopped receiving messages")]
    ConsumerExited(String),
    #[error("admin listener failed: {0}")]
    Admin(#[from] std::io::Error),
}

impl IngestError {
    /// True when startup was interrupted by shutdown rather than a failure.
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            IngestError::StoreUnavailable(RetryError::Cancelled)
                | IngestError::BrokerUnavailable(RetryError::Cancelled)
                | IngestError::Consumer(ConsumerError::Connect {
                    source: RetryError::Cancelled,
                    ..
                })
        )
    }
}

/// Opens the configured store and waits until it answers.
pub async fn open_store(
    config: &PostgresConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Store>, IngestError> {
    let store = store::open(&config.url, config.max_connections)?;
    let policy = RetryPolicy::from(config.connect_retry);
    retry_with_backoff(&policy, cancel, "postgres ping", || store.ping())
        .await
        .map_err(IngestError::StoreUnavailable)?;
    Ok(store)
}

/// Creates the schema and exits.
pub async fn migrate(config: &Config, cancel: &CancellationToken) -> Result<(), IngestError> {
    let store = open_store(&config.postgres, cancel).await?;
    store.migrate().await?;
    Ok(())
}

/// Connects to the broker, retrying with the broker policy.
pub async fn connect_broker(
    config: &Config,
    cancel: &CancellationToken,
) -> Result<NatsBroker, IngestError> {
    let broker = &config.broker;
    let policy = RetryPolicy::from(broker.retry);
    retry_with_backoff(&policy, cancel, "broker connect", || {
        NatsBroker::connect(
            &broker.url,
            broker.connect_timeout(),
            broker.requeue_delay(),
            broker.max_in_flight,
        )
    })
    .await
    .map_err(IngestError::BrokerUnavailable)
}

/// Runs the consumers and the admin listener until `shutdown` fires.
///
/// In-flight messages are finished and pending batches flushed before this
/// returns.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), IngestError> {
    config.validate()?;
    info!(config = %config, "starting ingest service");

    let ready = Arc::new(AtomicBool::new(false));
    let admin_service = {
        let ready = ready.clone();
        AdminService::new(move || ready.load(Ordering::Relaxed))
    };
    let admin = config.admin_listener.clone();
    let mut admin_task =
        tokio::spawn(async move { run_http_service(&admin.host, admin.port, admin_service).await });

    let started = if config.consumers.run {
        tokio::select! {
            joined = &mut admin_task => return Err(admin_exit(joined)),
            started = start_consumers(&config, &shutdown) => started,
        }
    } else {
        info!("consumers disabled");
        Ok((None, Vec::new()))
    };
    let (_broker, consumers) = match started {
        Ok(started) => started,
        Err(e) if e.is_cancelled() => {
            info!("shutdown requested during startup");
            admin_task.abort();
            return Ok(());
        }
        Err(e) => {
            admin_task.abort();
            return Err(e);
        }
    };

    ready.store(true, Ordering::Relaxed);
    info!("ingest service ready");

    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        joined = &mut admin_task => Err(admin_exit(joined)),
        topic = first_exited(&consumers) => Err(IngestError::ConsumerExited(topic.to_owned())),
    };

    ready.store(false, Ordering::Relaxed);
    info!("stopping consumers");
    stop_all(&consumers).await;
    admin_task.abort();
    info!("ingest service stopped");
    result
}

fn admin_exit(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> IngestError {
    match joined {
        Ok(Err(e)) => IngestError::Admin(e),
        Ok(Ok(())) => IngestError::Admin(std::io::Error::other("admin listener exited")),
        Err(e) => IngestError::Admin(std::io::Error::other(e)),
    }
}

/// Resolves with the topic of the first consumer whose workers have all
/// exited. Never resolves for an empty slice.
async fn first_exited(consumers: &[Consumer]) -> &str {
    if consumers.is_empty() {
        return std::future::pending().await;
    }
    let exits = consumers.iter().map(|consumer| {
        Box::pin(async move {
            consumer.exited().await;
            consumer.topic()
        })
    });
    let (topic, _, _) = futures::future::select_all(exits).await;
    topic
}

async fn stop_all(consumers: &[Consumer]) {
    futures::future::join_all(consumers.iter().map(|consumer| consumer.stop())).await;
}

async fn start_consumers(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<(Option<NatsBroker>, Vec<Consumer>), IngestError> {
    let store = open_store(&config.postgres, shutdown).await?;
    store.migrate().await?;
    let broker = connect_broker(config, shutdown).await?;

    let events = &config.consumers.events;
    let batcher = Arc::new(handlers::event_batcher(store.clone(), events.batch.into()));
    let handler = EventHandler::new(events.topic.clone(), batcher.clone());
    let events_consumer = start_consumer(
        &broker,
        events.consumer_config(&config.broker),
        handler,
        batcher,
        shutdown,
    )
    .await?;

    let logs = &config.consumers.logs;
    let batcher = Arc::new(handlers::log_batcher(store, logs.batch.into()));
    let handler = LogHandler::new(logs.topic.clone(), batcher.clone());
    let logs_consumer = match start_consumer(
        &broker,
        logs.consumer_config(&config.broker),
        handler,
        batcher,
        shutdown,
    )
    .await
    {
        Ok(consumer) => consumer,
        Err(e) => {
            events_consumer.stop().await;
            return Err(e.into());
        }
    };

    Ok((Some(broker), vec![events_consumer, logs_consumer]))
}

/// Starts a consumer whose batcher is closed once its workers have stopped.
async fn start_consumer<T, H>(
    connector: &dyn Connector,
    config: ConsumerConfig,
    handler: H,
    batcher: Arc<Batcher<T, StoreError>>,
    shutdown: &CancellationToken,
) -> Result<Consumer, ConsumerError>
where
    T: Send + 'static,
    H: MessageHandler,
{
    match Consumer::start(connector, config, handler, shutdown).await {
        Ok(consumer) => {
            consumer
                .add_cleanup(async move { batcher.close().await })
                .await;
            Ok(consumer)
        }
        Err(e) => {
            warn!(error = %e, "consumer did not start");
            batcher.close().await;
            Err(e)
        }
    }
}
