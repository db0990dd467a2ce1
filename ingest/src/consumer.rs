//! Runs a pool of handler workers over one broker subscription.
//!
//! A handler returning `Ok` acknowledges the message; an error requeues it.
//! Handlers decide which failures are permanent (acknowledge and drop) and
//! which are worth a redelivery.

use crate::backoff::{RetryError, RetryPolicy, retry_with_backoff};
use crate::broker::{BrokerError, Connector, Delivery, DeliveryInfo, MessageSource};
use crate::metrics_defs::{CONSUMER_CONNECT_ATTEMPTS, CONSUMER_MESSAGES};
use async_trait::async_trait;
use futures::future::BoxFuture;
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after the broker fails to hand out a message.
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(&self, body: &[u8], info: &DeliveryInfo) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub topic: String,
    pub channel: String,
    pub concurrency: usize,
    /// Redelivery delay for messages whose handler failed.
    pub requeue_delay: Duration,
    pub connect_retry: RetryPolicy,
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("could not subscribe to {topic}/{channel}: {source}")]
    Connect {
        topic: String,
        channel: String,
        #[source]
        source: RetryError<BrokerError>,
    },
}

pub struct Consumer {
    topic: String,
    channel: String,
    shutdown: CancellationToken,
    /// Cancelled once the last worker has exited.
    exited: CancellationToken,
    workers: Mutex<JoinSet<()>>,
    cleanups: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl Consumer {
    /// Subscribes with retries and starts `concurrency` workers.
    ///
    /// Cancelling `cancel` aborts the connection attempts and later stops the
    /// workers, but only [`Consumer::stop`] waits for them and runs cleanups.
    pub async fn start<H: MessageHandler>(
        connector: &dyn Connector,
        config: ConsumerConfig,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<Self, ConsumerError> {
        if config.concurrency == 0 {
            return Err(ConsumerError::InvalidConcurrency);
        }
        let ConsumerConfig {
            topic,
            channel,
            concurrency,
            requeue_delay,
            connect_retry,
        } = config;

        let source = retry_with_backoff(&connect_retry, cancel, "broker subscribe", || async {
            let result = connector.subscribe(&topic, &channel).await;
            let status = if result.is_ok() { "ok" } else { "error" };
            counter!(CONSUMER_CONNECT_ATTEMPTS, "topic" => topic.clone(), "status" => status)
                .increment(1);
            result
        })
        .await
        .map_err(|source| ConsumerError::Connect {
            topic: topic.clone(),
            channel: channel.clone(),
            source,
        })?;

        let source: Arc<dyn MessageSource> = Arc::from(source);
        let handler = Arc::new(handler);
        let shutdown = cancel.child_token();
        let exited = CancellationToken::new();
        let live = Arc::new(AtomicUsize::new(concurrency));
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let worker = Worker {
                id: worker_id,
                topic: topic.clone(),
                source: source.clone(),
                handler: handler.clone(),
                shutdown: shutdown.clone(),
                requeue_delay,
                live: live.clone(),
                exited: exited.clone(),
            };
            workers.spawn(worker.run());
        }
        info!(%topic, %channel, concurrency, "consumer started");

        Ok(Self {
            topic,
            channel,
            shutdown,
            exited,
            workers: Mutex::new(workers),
            cleanups: Mutex::new(Vec::new()),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// False once stopping has begun or every worker has exited.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.exited.is_cancelled()
    }

    /// Resolves when every worker has exited, either after [`Consumer::stop`]
    /// or because the subscription ended.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    /// Registers work to run after the workers have stopped, in registration order.
    pub async fn add_cleanup<F>(&self, cleanup: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cleanups.lock().await.push(Box::pin(cleanup));
    }

    /// Stops taking new messages, waits for in-flight handlers, then runs the cleanups.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        {
            let mut workers = self.workers.lock().await;
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(topic = %self.topic, error = %e, "consumer worker failed");
                }
            }
        }
        let cleanups = std::mem::take(&mut *self.cleanups.lock().await);
        for cleanup in cleanups {
            cleanup.await;
        }
        info!(topic = %self.topic, channel = %self.channel, "consumer stopped");
    }
}

struct Worker<H> {
    id: usize,
    topic: String,
    source: Arc<dyn MessageSource>,
    handler: Arc<H>,
    shutdown: CancellationToken,
    requeue_delay: Duration,
    live: Arc<AtomicUsize>,
    exited: CancellationToken,
}

impl<H: MessageHandler> Worker<H> {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.source.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    error!(topic = %self.topic, worker = self.id, error = %e, "receive failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => {}
                    }
                }
                None => {
                    warn!(topic = %self.topic, worker = self.id, "subscription ended");
                    break;
                }
            }
        }
        debug!(topic = %self.topic, worker = self.id, "worker exited");
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            if !self.shutdown.is_cancelled() {
                error!(topic = %self.topic, "all consumer workers exited");
            }
            self.exited.cancel();
        }
    }

    /// Runs the handler to completion even if shutdown starts meanwhile.
    async fn process(&self, delivery: Box<dyn Delivery>) {
        let info = delivery.info();
        match self.handler.handle(delivery.body(), &info).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(topic = %self.topic, id = %info.id, error = %e, "ack failed");
                }
                counter!(CONSUMER_MESSAGES, "topic" => self.topic.clone(), "outcome" => "acked")
                    .increment(1);
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    id = %info.id,
                    attempt = info.attempt,
                    error = %e,
                    "handler failed, requeueing"
                );
                if let Err(e) = delivery.requeue(self.requeue_delay).await {
                    error!(topic = %self.topic, id = %info.id, error = %e, "requeue failed");
                }
                counter!(CONSUMER_MESSAGES, "topic" => self.topic.clone(), "outcome" => "requeued")
                    .increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{Outcome, TestBroker};
    use std::io;
    use std::sync::atomic::AtomicBool;

    /// Fails bodies equal to `fail`, records everything else.
    struct RecordingHandler {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        type Error = io::Error;

        async fn handle(&self, body: &[u8], _info: &DeliveryInfo) -> Result<(), io::Error> {
            let body = String::from_utf8_lossy(body).into_owned();
            if body == "fail" {
                return Err(io::Error::other("transient"));
            }
            self.seen.lock().unwrap().push(body);
            Ok(())
        }
    }

    /// Records the attempt number of each delivery.
    struct AttemptHandler {
        attempts: Arc<std::sync::Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl MessageHandler for AttemptHandler {
        type Error = io::Error;

        async fn handle(&self, _body: &[u8], info: &DeliveryInfo) -> Result<(), io::Error> {
            self.attempts.lock().unwrap().push(info.attempt);
            Ok(())
        }
    }

    fn config(concurrency: usize) -> ConsumerConfig {
        ConsumerConfig {
            topic: "logs".into(),
            channel: "log-consumer".into(),
            concurrency,
            requeue_delay: Duration::from_secs(30),
            connect_retry: RetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn acks_success_and_requeues_failure() {
        let broker = TestBroker::new();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let consumer = Consumer::start(
            &broker,
            config(2),
            RecordingHandler { seen: Arc::clone(&seen) },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        broker.deliver("m1", "hello");
        broker.deliver("m2", "fail");
        broker.wait_for_outcomes(2).await;

        let mut outcomes = broker.outcomes();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            outcomes,
            vec![
                ("m1".to_string(), Outcome::Acked),
                ("m2".to_string(), Outcome::Requeued(Duration::from_secs(30))),
            ]
        );
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
        consumer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_broker_is_up() {
        let broker = TestBroker::failing_connects(3);
        let consumer = Consumer::start(
            &broker,
            config(1),
            RecordingHandler { seen: Arc::default() },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(broker.connect_attempts(), 4);
        consumer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_budget() {
        let broker = TestBroker::failing_connects(u32::MAX);
        let mut config = config(1);
        config.connect_retry = RetryPolicy {
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
            total_budget: Duration::from_secs(10),
        };
        let result = Consumer::start(
            &broker,
            config,
            RecordingHandler { seen: Arc::default() },
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(ConsumerError::Connect {
                source: RetryError::Exhausted { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn rejects_zero_concurrency() {
        let broker = TestBroker::new();
        let result = Consumer::start(
            &broker,
            config(0),
            RecordingHandler { seen: Arc::default() },
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ConsumerError::InvalidConcurrency)));
    }

    struct SlowHandler {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        type Error = io::Error;

        async fn handle(&self, _body: &[u8], _info: &DeliveryInfo) -> Result<(), io::Error> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_then_runs_cleanups() {
        let broker = TestBroker::new();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let consumer = Consumer::start(
            &broker,
            config(1),
            SlowHandler {
                started: started.clone(),
                finished: finished.clone(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let handler_done = finished.clone();
        consumer
            .add_cleanup(async move {
                // Cleanups only run after in-flight handlers are finished.
                assert_eq!(handler_done.load(Ordering::SeqCst), 1);
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        broker.deliver("m1", "slow");
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        consumer.stop().await;
        assert!(!consumer.is_running());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(broker.outcomes(), vec![("m1".to_string(), Outcome::Acked)]);
    }

    #[tokio::test]
    async fn handler_sees_delivery_attempt() {
        let broker = TestBroker::new();
        let attempts: Arc<std::sync::Mutex<Vec<u64>>> = Arc::default();
        let consumer = Consumer::start(
            &broker,
            config(1),
            AttemptHandler {
                attempts: attempts.clone(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        broker.deliver("m1", "a");
        broker.deliver_attempt("m1", 3, "a");
        broker.wait_for_outcomes(2).await;
        consumer.stop().await;

        assert_eq!(*attempts.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn ended_subscription_stops_the_consumer() {
        let broker = TestBroker::new();
        let consumer = Consumer::start(
            &broker,
            config(2),
            RecordingHandler { seen: Arc::default() },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(consumer.is_running());

        broker.close();
        tokio::time::timeout(Duration::from_secs(5), consumer.exited())
            .await
            .expect("workers should exit");
        assert!(!consumer.is_running());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn stop_resolves_exited() {
        let broker = TestBroker::new();
        let consumer = Consumer::start(
            &broker,
            config(2),
            RecordingHandler { seen: Arc::default() },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        consumer.stop().await;
        tokio::time::timeout(Duration::from_secs(1), consumer.exited())
            .await
            .expect("stopped consumer has exited");
    }
}
