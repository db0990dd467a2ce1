//! Coalesces items from many concurrent callers into bounded flush groups.
//!
//! A single control task owns the pending group. Callers hand items over a
//! bounded channel (twice the group size, so a full channel pushes back on
//! producers) and wait until the group holding their item has been flushed.
//! Every caller in a group receives the same outcome.

use crate::metrics_defs::{BATCHER_FLUSH_DURATION, BATCHER_FLUSH_FAILURES, BATCHER_FLUSH_SIZE};
use shared::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_SIZE: usize = 200;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest accepted group size; the queue holds twice this many items.
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Flush as soon as this many items are pending.
    pub max_size: usize,
    /// Flush a partial group this long after its first item arrived.
    pub flush_interval: Duration,
    /// Upper bound on a single flush call.
    pub flush_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl BatcherConfig {
    /// Replaces zero values with the defaults and caps `max_size` at
    /// [`MAX_BATCH_SIZE`].
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_size: match self.max_size {
                0 => defaults.max_size,
                size => size.min(MAX_BATCH_SIZE),
            },
            flush_interval: if self.flush_interval.is_zero() {
                defaults.flush_interval
            } else {
                self.flush_interval
            },
            flush_timeout: if self.flush_timeout.is_zero() {
                defaults.flush_timeout
            } else {
                self.flush_timeout
            },
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BatchError<E> {
    #[error("batcher closed")]
    Closed,
    #[error("flush timed out after {0:?}")]
    Timeout(Duration),
    #[error("flush failed: {0}")]
    Flush(Arc<E>),
}

impl<E> Clone for BatchError<E> {
    fn clone(&self) -> Self {
        match self {
            BatchError::Closed => BatchError::Closed,
            BatchError::Timeout(after) => BatchError::Timeout(*after),
            BatchError::Flush(err) => BatchError::Flush(err.clone()),
        }
    }
}

type Completion<E> = oneshot::Sender<Result<(), BatchError<E>>>;

struct Pending<T, E> {
    item: T,
    done: Completion<E>,
}

pub struct Batcher<T, E> {
    tx: mpsc::Sender<Pending<T, E>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T, E> Batcher<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Spawns the control task. `name` tags the batcher's metrics and logs.
    pub fn new<F, Fut>(name: &'static str, config: BatcherConfig, flush: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(config.max_size * 2);
        let shutdown = CancellationToken::new();
        let control = Control {
            name,
            config,
            flush,
            rx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(control.run());

        Self {
            tx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues `item` and waits for the outcome of the flush that includes it.
    pub async fn add(&self, item: T) -> Result<(), BatchError<E>> {
        if self.shutdown.is_cancelled() {
            return Err(BatchError::Closed);
        }
        let (done, outcome) = oneshot::channel();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(BatchError::Closed),
            sent = self.tx.send(Pending { item, done }) => {
                sent.map_err(|_| BatchError::Closed)?;
            }
        }

        // The control task drops the sender without answering only when it
        // exits with the item still queued.
        outcome.await.unwrap_or(Err(BatchError::Closed))
    }

    /// Flushes everything already queued and waits for the control task to exit.
    ///
    /// Later calls to `add` fail with [`BatchError::Closed`].
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "batcher task failed");
            }
        }
    }
}

struct Control<T, E, F> {
    name: &'static str,
    config: BatcherConfig,
    flush: F,
    rx: mpsc::Receiver<Pending<T, E>>,
    shutdown: CancellationToken,
}

impl<T, E, F, Fut> Control<T, E, F>
where
    E: std::error::Error,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    async fn run(mut self) {
        let mut group: Vec<Pending<T, E>> = Vec::with_capacity(self.config.max_size);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.flush_group(&mut group).await;
                }
                received = self.rx.recv() => {
                    let Some(pending) = received else { break };
                    if group.is_empty() {
                        deadline = Some(Instant::now() + self.config.flush_interval);
                    }
                    group.push(pending);
                    if group.len() >= self.config.max_size {
                        deadline = None;
                        self.flush_group(&mut group).await;
                    }
                }
            }
        }

        // Refuse new items, then flush what is already queued.
        self.rx.close();
        while let Ok(pending) = self.rx.try_recv() {
            group.push(pending);
        }
        while !group.is_empty() {
            let rest = if group.len() > self.config.max_size {
                group.split_off(self.config.max_size)
            } else {
                Vec::new()
            };
            self.flush_group(&mut group).await;
            group = rest;
        }
        tracing::debug!(batcher = self.name, "batcher stopped");
    }

    async fn flush_group(&self, group: &mut Vec<Pending<T, E>>) {
        if group.is_empty() {
            return;
        }
        let (items, waiters): (Vec<T>, Vec<Completion<E>>) =
            group.drain(..).map(|p| (p.item, p.done)).unzip();
        let size = items.len();
        let started = Instant::now();

        let outcome = match timeout(self.config.flush_timeout, (self.flush)(items)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BatchError::Flush(Arc::new(e))),
            Err(_) => Err(BatchError::Timeout(self.config.flush_timeout)),
        };

        histogram!(BATCHER_FLUSH_SIZE, "batcher" => self.name).record(size as f64);
        histogram!(BATCHER_FLUSH_DURATION, "batcher" => self.name)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &outcome {
            counter!(BATCHER_FLUSH_FAILURES, "batcher" => self.name).increment(1);
            tracing::error!(batcher = self.name, size, error = %e, "flush failed");
        }

        for done in waiters {
            // The caller may have given up waiting; the outcome is still shared.
            let _ = done.send(outcome.clone());
        }
    }
}
