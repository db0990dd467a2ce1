//! In-process broker used by unit tests.

use crate::broker::{BrokerError, Connector, Delivery, DeliveryInfo, MessageSource, Publisher};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued(Duration),
}

#[derive(Default)]
struct State {
    connect_attempts: u32,
    connect_failures: u32,
    outcomes: Vec<(String, Outcome)>,
    published: Vec<(String, Vec<u8>)>,
}

/// Deliveries pushed with [`TestBroker::deliver`] go to whichever subscriber
/// is receiving. Settlements are recorded instead of redelivered.
#[derive(Clone)]
pub struct TestBroker {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<TestDelivery>>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TestDelivery>>>,
    state: Arc<Mutex<State>>,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::failing_connects(0)
    }

    /// A broker whose first `failures` subscribe calls fail.
    pub fn failing_connects(failures: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            state: Arc::new(Mutex::new(State {
                connect_failures: failures,
                ..Default::default()
            })),
        }
    }

    pub fn deliver(&self, id: &str, body: impl Into<Vec<u8>>) {
        self.deliver_attempt(id, 1, body);
    }

    pub fn deliver_attempt(&self, id: &str, attempt: u64, body: impl Into<Vec<u8>>) {
        let delivery = TestDelivery {
            body: body.into(),
            info: DeliveryInfo {
                id: id.to_owned(),
                attempt,
            },
            state: self.state.clone(),
        };
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("broker closed")
            .send(delivery)
            .unwrap();
    }

    /// Ends every subscription once the queued deliveries are consumed.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn outcomes(&self) -> Vec<(String, Outcome)> {
        self.state.lock().unwrap().outcomes.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    pub async fn wait_for_outcomes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.lock().unwrap().outcomes.len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("timed out waiting for settlements");
    }
}

#[async_trait]
impl Connector for TestBroker {
    async fn subscribe(
        &self,
        _topic: &str,
        _channel: &str,
    ) -> Result<Box<dyn MessageSource>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(BrokerError::Connect("connection refused".into()));
        }
        Ok(Box::new(TestSource {
            rx: self.rx.clone(),
        }))
    }
}

#[async_trait]
impl Publisher for TestBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.state
            .lock()
            .unwrap()
            .published
            .push((topic.to_owned(), body));
        Ok(())
    }
}

struct TestSource {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TestDelivery>>>,
}

#[async_trait]
impl MessageSource for TestSource {
    async fn next(&self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        let delivery = self.rx.lock().await.recv().await?;
        Some(Ok(Box::new(delivery)))
    }
}

struct TestDelivery {
    body: Vec<u8>,
    info: DeliveryInfo,
    state: Arc<Mutex<State>>,
}

impl TestDelivery {
    fn settle(&self, outcome: Outcome) {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .push((self.info.id.clone(), outcome));
    }
}

#[async_trait]
impl Delivery for TestDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn info(&self) -> DeliveryInfo {
        self.info.clone()
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Outcome::Acked);
        Ok(())
    }

    async fn requeue(&self, delay: Duration) -> Result<(), BrokerError> {
        self.settle(Outcome::Requeued(delay));
        Ok(())
    }
}
