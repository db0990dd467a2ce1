//! Seams between the pipeline and the message broker.
//!
//! The broker is an at-least-once transport: a delivery that is neither
//! acknowledged nor requeued is redelivered once its visibility timeout expires.

mod nats;

pub use nats::NatsBroker;

use async_trait::async_trait;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("could not connect to broker: {0}")]
    Connect(#[source] BoxError),
    #[error("could not subscribe to {topic}/{channel}: {source}")]
    Subscribe {
        topic: String,
        channel: String,
        #[source]
        source: BoxError,
    },
    #[error("could not receive message: {0}")]
    Receive(#[source] BoxError),
    #[error("could not settle message: {0}")]
    Settle(#[source] BoxError),
    #[error("could not publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Identifies the broker message, unchanged across redeliveries.
    pub id: String,
    /// 1 for the first delivery.
    pub attempt: u64,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    fn info(&self) -> DeliveryInfo;

    async fn ack(&self) -> Result<(), BrokerError>;

    /// Hands the message back for redelivery after `delay`.
    async fn requeue(&self, delay: Duration) -> Result<(), BrokerError>;
}

/// A subscription shared by all workers of one consumer.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// `None` once the subscription has ended.
    async fn next(&self) -> Option<Result<Box<dyn Delivery>, BrokerError>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn subscribe(&self, topic: &str, channel: &str)
    -> Result<Box<dyn MessageSource>, BrokerError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError>;
}
