use super::{BrokerError, Connector, Delivery, DeliveryInfo, MessageSource, Publisher};
use async_nats::jetstream::{self, AckKind, consumer::pull};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// NATS JetStream adapter.
///
/// Each topic is a stream with a single subject of the same name. Each
/// channel is a durable pull consumer on that stream, so every channel sees
/// every message and workers sharing a channel split the load.
pub struct NatsBroker {
    jetstream: jetstream::Context,
    requeue_delay: Duration,
    max_in_flight: i64,
}

impl NatsBroker {
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        requeue_delay: Duration,
        max_in_flight: i64,
    ) -> Result<Self, BrokerError> {
        info!(url, "connecting to nats");
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(connect_timeout)
            .connect(url)
            .await
            .map_err(|e| BrokerError::Connect(e.into()))?;

        Ok(Self {
            jetstream: jetstream::new(client),
            requeue_delay,
            max_in_flight,
        })
    }

    /// Creates the stream backing `topic` if it does not exist yet.
    pub async fn ensure_topic(&self, topic: &str) -> Result<jetstream::stream::Stream, BrokerError> {
        let name = stream_name(topic);
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![topic.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                channel: String::new(),
                source: e.into(),
            })?;
        debug!(topic, stream = %name, "stream ready");
        Ok(stream)
    }
}

fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c.to_ascii_uppercase(),
            _ => '_',
        })
        .collect()
}

#[async_trait]
impl Connector for NatsBroker {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
    ) -> Result<Box<dyn MessageSource>, BrokerError> {
        let subscribe_error = |source: super::BoxError| BrokerError::Subscribe {
            topic: topic.to_string(),
            channel: channel.to_string(),
            source,
        };

        let stream = self.ensure_topic(topic).await?;
        let consumer = stream
            .get_or_create_consumer(
                channel,
                pull::Config {
                    name: Some(channel.to_string()),
                    durable_name: Some(channel.to_string()),
                    filter_subject: topic.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.requeue_delay,
                    max_ack_pending: self.max_in_flight,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| subscribe_error(e.into()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_error(e.into()))?;

        info!(topic, channel, "subscribed");
        Ok(Box::new(NatsSource {
            messages: Mutex::new(messages),
        }))
    }
}

#[async_trait]
impl Publisher for NatsBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let publish_error = |source: super::BoxError| BrokerError::Publish {
            topic: topic.to_string(),
            source,
        };
        self.jetstream
            .publish(topic.to_string(), body.into())
            .await
            .map_err(|e| publish_error(e.into()))?
            .await
            .map_err(|e| publish_error(e.into()))?;
        Ok(())
    }
}

struct NatsSource {
    messages: Mutex<pull::Stream>,
}

#[async_trait]
impl MessageSource for NatsSource {
    async fn next(&self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        let next = self.messages.lock().await.next().await?;
        let delivery = next
            .map_err(|e| BrokerError::Receive(e.into()))
            .and_then(NatsDelivery::new)
            .map(|d| Box::new(d) as Box<dyn Delivery>);
        Some(delivery)
    }
}

struct NatsDelivery {
    message: jetstream::Message,
    info: DeliveryInfo,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Result<Self, BrokerError> {
        let info = {
            let meta = message.info().map_err(BrokerError::Receive)?;
            DeliveryInfo {
                id: format!("{}:{}", meta.stream, meta.stream_sequence),
                attempt: meta.delivered.max(1) as u64,
            }
        };
        Ok(Self { message, info })
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn body(&self) -> &[u8] {
        &self.message.payload
    }

    fn info(&self) -> DeliveryInfo {
        self.info.clone()
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.message.ack().await.map_err(BrokerError::Settle)
    }

    async fn requeue(&self, delay: Duration) -> Result<(), BrokerError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(BrokerError::Settle)
    }
}
