//! Kafka message transport

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, info};

use super::{MessageTransport, TransportError};
use crate::config::KafkaSettings;
use crate::event::OutboundMessage;

pub struct KafkaTransport {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaTransport {
    pub fn new(settings: &KafkaSettings) -> Result<Self, TransportError> {
        let producer: FutureProducer = client_config(settings)
            .create()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        info!(brokers = %settings.brokers, "Kafka producer created");

        Ok(Self {
            producer,
            timeout: settings.message_timeout,
        })
    }
}

fn client_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.brokers)
        .set("message.timeout.ms", settings.message_timeout.as_millis().to_string());

    if let Some((username, password)) = settings.credentials() {
        config
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    config
}

#[async_trait]
impl MessageTransport for KafkaTransport {
    /// Sends every message and waits for all deliveries. Messages delivered
    /// before a failure stay delivered.
    async fn write(&self, messages: &[OutboundMessage]) -> Result<(), TransportError> {
        let deliveries = messages.iter().map(|message| {
            let record = FutureRecord::to(&message.topic)
                .key(&message.key)
                .payload(&message.payload);
            self.producer.send(record, self.timeout)
        });

        let results = join_all(deliveries).await;
        for (result, message) in results.into_iter().zip(messages) {
            if let Err((e, _)) = result {
                return Err(TransportError::Delivery {
                    topic: message.topic.clone(),
                    reason: e.to_string(),
                });
            }
        }

        debug!(count = messages.len(), "batch delivered");
        Ok(())
    }
}
