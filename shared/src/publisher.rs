//! Avro publisher on top of the rdkafka producer.

use std::sync::Arc;

use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::KafkaArgs;
use crate::messages::value_subject;
use crate::registry::{RegistryError, SchemaRegistry};
use crate::wire::{self, WireError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("schema registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to encode event: {0}")]
    Encoding(String),

    #[error("failed to enqueue message for {topic}: {reason}")]
    Enqueue { topic: String, reason: String },
}

impl From<WireError> for PublishError {
    fn from(err: WireError) -> Self {
        PublishError::Encoding(err.to_string())
    }
}

pub fn create_producer(args: &KafkaArgs) -> anyhow::Result<FutureProducer> {
    Ok(args.producer_config().create()?)
}

/// Turns domain events into wire envelopes for one topic's value schema.
pub struct EventEncoder {
    registry: Arc<dyn SchemaRegistry>,
    subject: String,
    schema: String,
}

impl EventEncoder {
    pub fn new(registry: Arc<dyn SchemaRegistry>, topic: &str, schema: &str) -> Self {
        Self {
            registry,
            subject: value_subject(topic),
            schema: schema.to_string(),
        }
    }

    pub async fn encode<T: Serialize + Sync>(&self, event: &T) -> Result<Vec<u8>, PublishError> {
        let schema_id = self
            .registry
            .register_or_reuse(&self.subject, &self.schema)
            .await?;
        let codec = self.registry.resolve(schema_id).await?;

        let json = serde_json::to_value(event).map_err(|e| PublishError::Encoding(e.to_string()))?;
        let binary = codec.binary_from_json(json)?;

        Ok(wire::encode(schema_id, &binary))
    }
}

/// Publishes events of one schema to one topic.
///
/// `publish` returns once the message sits in the producer's local queue.
/// Broker acknowledgement (leader-local by default, see `KafkaArgs`) is
/// awaited in the background and only logged.
pub struct Publisher {
    producer: FutureProducer,
    encoder: EventEncoder,
    topic: String,
}

impl Publisher {
    pub fn new(
        producer: FutureProducer,
        registry: Arc<dyn SchemaRegistry>,
        topic: impl Into<String>,
        schema: &str,
    ) -> Self {
        let topic = topic.into();
        Self {
            producer,
            encoder: EventEncoder::new(registry, &topic, schema),
            topic,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish<T: Serialize + Sync>(&self, key: &str, event: &T) -> Result<(), PublishError> {
        let payload = self.encoder.encode(event).await?;

        let record = FutureRecord::to(&self.topic).payload(&payload).key(key);
        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| PublishError::Enqueue {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?;

        let topic = self.topic.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => {
                    debug!(%topic, %key, partition, offset, "Message delivered");
                }
                Ok(Err((e, _))) => {
                    error!(%topic, %key, error = %e, "Message delivery failed");
                }
                Err(_) => {
                    error!(%topic, %key, "Producer dropped message before delivery");
                }
            }
        });

        Ok(())
    }
}
