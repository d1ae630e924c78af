use async_trait::async_trait;
use shared::messages::CourierLocationMessage;
use shared::publisher::Publisher;
use shared::Result;

#[async_trait]
pub trait LocationPublisher: Send + Sync {
    async fn publish_location(&self, message: &CourierLocationMessage) -> Result<()>;
}

/// Publishes positions to `courier_latest_positions.v1`, keyed by courier id
/// so one courier's reports stay ordered.
pub struct KafkaLocationPublisher {
    publisher: Publisher,
}

impl KafkaLocationPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl LocationPublisher for KafkaLocationPublisher {
    async fn publish_location(&self, message: &CourierLocationMessage) -> Result<()> {
        self.publisher.publish(&message.courier_id, message).await?;
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingLocationPublisher;
