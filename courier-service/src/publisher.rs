use async_trait::async_trait;
use shared::messages::{OrderValidationMessage, ValidationPayload, COURIER_SERVICE_NAME};
use shared::publisher::Publisher;
use shared::Result;

use crate::models::CourierAssignment;

#[async_trait]
pub trait ValidationPublisher: Send + Sync {
    async fn publish_validation(&self, message: &OrderValidationMessage) -> Result<()>;
}

pub fn assignment_succeeded(assignment: &CourierAssignment) -> OrderValidationMessage {
    OrderValidationMessage {
        is_successful: true,
        service_name: COURIER_SERVICE_NAME.to_string(),
        order_id: assignment.order_id.to_string(),
        payload: ValidationPayload {
            courier_id: Some(assignment.courier_id.to_string()),
        },
        error: None,
    }
}

/// Publishes courier validation facts to `order_validations.v1`, keyed by
/// order id.
pub struct KafkaValidationPublisher {
    publisher: Publisher,
}

impl KafkaValidationPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ValidationPublisher for KafkaValidationPublisher {
    async fn publish_validation(&self, message: &OrderValidationMessage) -> Result<()> {
        self.publisher.publish(&message.order_id, message).await?;
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingValidationPublisher;
