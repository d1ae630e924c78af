use async_trait::async_trait;
use shared::messages::{OrderMessage, OrderPayload};
use shared::publisher::Publisher;
use shared::Result;

use crate::models::Order;

#[async_trait]
pub trait OrderPublisher: Send + Sync {
    async fn publish_order(&self, order: &Order, event: &str) -> Result<()>;
}

/// Publishes order events to `orders.v1`, keyed by order id.
pub struct KafkaOrderPublisher {
    publisher: Publisher,
}

impl KafkaOrderPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

pub fn order_message(order: &Order, event: &str) -> OrderMessage {
    OrderMessage {
        event: event.to_string(),
        payload: OrderPayload {
            order_id: order.id.to_string(),
        },
    }
}

#[async_trait]
impl OrderPublisher for KafkaOrderPublisher {
    async fn publish_order(&self, order: &Order, event: &str) -> Result<()> {
        let key = order.id.to_string();
        self.publisher
            .publish(&key, &order_message(order, event))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub use recording::RecordingOrderPublisher;
