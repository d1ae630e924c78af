use std::sync::Arc;

use async_trait::async_trait;
use shared::consumer::MessageHandler;
use shared::messages::{OrderMessage, EVENT_ORDER_UPDATED};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::location_client::LocationClient;
use crate::publisher::ValidationPublisher;
use crate::repository::{AssignmentStore, CourierStore};
use crate::service::CourierService;

/// Assigns a courier to every order announced on `orders.v1`.
pub struct OrderHandler<R, L, P> {
    service: Arc<CourierService<R, L, P>>,
}

impl<R, L, P> OrderHandler<R, L, P> {
    pub fn new(service: Arc<CourierService<R, L, P>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<R, L, P> MessageHandler for OrderHandler<R, L, P>
where
    R: CourierStore + AssignmentStore + 'static,
    L: LocationClient + 'static,
    P: ValidationPublisher + 'static,
{
    async fn handle(&self, message: serde_json::Value) -> anyhow::Result<()> {
        let message: OrderMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse order message, skipping");
                return Ok(());
            }
        };

        if message.event == EVENT_ORDER_UPDATED {
            debug!(order_id = %message.payload.order_id, "Skipping updated order");
            return Ok(());
        }

        let Ok(order_id) = Uuid::parse_str(&message.payload.order_id) else {
            warn!(order_id = %message.payload.order_id, "Order message has an invalid order id, skipping");
            return Ok(());
        };

        self.service
            .assign_order_to_courier(order_id)
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("can not assign order {order_id} to courier")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::service;
    use serde_json::json;
    use shared::messages::EVENT_ORDER_CREATED;

    #[tokio::test]
    async fn created_order_gets_a_courier() {
        let (service, repo, _, publisher) = service();
        service.create_courier("Olena").await.unwrap();
        let handler = OrderHandler::new(Arc::new(service));
        let order_id = Uuid::new_v4();

        handler
            .handle(json!({ "event": EVENT_ORDER_CREATED, "payload": { "order_id": order_id.to_string() } }))
            .await
            .unwrap();

        assert_eq!(repo.available_couriers().await, 0);
        assert_eq!(publisher.messages()[0].order_id, order_id.to_string());
    }

    #[tokio::test]
    async fn order_without_free_courier_is_redelivered() {
        let (service, repo, _, publisher) = service();
        let service = Arc::new(service);
        let handler = OrderHandler::new(service.clone());
        let order_id = Uuid::new_v4();
        let message = json!({ "event": EVENT_ORDER_CREATED, "payload": { "order_id": order_id.to_string() } });

        let err = handler.handle(message.clone()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<shared::ServiceError>(),
            Some(shared::ServiceError::NoCourierAvailable(_))
        ));
        assert!(publisher.messages().is_empty());

        service.create_courier("Olena").await.unwrap();
        handler.handle(message).await.unwrap();

        assert_eq!(repo.available_couriers().await, 0);
        assert_eq!(publisher.messages()[0].order_id, order_id.to_string());
    }

    #[tokio::test]
    async fn updated_and_malformed_orders_are_skipped() {
        let (service, repo, _, publisher) = service();
        service.create_courier("Olena").await.unwrap();
        let handler = OrderHandler::new(Arc::new(service));

        handler
            .handle(json!({ "event": EVENT_ORDER_UPDATED, "payload": { "order_id": Uuid::new_v4().to_string() } }))
            .await
            .unwrap();
        handler.handle(json!({ "event": 42 })).await.unwrap();
        handler
            .handle(json!({ "event": EVENT_ORDER_CREATED, "payload": { "order_id": "nope" } }))
            .await
            .unwrap();

        assert_eq!(repo.available_couriers().await, 1);
        assert!(publisher.messages().is_empty());
    }
}
