use std::sync::Arc;

use async_trait::async_trait;
use shared::consumer::MessageHandler;
use shared::messages::OrderValidationMessage;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::publisher::OrderPublisher;
use crate::repository::{OrderStore, ValidationStore};
use crate::saga::{OrderService, ValidationFact};

/// Feeds `order_validations.v1` facts into the saga.
pub struct ValidationHandler<R, P> {
    service: Arc<OrderService<R, P>>,
}

impl<R, P> ValidationHandler<R, P> {
    pub fn new(service: Arc<OrderService<R, P>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<R, P> MessageHandler for ValidationHandler<R, P>
where
    R: OrderStore + ValidationStore + 'static,
    P: OrderPublisher + 'static,
{
    async fn handle(&self, message: serde_json::Value) -> anyhow::Result<()> {
        let message: OrderValidationMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse order validation, skipping");
                return Ok(());
            }
        };

        let Ok(order_id) = Uuid::parse_str(&message.order_id) else {
            warn!(order_id = %message.order_id, "Order validation has an invalid order id, skipping");
            return Ok(());
        };
        let courier_id = match message.payload.courier_id.as_deref().map(Uuid::parse_str) {
            None => None,
            Some(Ok(courier_id)) => Some(courier_id),
            Some(Err(e)) => {
                warn!(%order_id, error = %e, "Order validation has an invalid courier id, skipping");
                return Ok(());
            }
        };

        let fact = ValidationFact {
            is_successful: message.is_successful,
            courier_id,
            error: message.error,
        };

        match self
            .service
            .validate_order_for_service(&message.service_name, order_id, fact)
            .await
        {
            Ok(outcome) => {
                info!(
                    %order_id,
                    service_name = %message.service_name,
                    accepted = outcome.accepted,
                    "Order validation applied"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                // Redelivery cannot make the order appear.
                error!(%order_id, error = %e, "Validation for unknown order dropped");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("failed to validate order {order_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::publisher::RecordingOrderPublisher;
    use crate::repository::InMemoryOrderRepository;
    use serde_json::json;
    use shared::messages::{EVENT_ORDER_UPDATED, COURIER_SERVICE_NAME};

    async fn fixture() -> (
        ValidationHandler<InMemoryOrderRepository, RecordingOrderPublisher>,
        Arc<OrderService<InMemoryOrderRepository, RecordingOrderPublisher>>,
        Arc<RecordingOrderPublisher>,
    ) {
        let publisher = Arc::new(RecordingOrderPublisher::default());
        let service = Arc::new(OrderService::new(
            Arc::new(InMemoryOrderRepository::new()),
            publisher.clone(),
        ));
        (ValidationHandler::new(service.clone()), service, publisher)
    }

    #[tokio::test]
    async fn courier_fact_accepts_the_order() {
        let (handler, service, publisher) = fixture().await;
        let order = service.create_order("+380501234567").await.unwrap();
        let courier_id = Uuid::new_v4();

        handler
            .handle(json!({
                "is_successful": true,
                "service_name": COURIER_SERVICE_NAME,
                "order_id": order.id.to_string(),
                "payload": { "courier_id": courier_id.to_string() },
                "error": null
            }))
            .await
            .unwrap();

        let stored = service.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Accepted);
        assert_eq!(stored.courier_id, Some(courier_id));
        assert!(publisher
            .events()
            .contains(&(order.id, EVENT_ORDER_UPDATED.to_string())));
    }

    #[tokio::test]
    async fn unparsable_fact_is_acknowledged() {
        let (handler, _, _) = fixture().await;

        handler.handle(json!({ "unexpected": 1 })).await.unwrap();
        handler
            .handle(json!({
                "is_successful": true,
                "service_name": COURIER_SERVICE_NAME,
                "order_id": "not-a-uuid",
                "payload": { "courier_id": null },
                "error": null
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fact_for_unknown_order_is_acknowledged() {
        let (handler, _, publisher) = fixture().await;

        handler
            .handle(json!({
                "is_successful": true,
                "service_name": COURIER_SERVICE_NAME,
                "order_id": Uuid::new_v4().to_string(),
                "payload": { "courier_id": Uuid::new_v4().to_string() },
                "error": null
            }))
            .await
            .unwrap();

        assert!(publisher.events().is_empty());
    }
}
