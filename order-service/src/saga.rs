//! Order validation saga.
//!
//! Services that must approve an order report a validation fact. Facts are
//! accumulated per order in an [`OrderValidation`] record; once the record is
//! valid the order is accepted and re-published with the `updated` event.
//!
//! Facts arrive at least once, so applying the same fact twice must leave the
//! same state: an unchanged record is not written again and the status only
//! transitions once. The `updated` event is published on every call that sees
//! a valid record, so a redelivered fact repairs a publish that failed after
//! the order was already stored as accepted.

use std::sync::Arc;

use chrono::Utc;
use shared::messages::{COURIER_SERVICE_NAME, EVENT_ORDER_CREATED, EVENT_ORDER_UPDATED};
use shared::{Result, ServiceError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Order, OrderStatus, OrderValidation};
use crate::publisher::OrderPublisher;
use crate::repository::{OrderStore, ValidationStore};

const DEFAULT_COURIER_ERROR: &str = "courier validation failed";

/// One validation fact as reported by a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFact {
    pub is_successful: bool,
    pub courier_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub order: Order,
    pub validation: OrderValidation,
    /// The order transitioned to accepted in this call.
    pub accepted: bool,
}

pub struct OrderService<R, P> {
    repo: Arc<R>,
    publisher: Arc<P>,
}

impl<R, P> OrderService<R, P>
where
    R: OrderStore + ValidationStore,
    P: OrderPublisher,
{
    pub fn new(repo: Arc<R>, publisher: Arc<P>) -> Self {
        Self { repo, publisher }
    }

    /// Stores a new pending order and announces it with the `created` event.
    pub async fn create_order(&self, customer_phone_number: &str) -> Result<Order> {
        validate_phone_number(customer_phone_number)?;

        let order = Order::new(customer_phone_number.to_string());
        self.repo.insert_order(&order).await?;
        self.publisher
            .publish_order(&order, EVENT_ORDER_CREATED)
            .await?;

        info!(order_id = %order.id, "Order created");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order> {
        self.repo.find_order(order_id).await
    }

    pub async fn validate_order_for_service(
        &self,
        service_name: &str,
        order_id: Uuid,
        fact: ValidationFact,
    ) -> Result<ValidationOutcome> {
        let mut order = self.repo.find_order(order_id).await?;
        let existing = self.repo.find_validation(order_id).await?;
        let mut validation = existing
            .clone()
            .unwrap_or_else(|| OrderValidation::new(order_id));

        let mut courier_changed = false;
        match service_name {
            COURIER_SERVICE_NAME => {
                if fact.is_successful {
                    if validation.courier_validated_at.is_none() {
                        validation.courier_validated_at = Some(Utc::now());
                    }
                    validation.courier_error = None;

                    if let Some(courier_id) = fact.courier_id {
                        courier_changed = order.courier_id != Some(courier_id);
                        order.courier_id = Some(courier_id);
                    }
                } else {
                    validation.courier_error = Some(
                        fact.error
                            .unwrap_or_else(|| DEFAULT_COURIER_ERROR.to_string()),
                    );
                }
            }
            other => {
                warn!(service_name = other, %order_id, "Ignoring validation from unknown service");
                return Ok(ValidationOutcome {
                    order,
                    validation,
                    accepted: false,
                });
            }
        }

        let validation = match existing {
            None => self.repo.insert_validation(&validation).await?,
            Some(previous) if previous.same_state(&validation) => previous,
            Some(previous) => {
                self.repo
                    .update_validation(&validation, previous.updated_at)
                    .await?
            }
        };

        let accepted = validation.is_valid() && order.status != OrderStatus::Accepted;
        if accepted {
            order.status = OrderStatus::Accepted;
        }

        if courier_changed || accepted {
            self.repo.update_order(&order).await?;
        }

        if validation.is_valid() {
            self.publisher
                .publish_order(&order, EVENT_ORDER_UPDATED)
                .await?;
            if accepted {
                info!(%order_id, courier_id = ?order.courier_id, "Order accepted");
            }
        }

        Ok(ValidationOutcome {
            order,
            validation,
            accepted,
        })
    }
}

/// E.164: a leading `+` and up to 15 digits, the first one non-zero.
pub fn validate_phone_number(phone_number: &str) -> Result<()> {
    let digits = phone_number.strip_prefix('+').unwrap_or("");
    let valid = (2..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0');

    if valid {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "customer_phone_number {phone_number:?} is not an E.164 phone number"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RecordingOrderPublisher;
    use crate::repository::InMemoryOrderRepository;
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Barrier;

    type Service = OrderService<InMemoryOrderRepository, RecordingOrderPublisher>;

    fn service() -> (Service, Arc<InMemoryOrderRepository>, Arc<RecordingOrderPublisher>) {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let publisher = Arc::new(RecordingOrderPublisher::default());
        (
            OrderService::new(repo.clone(), publisher.clone()),
            repo,
            publisher,
        )
    }

    fn courier_ok(courier_id: Uuid) -> ValidationFact {
        ValidationFact {
            is_successful: true,
            courier_id: Some(courier_id),
            error: None,
        }
    }

    #[tokio::test]
    async fn create_order_is_pending_and_announced() {
        let (service, _, publisher) = service();

        let order = service.create_order("+380501234567").await.unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(
            publisher.events(),
            vec![(order.id, EVENT_ORDER_CREATED.to_string())]
        );
        assert_eq!(service.get_order(order.id).await.unwrap(), order);
    }

    #[tokio::test]
    async fn create_order_rejects_bad_phone_number() {
        let (service, _, publisher) = service();

        let err = service.create_order("0501234567").await.unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn courier_fact_accepts_order_once_and_replay_republishes() {
        let (service, _, publisher) = service();
        let order = service.create_order("+380501234567").await.unwrap();
        let courier_id = Uuid::new_v4();

        let first = service
            .validate_order_for_service(COURIER_SERVICE_NAME, order.id, courier_ok(courier_id))
            .await
            .unwrap();
        let replay = service
            .validate_order_for_service(COURIER_SERVICE_NAME, order.id, courier_ok(courier_id))
            .await
            .unwrap();

        assert!(first.accepted);
        assert!(!replay.accepted);
        assert_eq!(replay.validation, first.validation);

        let stored = service.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Accepted);
        assert_eq!(stored.courier_id, Some(courier_id));

        let updates: Vec<_> = publisher
            .events()
            .into_iter()
            .filter(|(_, event)| event == EVENT_ORDER_UPDATED)
            .collect();
        assert_eq!(
            updates,
            vec![
                (order.id, EVENT_ORDER_UPDATED.to_string()),
                (order.id, EVENT_ORDER_UPDATED.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn redelivery_republishes_after_failed_publish() {
        let (service, _, publisher) = service();
        let order = service.create_order("+380501234567").await.unwrap();
        let courier_id = Uuid::new_v4();
        publisher.fail_next_publishes(1);

        let first = service
            .validate_order_for_service(COURIER_SERVICE_NAME, order.id, courier_ok(courier_id))
            .await;
        assert!(matches!(first, Err(ServiceError::Transport(_))));
        assert_eq!(
            service.get_order(order.id).await.unwrap().status,
            OrderStatus::Accepted
        );

        let redelivered = service
            .validate_order_for_service(COURIER_SERVICE_NAME, order.id, courier_ok(courier_id))
            .await
            .unwrap();

        assert!(!redelivered.accepted);
        assert_eq!(
            publisher.events(),
            vec![
                (order.id, EVENT_ORDER_CREATED.to_string()),
                (order.id, EVENT_ORDER_UPDATED.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_fact_after_acceptance_publishes_nothing() {
        let (service, _, publisher) = service();
        let order = service.create_order("+380501234567").await.unwrap();
        service
            .validate_order_for_service(COURIER_SERVICE_NAME, order.id, courier_ok(Uuid::new_v4()))
            .await
            .unwrap();

        service
            .validate_order_for_service(
                COURIER_SERVICE_NAME,
                order.id,
                ValidationFact {
                    is_successful: false,
                    courier_id: None,
                    error: Some("courier went offline".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(publisher.events().len(), 2);
        assert_eq!(
            service.get_order(order.id).await.unwrap().status,
            OrderStatus::Accepted
        );
    }

    #[tokio::test]
    async fn failed_courier_fact_keeps_order_pending() {
        let (service, _, publisher) = service();
        let order = service.create_order("+380501234567").await.unwrap();

        let outcome = service
            .validate_order_for_service(
                COURIER_SERVICE_NAME,
                order.id,
                ValidationFact {
                    is_successful: false,
                    courier_id: None,
                    error: Some("no courier available".to_string()),
                },
            )
            .await
            .unwrap();

        assert!(!outcome.accepted);
        assert_eq!(
            outcome.validation.courier_error.as_deref(),
            Some("no courier available")
        );
        assert_eq!(
            service.get_order(order.id).await.unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn unknown_service_is_ignored() {
        let (service, repo, publisher) = service();
        let order = service.create_order("+380501234567").await.unwrap();

        let outcome = service
            .validate_order_for_service("payment", order.id, courier_ok(Uuid::new_v4()))
            .await
            .unwrap();

        assert!(!outcome.accepted);
        assert!(repo.find_validation(order.id).await.unwrap().is_none());
        assert_eq!(publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let (service, _, _) = service();

        let err = service
            .validate_order_for_service(COURIER_SERVICE_NAME, Uuid::new_v4(), courier_ok(Uuid::new_v4()))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    /// Lets two sagas read the same validation snapshot before either writes.
    struct SnapshotRace {
        inner: InMemoryOrderRepository,
        barrier: Barrier,
    }

    #[async_trait]
    impl OrderStore for SnapshotRace {
        async fn insert_order(&self, order: &Order) -> Result<()> {
            self.inner.insert_order(order).await
        }

        async fn find_order(&self, order_id: Uuid) -> Result<Order> {
            self.inner.find_order(order_id).await
        }

        async fn update_order(&self, order: &Order) -> Result<()> {
            self.inner.update_order(order).await
        }
    }

    #[async_trait]
    impl ValidationStore for SnapshotRace {
        async fn find_validation(&self, order_id: Uuid) -> Result<Option<OrderValidation>> {
            let snapshot = self.inner.find_validation(order_id).await;
            self.barrier.wait().await;
            snapshot
        }

        async fn insert_validation(&self, validation: &OrderValidation) -> Result<OrderValidation> {
            self.inner.insert_validation(validation).await
        }

        async fn update_validation(
            &self,
            validation: &OrderValidation,
            expected_updated_at: DateTime<Utc>,
        ) -> Result<OrderValidation> {
            self.inner
                .update_validation(validation, expected_updated_at)
                .await
        }
    }

    #[tokio::test]
    async fn racing_first_facts_yield_one_conflict() {
        let repo = Arc::new(SnapshotRace {
            inner: InMemoryOrderRepository::new(),
            barrier: Barrier::new(2),
        });
        let publisher = Arc::new(RecordingOrderPublisher::default());
        let service = OrderService::new(repo.clone(), publisher.clone());

        let order = Order::new("+380501234567".to_string());
        repo.insert_order(&order).await.unwrap();

        let (a, b) = tokio::join!(
            service.validate_order_for_service(COURIER_SERVICE_NAME, order.id, courier_ok(Uuid::new_v4())),
            service.validate_order_for_service(
                COURIER_SERVICE_NAME,
                order.id,
                ValidationFact {
                    is_successful: false,
                    courier_id: None,
                    error: Some("rejected".to_string()),
                },
            ),
        );

        let results = [a.map(|_| ()), b.map(|_| ())];
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(ServiceError::ConcurrentValidationConflict(_))))
            .count();
        let successes = results.iter().filter(|r| r.is_ok()).count();

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn racing_updates_yield_one_conflict() {
        let repo = Arc::new(SnapshotRace {
            inner: InMemoryOrderRepository::new(),
            barrier: Barrier::new(2),
        });
        let publisher = Arc::new(RecordingOrderPublisher::default());
        let service = OrderService::new(repo.clone(), publisher);

        let order = Order::new("+380501234567".to_string());
        repo.insert_order(&order).await.unwrap();
        repo.inner
            .insert_validation(&OrderValidation::new(order.id))
            .await
            .unwrap();

        let failure = |error: &str| ValidationFact {
            is_successful: false,
            courier_id: None,
            error: Some(error.to_string()),
        };
        let (a, b) = tokio::join!(
            service.validate_order_for_service(COURIER_SERVICE_NAME, order.id, failure("first")),
            service.validate_order_for_service(COURIER_SERVICE_NAME, order.id, failure("second")),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(a.err().or(b.err()).is_some_and(|e| e.is_conflict()));
    }

    #[test]
    fn phone_numbers_follow_e164() {
        assert!(validate_phone_number("+14155552671").is_ok());
        assert!(validate_phone_number("+380501234567").is_ok());
        assert!(validate_phone_number("14155552671").is_err());
        assert!(validate_phone_number("+0123").is_err());
        assert!(validate_phone_number("+1234567890123456").is_err());
        assert!(validate_phone_number("+1-415-555").is_err());
    }
}
