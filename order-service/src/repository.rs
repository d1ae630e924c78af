use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::RunQueryDsl;
use shared::db::DbPool;
use shared::{Result, ServiceError};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn find_order(&self, order_id: Uuid) -> Result<Order>;

    /// Writes courier id and status.
    async fn update_order(&self, order: &Order) -> Result<()>;
}

#[async_trait]
pub trait ValidationStore: Send + Sync {
    async fn find_validation(&self, order_id: Uuid) -> Result<Option<OrderValidation>>;

    /// Creates the record; a record that already exists is a
    /// [`ServiceError::ConcurrentValidationConflict`].
    async fn insert_validation(&self, validation: &OrderValidation) -> Result<OrderValidation>;

    /// Replaces the record if its token still equals `expected_updated_at`,
    /// otherwise fails with [`ServiceError::ConcurrentValidationConflict`].
    async fn update_validation(
        &self,
        validation: &OrderValidation,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<OrderValidation>;
}

pub struct PgOrderRepository {
    pool: DbPool,
}

impl PgOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderRepository {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(orders::table)
            .values(DbOrder::from(order))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Order> {
        let mut conn = self.pool.get().await?;

        let row = orders::table
            .find(order_id)
            .select(DbOrder::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.ok_or_else(|| ServiceError::not_found("order", order_id))?
            .try_into()
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(orders::table.find(order.id))
            .set((
                orders::courier_id.eq(order.courier_id),
                orders::status.eq(order.status.as_str()),
            ))
            .execute(&mut conn)
            .await?;

        if updated == 0 {
            return Err(ServiceError::not_found("order", order.id));
        }
        Ok(())
    }
}

#[async_trait]
impl ValidationStore for PgOrderRepository {
    async fn find_validation(&self, order_id: Uuid) -> Result<Option<OrderValidation>> {
        let mut conn = self.pool.get().await?;

        let row = order_validations::table
            .find(order_id)
            .select(DbOrderValidation::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(OrderValidation::from))
    }

    async fn insert_validation(&self, validation: &OrderValidation) -> Result<OrderValidation> {
        let mut conn = self.pool.get().await?;

        let new_validation = NewOrderValidation {
            order_id: validation.order_id,
            courier_validated_at: validation.courier_validated_at,
            courier_error: validation.courier_error.clone(),
        };

        let inserted = diesel::insert_into(order_validations::table)
            .values(&new_validation)
            .returning(DbOrderValidation::as_returning())
            .get_result(&mut conn)
            .await;

        match inserted {
            Ok(row) => Ok(row.into()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Err(
                ServiceError::ConcurrentValidationConflict(validation.order_id),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_validation(
        &self,
        validation: &OrderValidation,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<OrderValidation> {
        let mut conn = self.pool.get().await?;

        // The new token is computed by the database so it always round-trips
        // at storage precision and never goes backwards.
        let next_token = diesel::dsl::sql::<diesel::sql_types::Timestamptz>(
            "GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')",
        );

        let updated = diesel::update(
            order_validations::table
                .filter(order_validations::order_id.eq(validation.order_id))
                .filter(order_validations::updated_at.eq(expected_updated_at)),
        )
        .set((
            order_validations::courier_validated_at.eq(validation.courier_validated_at),
            order_validations::courier_error.eq(validation.courier_error.clone()),
            order_validations::updated_at.eq(next_token),
        ))
        .returning(DbOrderValidation::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        updated
            .map(OrderValidation::from)
            .ok_or(ServiceError::ConcurrentValidationConflict(validation.order_id))
    }
}

/// Process-local store with the same conflict semantics as Postgres.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: DashMap<Uuid, Order>,
    validations: DashMap<Uuid, OrderValidation>,
    last_token: AtomicI64,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly increasing microsecond timestamps.
    fn next_token(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_token
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let token = now.max(previous + 1);
        DateTime::from_timestamp_micros(token).unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderRepository {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Order> {
        self.orders
            .get(&order_id)
            .map(|order| order.value().clone())
            .ok_or_else(|| ServiceError::not_found("order", order_id))
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut stored = self
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| ServiceError::not_found("order", order.id))?;
        stored.courier_id = order.courier_id;
        stored.status = order.status;
        Ok(())
    }
}

#[async_trait]
impl ValidationStore for InMemoryOrderRepository {
    async fn find_validation(&self, order_id: Uuid) -> Result<Option<OrderValidation>> {
        Ok(self
            .validations
            .get(&order_id)
            .map(|validation| validation.value().clone()))
    }

    async fn insert_validation(&self, validation: &OrderValidation) -> Result<OrderValidation> {
        match self.validations.entry(validation.order_id) {
            Entry::Occupied(_) => Err(ServiceError::ConcurrentValidationConflict(
                validation.order_id,
            )),
            Entry::Vacant(slot) => {
                let stored = OrderValidation {
                    updated_at: self.next_token(),
                    ..validation.clone()
                };
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_validation(
        &self,
        validation: &OrderValidation,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<OrderValidation> {
        let conflict = ServiceError::ConcurrentValidationConflict(validation.order_id);
        let mut stored = self.validations.get_mut(&validation.order_id).ok_or(conflict)?;
        if stored.updated_at != expected_updated_at {
            return Err(ServiceError::ConcurrentValidationConflict(
                validation.order_id,
            ));
        }

        *stored = OrderValidation {
            updated_at: self.next_token(),
            ..validation.clone()
        };
        Ok(stored.clone())
    }
}
