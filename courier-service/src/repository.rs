//! Courier storage and the order assignment transaction.
//!
//! Assignment must hand out at most one courier per order even when the same
//! order is consumed concurrently (redelivery, rebalances, several
//! instances). Postgres serializes callers per order with a transaction-scoped
//! advisory lock keyed by a hash of the order id; callers for different
//! orders only contend on the courier rows, which are claimed with
//! `FOR UPDATE SKIP LOCKED`.
//!
//! The transaction runs at the default READ COMMITTED level, not
//! SERIALIZABLE. The advisory lock orders all work on one order, and the
//! existing-assignment lookup runs after the lock is taken, so it sees any
//! assignment committed by an earlier holder. A courier row is only flipped
//! to unavailable while it is row-locked. Together these give the outcome a
//! serializable run would, without `40001` serialization failures to retry.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::DbPool;
use shared::{Result, ServiceError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::lock::KeyedLock;
use crate::models::*;
use crate::schema::*;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a of the textual order id, reinterpreted as the signed key
/// `pg_advisory_xact_lock` expects.
pub fn advisory_lock_key(order_id: Uuid) -> i64 {
    let hash = order_id
        .to_string()
        .bytes()
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
    hash as i64
}

#[async_trait]
pub trait CourierStore: Send + Sync {
    async fn insert_courier(&self, courier: &Courier) -> Result<()>;

    async fn find_courier(&self, courier_id: Uuid) -> Result<Courier>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Returns the order's assignment, claiming an available courier if the
    /// order has none yet. Fails with [`ServiceError::NoCourierAvailable`]
    /// and changes nothing when every courier is taken.
    async fn assign_order_to_courier(&self, order_id: Uuid) -> Result<CourierAssignment>;
}

#[derive(QueryableByName)]
struct ClaimedCourier {
    #[diesel(sql_type = diesel::sql_types::Uuid)]
    id: Uuid,
}

pub struct PgCourierRepository {
    pool: DbPool,
}

impl PgCourierRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CourierStore for PgCourierRepository {
    async fn insert_courier(&self, courier: &Courier) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(couriers::table)
            .values(courier)
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn find_courier(&self, courier_id: Uuid) -> Result<Courier> {
        let mut conn = self.pool.get().await?;

        couriers::table
            .find(courier_id)
            .select(Courier::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ServiceError::not_found("courier", courier_id))
    }
}

#[async_trait]
impl AssignmentStore for PgCourierRepository {
    async fn assign_order_to_courier(&self, order_id: Uuid) -> Result<CourierAssignment> {
        let mut conn = self.pool.get().await?;
        let lock_key = advisory_lock_key(order_id);

        conn.transaction::<_, ServiceError, _>(|conn| {
            Box::pin(async move {
                diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
                    .bind::<BigInt, _>(lock_key)
                    .execute(conn)
                    .await?;

                let existing = order_assignments::table
                    .find(order_id)
                    .select(CourierAssignment::as_select())
                    .first(conn)
                    .await
                    .optional()?;
                if let Some(assignment) = existing {
                    return Ok(assignment);
                }

                let claimed = diesel::sql_query(
                    "UPDATE couriers SET is_available = FALSE \
                     WHERE id = (SELECT id FROM couriers WHERE is_available LIMIT 1 FOR UPDATE SKIP LOCKED) \
                     RETURNING id",
                )
                .get_result::<ClaimedCourier>(conn)
                .await
                .optional()?
                .ok_or(ServiceError::NoCourierAvailable(order_id))?;

                let assignment = diesel::insert_into(order_assignments::table)
                    .values((
                        order_assignments::order_id.eq(order_id),
                        order_assignments::courier_id.eq(claimed.id),
                    ))
                    .returning(CourierAssignment::as_returning())
                    .get_result(conn)
                    .await?;

                Ok(assignment)
            })
        })
        .await
    }
}

/// Process-local store; [`KeyedLock`] stands in for the advisory lock.
#[derive(Default)]
pub struct InMemoryCourierRepository {
    couriers: Mutex<Vec<Courier>>,
    assignments: dashmap::DashMap<Uuid, CourierAssignment>,
    order_locks: KeyedLock<Uuid>,
}

impl InMemoryCourierRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn available_couriers(&self) -> usize {
        self.couriers
            .lock()
            .await
            .iter()
            .filter(|courier| courier.is_available)
            .count()
    }
}

#[async_trait]
impl CourierStore for InMemoryCourierRepository {
    async fn insert_courier(&self, courier: &Courier) -> Result<()> {
        self.couriers.lock().await.push(courier.clone());
        Ok(())
    }

    async fn find_courier(&self, courier_id: Uuid) -> Result<Courier> {
        self.couriers
            .lock()
            .await
            .iter()
            .find(|courier| courier.id == courier_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("courier", courier_id))
    }
}

#[async_trait]
impl AssignmentStore for InMemoryCourierRepository {
    async fn assign_order_to_courier(&self, order_id: Uuid) -> Result<CourierAssignment> {
        let _order_lock = self.order_locks.lock(order_id).await;

        if let Some(assignment) = self.assignments.get(&order_id) {
            return Ok(assignment.clone());
        }

        let courier_id = {
            let mut couriers = self.couriers.lock().await;
            let courier = couriers
                .iter_mut()
                .find(|courier| courier.is_available)
                .ok_or(ServiceError::NoCourierAvailable(order_id))?;
            courier.is_available = false;
            courier.id
        };

        let assignment = CourierAssignment {
            order_id,
            courier_id,
            created_at: Utc::now(),
        };
        self.assignments.insert(order_id, assignment.clone());
        Ok(assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn repository_with(couriers: usize) -> Arc<InMemoryCourierRepository> {
        let repo = Arc::new(InMemoryCourierRepository::new());
        for i in 0..couriers {
            repo.insert_courier(&Courier::new(format!("courier-{i}")))
                .await
                .unwrap();
        }
        repo
    }

    #[test]
    fn lock_key_is_fnv1a_of_the_textual_id() {
        let order_id = Uuid::parse_str("00000000-0000-0000-0000-000000000000").unwrap();

        // FNV-1a 64 of "00000000-0000-0000-0000-000000000000".
        let expected = "00000000-0000-0000-0000-000000000000"
            .bytes()
            .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));

        assert_eq!(advisory_lock_key(order_id), expected as i64);
        assert_ne!(advisory_lock_key(order_id), advisory_lock_key(Uuid::new_v4()));
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        let fnv = |input: &str| {
            input
                .bytes()
                .fold(FNV_OFFSET_BASIS, |h, b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
        };

        assert_eq!(fnv(""), 0xcbf29ce484222325);
        assert_eq!(fnv("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv("foobar"), 0x85944171f73967e8);
    }

    #[tokio::test]
    async fn concurrent_assignments_of_one_order_agree() {
        let repo = repository_with(5).await;
        let order_id = Uuid::new_v4();

        let results = join_all((0..16).map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.assign_order_to_courier(order_id).await })
        }))
        .await;

        let couriers: HashSet<Uuid> = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().courier_id)
            .collect();
        assert_eq!(couriers.len(), 1);
        assert_eq!(repo.available_couriers().await, 4);
    }

    #[tokio::test]
    async fn distinct_orders_get_distinct_couriers() {
        let repo = repository_with(4).await;

        let results = join_all((0..4).map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.assign_order_to_courier(Uuid::new_v4()).await })
        }))
        .await;

        let couriers: HashSet<Uuid> = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().courier_id)
            .collect();
        assert_eq!(couriers.len(), 4);
        assert_eq!(repo.available_couriers().await, 0);
    }

    #[tokio::test]
    async fn orders_beyond_capacity_find_no_courier() {
        let repo = repository_with(3).await;

        let results: Vec<_> = join_all((0..5).map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.assign_order_to_courier(Uuid::new_v4()).await })
        }))
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

        let assigned: HashSet<Uuid> = results
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|a| a.courier_id))
            .collect();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(ServiceError::NoCourierAvailable(_))))
            .count();

        assert_eq!(assigned.len(), 3);
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn rejected_order_can_be_assigned_later() {
        let repo = repository_with(0).await;
        let order_id = Uuid::new_v4();

        assert!(repo.assign_order_to_courier(order_id).await.is_err());

        let courier = Courier::new("late".to_string());
        repo.insert_courier(&courier).await.unwrap();

        let assignment = repo.assign_order_to_courier(order_id).await.unwrap();
        assert_eq!(assignment.courier_id, courier.id);
    }
}
