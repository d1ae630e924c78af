use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use shared::db::DbPool;
use shared::{Result, ServiceError};
use uuid::Uuid;

use crate::models::{CourierLocation, LatestPosition};
use crate::schema::courier_latest_cord;

#[async_trait]
pub trait LocationWriter: Send + Sync {
    /// Idempotent on `(courier_id, created_at)`: a repeated report is ignored.
    async fn save_location(&self, location: &CourierLocation) -> Result<()>;
}

#[async_trait]
pub trait LatestPositionReader: Send + Sync {
    /// Most recent position by `created_at`, `NotFound` if the courier never
    /// reported one.
    async fn latest_position(&self, courier_id: Uuid) -> Result<LatestPosition>;
}

pub struct PgLocationRepository {
    pool: DbPool,
}

impl PgLocationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocationWriter for PgLocationRepository {
    async fn save_location(&self, location: &CourierLocation) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(courier_latest_cord::table)
            .values(location)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl LatestPositionReader for PgLocationRepository {
    async fn latest_position(&self, courier_id: Uuid) -> Result<LatestPosition> {
        let mut conn = self.pool.get().await?;

        courier_latest_cord::table
            .filter(courier_latest_cord::courier_id.eq(courier_id))
            .order(courier_latest_cord::created_at.desc())
            .select((courier_latest_cord::latitude, courier_latest_cord::longitude))
            .first::<LatestPosition>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ServiceError::not_found("courier position", courier_id))
    }
}

#[derive(Default)]
pub struct InMemoryLocationRepository {
    locations: DashMap<Uuid, BTreeMap<DateTime<Utc>, CourierLocation>>,
}

impl InMemoryLocationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, courier_id: Uuid) -> usize {
        self.locations
            .get(&courier_id)
            .map(|history| history.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LocationWriter for InMemoryLocationRepository {
    async fn save_location(&self, location: &CourierLocation) -> Result<()> {
        self.locations
            .entry(location.courier_id)
            .or_default()
            .entry(location.created_at)
            .or_insert_with(|| location.clone());
        Ok(())
    }
}

#[async_trait]
impl LatestPositionReader for InMemoryLocationRepository {
    async fn latest_position(&self, courier_id: Uuid) -> Result<LatestPosition> {
        self.locations
            .get(&courier_id)
            .and_then(|history| history.values().next_back().map(LatestPosition::from))
            .ok_or_else(|| ServiceError::not_found("courier position", courier_id))
    }
}
