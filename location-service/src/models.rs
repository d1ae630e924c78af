use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::messages::CourierLocationMessage;
use uuid::Uuid;

/// One reported courier position.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::courier_latest_cord)]
pub struct CourierLocation {
    pub courier_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
}

impl CourierLocation {
    pub fn to_message(&self) -> CourierLocationMessage {
        CourierLocationMessage {
            courier_id: self.courier_id.to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Queryable)]
pub struct LatestPosition {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&CourierLocation> for LatestPosition {
    fn from(location: &CourierLocation) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
        }
    }
}
