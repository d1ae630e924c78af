use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::couriers)]
pub struct Courier {
    pub id: Uuid,
    pub firstname: String,
    pub is_available: bool,
}

impl Courier {
    pub fn new(firstname: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            firstname,
            is_available: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::order_assignments)]
pub struct CourierAssignment {
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatestPosition {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourierWithLatestPosition {
    pub id: Uuid,
    pub firstname: String,
    pub is_available: bool,
    pub latest_position: Option<LatestPosition>,
}
