use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::ServiceError;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Accepted,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
        }
    }

    fn from_db(status: &str) -> Result<Self, ServiceError> {
        match status {
            "pending" => Ok(OrderStatus::Pending),
            "accepted" => Ok(OrderStatus::Accepted),
            other => Err(ServiceError::Storage(
                diesel::result::Error::DeserializationError(
                    format!("unknown order status {other:?}").into(),
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub courier_id: Option<Uuid>,
    pub customer_phone_number: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(customer_phone_number: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            courier_id: None,
            customer_phone_number,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Accumulated validation results for one order.
///
/// `updated_at` doubles as the optimistic-concurrency token: an update only
/// applies if the stored token still equals the one that was read.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderValidation {
    pub order_id: Uuid,
    pub courier_validated_at: Option<DateTime<Utc>>,
    pub courier_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OrderValidation {
    pub fn new(order_id: Uuid) -> Self {
        Self {
            order_id,
            courier_validated_at: None,
            courier_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Every required service has reported and none reported an error.
    pub fn is_valid(&self) -> bool {
        self.courier_validated_at.is_some() && self.courier_error.is_none()
    }

    /// Same validation state, ignoring the concurrency token.
    pub fn same_state(&self, other: &OrderValidation) -> bool {
        self.courier_validated_at == other.courier_validated_at
            && self.courier_error == other.courier_error
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub courier_id: Option<Uuid>,
    pub customer_phone_number: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for DbOrder {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            courier_id: order.courier_id,
            customer_phone_number: order.customer_phone_number.clone(),
            status: order.status.as_str().to_string(),
            created_at: order.created_at,
        }
    }
}

impl TryFrom<DbOrder> for Order {
    type Error = ServiceError;

    fn try_from(row: DbOrder) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            courier_id: row.courier_id,
            customer_phone_number: row.customer_phone_number,
            status: OrderStatus::from_db(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::order_validations)]
pub struct DbOrderValidation {
    pub order_id: Uuid,
    pub courier_validated_at: Option<DateTime<Utc>>,
    pub courier_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_validations)]
pub struct NewOrderValidation {
    pub order_id: Uuid,
    pub courier_validated_at: Option<DateTime<Utc>>,
    pub courier_error: Option<String>,
}

impl From<DbOrderValidation> for OrderValidation {
    fn from(row: DbOrderValidation) -> Self {
        Self {
            order_id: row.order_id,
            courier_validated_at: row.courier_validated_at,
            courier_error: row.courier_error,
            updated_at: row.updated_at,
        }
    }
}
