//! Bus contracts shared between the services: topic names, Avro schemas and
//! the serde types that mirror them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ORDER_TOPIC: &str = "orders.v1";
pub const ORDER_VALIDATION_TOPIC: &str = "order_validations.v1";
pub const COURIER_LOCATION_TOPIC: &str = "courier_latest_positions.v1";

pub const EVENT_ORDER_CREATED: &str = "created";
pub const EVENT_ORDER_UPDATED: &str = "updated";

/// Service name the courier service stamps on its validation facts.
pub const COURIER_SERVICE_NAME: &str = "courier";

pub const ORDER_MESSAGE_SCHEMA: &str = r#"{
  "type": "record",
  "name": "OrderMessage",
  "namespace": "delivery.order.v1",
  "fields": [
    { "name": "event", "type": "string" },
    {
      "name": "payload",
      "type": {
        "type": "record",
        "name": "OrderPayload",
        "fields": [ { "name": "order_id", "type": "string" } ]
      }
    }
  ]
}"#;

pub const ORDER_VALIDATION_SCHEMA: &str = r#"{
  "type": "record",
  "name": "OrderValidationMessage",
  "namespace": "delivery.order.v1",
  "fields": [
    { "name": "is_successful", "type": "boolean" },
    { "name": "service_name", "type": "string" },
    { "name": "order_id", "type": "string" },
    {
      "name": "payload",
      "type": {
        "type": "record",
        "name": "ValidationPayload",
        "fields": [ { "name": "courier_id", "type": ["null", "string"], "default": null } ]
      }
    },
    { "name": "error", "type": ["null", "string"], "default": null }
  ]
}"#;

pub const COURIER_LOCATION_SCHEMA: &str = r#"{
  "type": "record",
  "name": "CourierLocationMessage",
  "namespace": "delivery.location.v1",
  "fields": [
    { "name": "courier_id", "type": "string" },
    { "name": "latitude", "type": "double" },
    { "name": "longitude", "type": "double" },
    { "name": "created_at", "type": "string" }
  ]
}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub order_id: String,
}

/// Published by the order service on `created` and `updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub event: String,
    pub payload: OrderPayload,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationPayload {
    #[serde(default)]
    pub courier_id: Option<String>,
}

/// A validation fact emitted by a service that must bless an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderValidationMessage {
    pub is_successful: bool,
    pub service_name: String,
    pub order_id: String,
    pub payload: ValidationPayload,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierLocationMessage {
    pub courier_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
}

/// Registry subject for the value schema of a topic.
pub fn value_subject(topic: &str) -> String {
    format!("{topic}-value")
}
