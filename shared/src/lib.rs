//! Building blocks shared by the delivery services: the Avro wire format,
//! schema registry access, Kafka publishing and consuming, and the common
//! error, configuration and HTTP plumbing.

pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod http;
pub mod messages;
pub mod publisher;
pub mod registry;
pub mod shutdown;
pub mod telemetry;
pub mod wire;

pub use error::{Result, ServiceError};
