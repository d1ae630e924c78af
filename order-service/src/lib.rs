pub mod api;
pub mod consumer;
pub mod models;
pub mod publisher;
pub mod repository;
pub mod saga;
pub mod schema;
