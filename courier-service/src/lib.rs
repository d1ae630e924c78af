pub mod api;
pub mod consumer;
pub mod location_client;
pub mod lock;
pub mod models;
pub mod publisher;
pub mod repository;
pub mod schema;
pub mod service;
