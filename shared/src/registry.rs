//! Schema registry clients.
//!
//! Both directions are cached for the lifetime of the process: schema id to
//! compiled codec for consumers, `(subject, schema text)` to schema id for
//! publishers. Registered schemas are immutable, so nothing is ever evicted.
//! Failures are returned to the caller untouched; retrying is the caller's
//! policy.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::wire::{AvroCodec, WireError};

const SCHEMA_REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("schema {0} is not registered")]
    SchemaNotFound(u32),

    #[error("schema registry request failed: {0}")]
    Transport(String),

    #[error("schema registry returned {status}: {message}")]
    Registry { status: u16, message: String },

    #[error(transparent)]
    Schema(#[from] WireError),
}

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Returns the codec for a schema id, fetching and compiling it once.
    async fn resolve(&self, schema_id: u32) -> Result<Arc<AvroCodec>, RegistryError>;

    /// Registers `schema` under `subject` unless that exact schema is already
    /// there, and returns its id.
    async fn register_or_reuse(&self, subject: &str, schema: &str) -> Result<u32, RegistryError>;
}

#[derive(Debug, Deserialize)]
struct SchemaResponse {
    schema: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: String,
}

/// HTTP client for a Confluent-compatible schema registry.
pub struct CachedSchemaRegistryClient {
    http: reqwest::Client,
    base_url: String,
    codecs: DashMap<u32, Arc<AvroCodec>>,
    ids: DashMap<(String, String), u32>,
}

impl CachedSchemaRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            codecs: DashMap::new(),
            ids: DashMap::new(),
        }
    }

    async fn error_from(response: reqwest::Response) -> RegistryError {
        let status = response.status().as_u16();
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.message,
            Err(e) => e.to_string(),
        };
        RegistryError::Registry { status, message }
    }
}

#[async_trait]
impl SchemaRegistry for CachedSchemaRegistryClient {
    async fn resolve(&self, schema_id: u32) -> Result<Arc<AvroCodec>, RegistryError> {
        if let Some(codec) = self.codecs.get(&schema_id) {
            return Ok(Arc::clone(codec.value()));
        }

        let url = format!("{}/schemas/ids/{}", self.base_url, schema_id);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, SCHEMA_REGISTRY_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::SchemaNotFound(schema_id));
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: SchemaResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        let codec = Arc::new(AvroCodec::new(&body.schema)?);
        debug!(schema_id, "Cached schema from registry");

        let cached = self.codecs.entry(schema_id).or_insert(codec);
        Ok(Arc::clone(cached.value()))
    }

    async fn register_or_reuse(&self, subject: &str, schema: &str) -> Result<u32, RegistryError> {
        let key = (subject.to_string(), schema.to_string());
        if let Some(id) = self.ids.get(&key) {
            return Ok(*id);
        }

        // Compile first so an invalid schema never reaches the registry.
        let codec = Arc::new(AvroCodec::new(schema)?);

        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, SCHEMA_REGISTRY_CONTENT_TYPE)
            .json(&RegisterRequest { schema })
            .send()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;

        debug!(subject, schema_id = body.id, "Registered schema");
        self.codecs.entry(body.id).or_insert(codec);
        self.ids.insert(key, body.id);

        Ok(body.id)
    }
}

/// Process-local registry for tests and single-node runs.
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    codecs: DashMap<u32, Arc<AvroCodec>>,
    ids: DashMap<(String, String), u32>,
    next_id: AtomicU32,
    registrations: AtomicUsize,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls that actually created a schema.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn resolve(&self, schema_id: u32) -> Result<Arc<AvroCodec>, RegistryError> {
        self.codecs
            .get(&schema_id)
            .map(|codec| Arc::clone(codec.value()))
            .ok_or(RegistryError::SchemaNotFound(schema_id))
    }

    async fn register_or_reuse(&self, subject: &str, schema: &str) -> Result<u32, RegistryError> {
        let codec = Arc::new(AvroCodec::new(schema)?);
        let id = *self
            .ids
            .entry((subject.to_string(), schema.to_string()))
            .or_insert_with(|| {
                self.registrations.fetch_add(1, Ordering::SeqCst);
                self.next_id.fetch_add(1, Ordering::SeqCst) + 1
            });
        self.codecs.entry(id).or_insert(codec);
        Ok(id)
    }
}
