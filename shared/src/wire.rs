//! Schema-registry wire format.
//!
//! Every message on the bus is framed as
//! `[0x00][schema id: u32 big-endian][avro binary payload]`. The schema id
//! lets a consumer fetch the writer schema from the registry instead of
//! carrying the full schema in every message.

use apache_avro::types::Value;
use apache_avro::Schema;
use thiserror::Error;

/// Format marker for Confluent-style Avro framing.
pub const MAGIC_BYTE: u8 = 0x00;

/// Marker byte plus the four schema id bytes.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid avro schema: {0}")]
    InvalidSchema(String),

    #[error("payload does not match schema: {0}")]
    Encoding(String),

    #[error("failed to decode avro payload: {0}")]
    Decoding(String),
}

/// Wraps an already binary-encoded payload into the wire envelope.
pub fn encode(schema_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.push(MAGIC_BYTE);
    message.extend_from_slice(&schema_id.to_be_bytes());
    message.extend_from_slice(payload);
    message
}

/// Splits an envelope into its schema id and binary payload.
pub fn decode(message: &[u8]) -> Result<(u32, &[u8]), WireError> {
    if message.len() < HEADER_LEN {
        return Err(WireError::MalformedEnvelope(format!(
            "expected at least {HEADER_LEN} bytes, got {}",
            message.len()
        )));
    }

    if message[0] != MAGIC_BYTE {
        return Err(WireError::MalformedEnvelope(format!(
            "unknown format marker {:#04x}",
            message[0]
        )));
    }

    let schema_id = u32::from_be_bytes([message[1], message[2], message[3], message[4]]);
    Ok((schema_id, &message[HEADER_LEN..]))
}

/// A compiled Avro schema able to move a payload between its textual (JSON),
/// native ([`Value`]) and binary forms.
#[derive(Debug, Clone)]
pub struct AvroCodec {
    schema: Schema,
    schema_text: String,
}

impl AvroCodec {
    pub fn new(schema_text: &str) -> Result<Self, WireError> {
        let schema =
            Schema::parse_str(schema_text).map_err(|e| WireError::InvalidSchema(e.to_string()))?;

        Ok(Self {
            schema,
            schema_text: schema_text.to_string(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_text(&self) -> &str {
        &self.schema_text
    }

    /// Textual to native, resolved against the schema.
    pub fn native_from_json(&self, json: serde_json::Value) -> Result<Value, WireError> {
        Value::from(json)
            .resolve(&self.schema)
            .map_err(|e| WireError::Encoding(e.to_string()))
    }

    pub fn binary_from_native(&self, native: Value) -> Result<Vec<u8>, WireError> {
        apache_avro::to_avro_datum(&self.schema, native)
            .map_err(|e| WireError::Encoding(e.to_string()))
    }

    pub fn binary_from_json(&self, json: serde_json::Value) -> Result<Vec<u8>, WireError> {
        let native = self.native_from_json(json)?;
        self.binary_from_native(native)
    }

    pub fn native_from_binary(&self, mut binary: &[u8]) -> Result<Value, WireError> {
        apache_avro::from_avro_datum(&self.schema, &mut binary, None)
            .map_err(|e| WireError::Decoding(e.to_string()))
    }

    pub fn json_from_native(&self, native: Value) -> Result<serde_json::Value, WireError> {
        serde_json::Value::try_from(native).map_err(|e| WireError::Decoding(e.to_string()))
    }

    /// Binary to textual; the form handed to message handlers.
    pub fn json_from_binary(&self, binary: &[u8]) -> Result<serde_json::Value, WireError> {
        let native = self.native_from_binary(binary)?;
        self.json_from_native(native)
    }
}
