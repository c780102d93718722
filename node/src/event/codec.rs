//! Schema-validated JSON encoding. Nothing that fails validation is sent,
//! stored or applied.

use super::schema::{DOCUMENT_SCHEMA, EVENT_SCHEMA};
use super::DomainEvent;
use crate::cluster::GameDocument;
use crate::error::CodecError;
use jsonschema::JSONSchema;
use serde_json::Value;

fn check(schema: &JSONSchema, value: &Value) -> Result<(), CodecError> {
    if let Err(errors) = schema.validate(value) {
        let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(CodecError::Schema(reasons.join("; ")));
    }
    Ok(())
}

pub fn validate_event(value: &Value) -> Result<(), CodecError> {
    check(&EVENT_SCHEMA, value)
}

pub fn validate_document(value: &Value) -> Result<(), CodecError> {
    check(&DOCUMENT_SCHEMA, value)
}

pub fn encode(event: &DomainEvent) -> Result<String, CodecError> {
    let value = serde_json::to_value(event)?;
    validate_event(&value)?;
    Ok(value.to_string())
}

pub fn decode(text: &str) -> Result<DomainEvent, CodecError> {
    decode_value(serde_json::from_str(text)?)
}

pub fn decode_bytes(bytes: &[u8]) -> Result<DomainEvent, CodecError> {
    decode_value(serde_json::from_slice(bytes)?)
}

fn decode_value(value: Value) -> Result<DomainEvent, CodecError> {
    validate_event(&value)?;
    Ok(serde_json::from_value(value)?)
}

pub fn encode_document(document: &GameDocument) -> Result<String, CodecError> {
    let value = serde_json::to_value(document)?;
    validate_document(&value)?;
    Ok(value.to_string())
}

pub fn decode_document(text: &str) -> Result<GameDocument, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    validate_document(&value)?;
    Ok(serde_json::from_value(value)?)
}
