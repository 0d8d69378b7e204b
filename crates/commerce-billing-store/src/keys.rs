//! Key and value encoding shared by the storage backends.
//!
//! Keys are UTF-8 strings stored as raw bytes, so byte order equals string order and
//! ULID-based ids iterate oldest first. Values are CBOR.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};

/// Encode a record key.
#[must_use]
pub fn encode_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// Decode a record key.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the bytes are not UTF-8.
pub fn decode_key(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Serialize a value using CBOR.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the value cannot be encoded.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the bytes do not decode to `T`.
pub fn decode_value<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
}
