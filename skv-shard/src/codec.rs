//! JSON value codec shared by the client facade and the pipeline.

use serde::de::DeserializeOwned;
use serde::Serialize;
use skv_common::{ShardError, ShardResult};

/// Encodes a value as JSON bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> ShardResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| ShardError::Serialization(err.to_string()))
}

/// Decodes JSON bytes into a value.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> ShardResult<T> {
    serde_json::from_slice(data).map_err(|err| ShardError::Serialization(err.to_string()))
}

/// Decodes raw bytes stored by the string variants.
pub fn decode_text(data: Vec<u8>) -> ShardResult<String> {
    String::from_utf8(data).map_err(|err| ShardError::Serialization(err.to_string()))
}
