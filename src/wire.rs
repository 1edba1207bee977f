//! Wire format: JSON payloads, the end-of-stream sentinel, queue naming.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::WireError;

/// Reserved marker ending a response stream.
///
/// Raw bytes, not JSON — distinct from the JSON string `"END"`, so it can
/// never collide with a serialized payload.
pub const END_OF_STREAM: &[u8] = b"END";

/// Whether a reply body is the end-of-stream sentinel.
pub fn is_end_of_stream(body: &[u8]) -> bool {
    body == END_OF_STREAM
}

/// Serialize a payload to its UTF-8 JSON wire form.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(payload).map_err(WireError::Encode)
}

/// Deserialize a task or response body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(body).map_err(WireError::Payload)
}

/// Deserialize the metadata value that follows the sentinel.
pub fn decode_metadata<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(body).map_err(WireError::Metadata)
}

/// Durable task queue name for a registered service.
///
/// The registration layer derives queue names deterministically from the
/// namespace and service identifiers.
pub fn task_queue_name(namespace: &str, service: &str) -> String {
    format!("{namespace}.{service}")
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn sentinel_is_not_valid_json() {
        assert!(decode::<Value>(END_OF_STREAM).is_err());
    }

    #[test]
    fn sentinel_differs_from_json_string_end() {
        let encoded = encode("END").unwrap();
        assert!(!is_end_of_stream(&encoded));
        assert!(is_end_of_stream(b"END"));
    }

    #[test]
    fn payload_round_trip() {
        let payload = json!({"op": "run", "args": [1, 2, 3]});
        let body = encode(&payload).unwrap();
        let back: Value = decode(&body).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn queue_name_is_namespace_dot_service() {
        assert_eq!(task_queue_name("acme", "geocode"), "acme.geocode");
    }
}
