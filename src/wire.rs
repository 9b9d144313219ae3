//! Wire codec
//!
//! A request is a single UTF-8 JSON object `{"method": <string>, "params": <any>}`
//! with no framing or length prefix; a response is a single arbitrary JSON
//! value. One request and one response travel per stream read.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A decoded request. `params` defaults to `Value::Null` when the field is
/// absent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Request {
    pub(crate) method: String,
    #[serde(default)]
    pub(crate) params: Value,
}

/// Encode a request object. Consumes `params`.
pub(crate) fn encode_request(method: &str, params: Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&Request {
        method: method.to_owned(),
        params,
    })
}

/// Decode a request from raw bytes. Anything that is not a JSON object with
/// a string `method` field is a parse failure.
pub(crate) fn decode_request(bytes: &[u8]) -> Option<Request> {
    serde_json::from_slice(bytes).ok()
}

/// Decode a response value from raw bytes.
pub(crate) fn decode_response(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice(bytes).ok()
}
