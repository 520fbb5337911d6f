//! Document codec: JSON (default) and a binary packed form
//! (`application/x-msgpack`), with streaming bounded-length decode and
//! doctype enforcement.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BrokerError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_MSGPACK: &str = "application/x-msgpack";

/// Which document encoding a request used / a response should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Msgpack,
}

impl Encoding {
    /// Resolve the encoding from a `Content-Type` header value. Unknown or
    /// absent values default to JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type.map(|value| value.split(';').next().unwrap_or(value).trim()) {
            Some(CONTENT_TYPE_MSGPACK) => Self::Msgpack,
            _ => Self::Json,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => CONTENT_TYPE_JSON,
            Self::Msgpack => CONTENT_TYPE_MSGPACK,
        }
    }
}

/// Whether a decoded body is expected to be a single document or an array
/// of documents. Endpoints enforce this so a lone object posted where an
/// array is expected is rejected rather than silently coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Doctype {
    Object,
    Array,
}

fn check_doctype_json(value: &serde_json::Value, doctype: Doctype) -> Result<(), BrokerError> {
    match (doctype, value) {
        (Doctype::Array, serde_json::Value::Array(_)) => Ok(()),
        (Doctype::Object, serde_json::Value::Object(_)) => Ok(()),
        (Doctype::Array, _) => Err(BrokerError::invalid_argument("expected a JSON array")),
        (Doctype::Object, _) => Err(BrokerError::invalid_argument("expected a JSON object")),
    }
}

/// Decode a body of at most `max_bytes`, honoring the doctype and encoding.
/// Bodies larger than `max_bytes` are rejected before parsing is attempted.
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    encoding: Encoding,
    doctype: Doctype,
    max_bytes: usize,
) -> Result<T, BrokerError> {
    if bytes.len() > max_bytes {
        return Err(BrokerError::PayloadTooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    match encoding {
        Encoding::Json => {
            let value: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|err| BrokerError::invalid_argument(format!("malformed JSON body: {err}")))?;
            check_doctype_json(&value, doctype)?;
            crate::validation::validate_json_numbers(&value)?;
            serde_json::from_value(value).map_err(|err| BrokerError::invalid_argument(format!("body did not match the expected shape: {err}")))
        }
        Encoding::Msgpack => {
            // rmp_serde decodes directly into T; doctype is enforced by
            // attempting to decode as the matching serde_json::Value shape
            // first is unnecessary here since msgpack's wire tag already
            // distinguishes maps from arrays, and a type mismatch surfaces
            // as a decode error.
            rmp_serde::from_slice(bytes).map_err(|err| BrokerError::invalid_argument(format!("malformed msgpack body: {err}")))
        }
    }
}

/// Encode a value in the response's negotiated encoding.
pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<Vec<u8>, BrokerError> {
    match encoding {
        Encoding::Json => serde_json::to_vec(value).map_err(|err| BrokerError::invariant(format!("failed to encode JSON response: {err}"))),
        Encoding::Msgpack => rmp_serde::to_vec_named(value).map_err(|err| BrokerError::invariant(format!("failed to encode msgpack response: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        body: serde_json::Value,
        ttl: i64,
    }

    #[test]
    fn json_round_trip_with_non_ascii() {
        let doc = Doc {
            body: serde_json::json!({ "key": "café \u{1f600}" }),
            ttl: 200,
        };
        let bytes = encode(&doc, Encoding::Json).unwrap();
        let decoded: Doc = decode(&bytes, Encoding::Json, Doctype::Object, 1 << 20).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn msgpack_round_trip_with_binary_bytes() {
        let doc = Doc {
            body: serde_json::json!({ "raw": [0u8, 255, 128, 10, 13] }),
            ttl: 60,
        };
        let bytes = encode(&doc, Encoding::Msgpack).unwrap();
        let decoded: Doc = decode(&bytes, Encoding::Msgpack, Doctype::Object, 1 << 20).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn rejects_oversized_body_before_parsing() {
        let bytes = vec![b'a'; 10];
        let result: Result<Doc, _> = decode(&bytes, Encoding::Json, Doctype::Object, 4);
        assert!(matches!(result, Err(BrokerError::PayloadTooLarge { .. })));
    }

    #[test]
    fn array_doctype_rejects_lone_object() {
        let bytes = serde_json::to_vec(&serde_json::json!({"body": {}, "ttl": 60})).unwrap();
        let result: Result<Vec<Doc>, _> = decode(&bytes, Encoding::Json, Doctype::Array, 1 << 20);
        assert!(result.is_err());
    }

    #[test]
    fn object_doctype_rejects_array() {
        let bytes = serde_json::to_vec(&serde_json::json!([{"body": {}, "ttl": 60}])).unwrap();
        let result: Result<Doc, _> = decode(&bytes, Encoding::Json, Doctype::Object, 1 << 20);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_integer_overflowing_i64_anywhere_in_the_document() {
        let bytes = br#"{"body": {"overflow": 9223372036854775808}, "ttl": 60}"#;
        let result: Result<Doc, _> = decode(bytes, Encoding::Json, Doctype::Object, 1 << 20);
        assert!(matches!(result, Err(BrokerError::InvalidArgument { .. })));
    }

    #[test]
    fn accepts_integer_at_the_i64_boundary() {
        let bytes = br#"{"body": {"n": 9223372036854775807}, "ttl": 60}"#;
        let result: Result<Doc, _> = decode(bytes, Encoding::Json, Doctype::Object, 1 << 20);
        assert!(result.is_ok());
    }

    #[test]
    fn content_type_defaults_to_json() {
        assert_eq!(Encoding::from_content_type(None), Encoding::Json);
        assert_eq!(Encoding::from_content_type(Some("text/plain")), Encoding::Json);
        assert_eq!(
            Encoding::from_content_type(Some("application/x-msgpack")),
            Encoding::Msgpack
        );
        assert_eq!(
            Encoding::from_content_type(Some("application/x-msgpack; charset=utf-8")),
            Encoding::Msgpack
        );
    }
}
