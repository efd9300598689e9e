/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Datagram encoding and structural decoding.
//!
//! One JSON document per datagram, no framing. Decoding runs the cheap checks
//! first (size, then encoding) and only then parses:
//!
//! 1. total length against `max_message_size` (`MESSAGE_TOO_LARGE`)
//! 2. UTF-8 validity and embedded null bytes (`INVALID_CHARACTER_ENCODING`)
//! 3. JSON syntax, presence and type of every required field, and the
//!    `success`/`result`/`error` invariant (`PROTOCOL_VIOLATION`)

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::trace;

use super::config::{JanusConfig, SecurityPolicy};
use super::security::SecurityValidator;
use super::types::{ErrorCode, Message, Request, Response, StructuredError};

const LEGACY_REQUEST: &str = "command";
const LEGACY_REQUEST_ID: &str = "commandId";

#[derive(Debug, Clone, Copy)]
enum Kind {
    String,
    Bool,
    Number,
    Object,
}

impl Kind {
    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Bool => "a boolean",
            Self::Number => "a number",
            Self::Object => "an object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::String, Value::String(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::Number, Value::Number(_))
                | (Self::Object, Value::Object(_))
        )
    }
}

/// Converts between messages and datagram payloads.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    validator: SecurityValidator,
    legacy_field_names: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::from_config(&JanusConfig::default())
    }
}

impl MessageCodec {
    /// Creates a codec accepting datagrams up to `max_message_size` bytes.
    #[must_use]
    pub fn new(max_message_size: usize, legacy_field_names: bool) -> Self {
        let policy = SecurityPolicy {
            max_message_size,
            ..SecurityPolicy::default()
        };
        Self::with_validator(SecurityValidator::new(Arc::new(policy)), legacy_field_names)
    }

    /// Creates a codec whose size ceiling is `validator`'s `max_message_size`.
    #[must_use]
    pub const fn with_validator(validator: SecurityValidator, legacy_field_names: bool) -> Self {
        Self {
            validator,
            legacy_field_names,
        }
    }

    /// Creates a codec from the `[limits]` and `[protocol]` sections.
    #[must_use]
    pub fn from_config(config: &JanusConfig) -> Self {
        Self::with_validator(
            SecurityValidator::new(config.shared_policy()),
            config.protocol.legacy_field_names,
        )
    }

    /// Largest payload this codec produces or accepts.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.validator.policy().max_message_size
    }

    /// Serializes either message shape.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MessageTooLarge`] if the payload exceeds the datagram ceiling.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, StructuredError> {
        match message {
            Message::Request(request) => self.encode_request(request),
            Message::Response(response) => self.encode_response(response),
        }
    }

    /// Serializes a request.
    ///
    /// # Errors
    ///
    /// See [`encode`](Self::encode).
    pub fn encode_request(&self, request: &Request) -> Result<Vec<u8>, StructuredError> {
        self.finish(serde_json::to_value(request)?, "request", LEGACY_REQUEST)
    }

    /// Serializes a response.
    ///
    /// # Errors
    ///
    /// See [`encode`](Self::encode).
    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>, StructuredError> {
        self.finish(serde_json::to_value(response)?, "request_id", LEGACY_REQUEST_ID)
    }

    fn finish(&self, value: Value, key: &str, legacy: &str) -> Result<Vec<u8>, StructuredError> {
        let value = match value {
            Value::Object(map) if self.legacy_field_names => Value::Object(
                map.into_iter()
                    .map(|(k, v)| if k == key { (legacy.to_string(), v) } else { (k, v) })
                    .collect(),
            ),
            other => other,
        };
        let bytes = serde_json::to_vec(&value)?;
        self.validator.validate_message_size(bytes.len())?;
        Ok(bytes)
    }

    /// Decodes a datagram into a [`Message`].
    ///
    /// # Errors
    ///
    /// See the module documentation for the check order and codes.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, StructuredError> {
        let mut map = self.parse(bytes)?;
        if map.contains_key("request_id") {
            Self::response_from(map).map(Message::Response)
        } else if map.contains_key("request") || map.contains_key("channelId") {
            Self::request_from(&mut map).map(Message::Request)
        } else {
            Err(StructuredError::protocol_violation(
                "Message is neither a request nor a response",
            ))
        }
    }

    /// Decodes a datagram that must be a request.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ProtocolViolation`] if it is a response, otherwise as
    /// [`decode`](Self::decode).
    pub fn decode_request(&self, bytes: &[u8]) -> Result<Request, StructuredError> {
        match self.decode(bytes)? {
            Message::Request(request) => Ok(request),
            Message::Response(_) => Err(StructuredError::protocol_violation(
                "Expected a request, received a response",
            )),
        }
    }

    /// Decodes a datagram that must be a response.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ProtocolViolation`] if it is a request, otherwise as
    /// [`decode`](Self::decode).
    pub fn decode_response(&self, bytes: &[u8]) -> Result<Response, StructuredError> {
        match self.decode(bytes)? {
            Message::Response(response) => Ok(response),
            Message::Request(_) => Err(StructuredError::protocol_violation(
                "Expected a response, received a request",
            )),
        }
    }

    /// Best-effort extraction of `id` and `reply_to` from a payload that
    /// failed to decode, so the rejection can still be delivered.
    #[must_use]
    pub fn salvage_reply_route(&self, bytes: &[u8]) -> Option<(String, String)> {
        self.validator.validate_message_size(bytes.len()).ok()?;
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(bytes) else {
            return None;
        };
        let id = map.get("id")?.as_str()?.to_string();
        let reply_to = map.get("reply_to")?.as_str()?.to_string();
        Some((id, reply_to))
    }

    fn parse(&self, bytes: &[u8]) -> Result<Map<String, Value>, StructuredError> {
        self.validator.validate_message_size(bytes.len())?;

        let text = std::str::from_utf8(bytes).map_err(|e| {
            StructuredError::new(
                ErrorCode::InvalidCharacterEncoding,
                format!("Message is not valid UTF-8: {e}"),
            )
        })?;
        if text.contains('\0') {
            return Err(StructuredError::new(
                ErrorCode::InvalidCharacterEncoding,
                "Message contains a null byte",
            ));
        }

        let Value::Object(mut map) = serde_json::from_str::<Value>(text)? else {
            return Err(StructuredError::protocol_violation(
                "Message must be a JSON object",
            ));
        };

        if self.legacy_field_names {
            for (legacy, canonical) in [(LEGACY_REQUEST, "request"), (LEGACY_REQUEST_ID, "request_id")] {
                if !map.contains_key(canonical) {
                    if let Some(value) = map.remove(legacy) {
                        trace!("Accepted legacy field '{}'", legacy);
                        map.insert(canonical.to_string(), value);
                    }
                }
            }
        }
        Ok(map)
    }

    fn require(map: &Map<String, Value>, field: &str, kind: Kind) -> Result<(), StructuredError> {
        match map.get(field) {
            None | Some(Value::Null) => Err(StructuredError::protocol_violation(format!(
                "Missing required field '{field}'"
            ))
            .with_field(field)),
            Some(value) => Self::expect(field, value, kind),
        }
    }

    fn optional(map: &mut Map<String, Value>, field: &str, kind: Kind) -> Result<(), StructuredError> {
        match map.get(field) {
            None => Ok(()),
            Some(Value::Null) => {
                map.remove(field);
                Ok(())
            }
            Some(value) => Self::expect(field, value, kind),
        }
    }

    fn expect(field: &str, value: &Value, kind: Kind) -> Result<(), StructuredError> {
        if kind.matches(value) {
            Ok(())
        } else {
            Err(StructuredError::protocol_violation(format!(
                "Field '{field}' must be {}",
                kind.describe()
            ))
            .with_field(field))
        }
    }

    fn request_from(map: &mut Map<String, Value>) -> Result<Request, StructuredError> {
        Self::require(map, "id", Kind::String)?;
        Self::require(map, "channelId", Kind::String)?;
        Self::require(map, "request", Kind::String)?;
        Self::optional(map, "reply_to", Kind::String)?;
        Self::optional(map, "args", Kind::Object)?;
        Self::optional(map, "timeout", Kind::Number)?;
        Self::require(map, "timestamp", Kind::String)?;

        serde_json::from_value(Value::Object(std::mem::take(map))).map_err(|e| {
            StructuredError::protocol_violation(format!("Malformed request: {e}"))
        })
    }

    fn response_from(mut map: Map<String, Value>) -> Result<Response, StructuredError> {
        Self::require(&map, "request_id", Kind::String)?;
        Self::require(&map, "id", Kind::String)?;
        Self::require(&map, "success", Kind::Bool)?;
        Self::require(&map, "timestamp", Kind::String)?;

        let success = map.get("success").and_then(Value::as_bool).unwrap_or_default();
        if success {
            Self::optional(&mut map, "error", Kind::Object)?;
            if map.contains_key("error") {
                return Err(StructuredError::protocol_violation(
                    "Successful response must not carry an error",
                )
                .with_field("error"));
            }
            if !map.contains_key("result") {
                return Err(StructuredError::protocol_violation(
                    "Successful response is missing 'result'",
                )
                .with_field("result"));
            }
        } else {
            Self::require(&map, "error", Kind::Object)?;
            if matches!(map.get("result"), Some(Value::Null)) {
                map.remove("result");
            }
            if map.contains_key("result") {
                return Err(StructuredError::protocol_violation(
                    "Failed response must not carry a result",
                )
                .with_field("result"));
            }
        }

        serde_json::from_value(Value::Object(map)).map_err(|e| {
            StructuredError::protocol_violation(format!("Malformed response: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sample_request() -> Request {
        let mut args = Map::new();
        args.insert("message".to_string(), json!("hello"));
        args.insert("nested".to_string(), json!({ "a": [1, 2.5, null, true] }));
        Request::new("default", "echo", Some(args))
            .with_reply_to("/tmp/janus_client_1.sock")
            .with_timeout(Duration::from_millis(2_500))
    }

    #[test]
    fn test_request_round_trip() {
        let codec = MessageCodec::default();
        let request = sample_request();
        let bytes = codec.encode_request(&request).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), Message::Request(request));
    }

    #[test]
    fn test_response_round_trip() {
        let codec = MessageCodec::default();
        let ok = Response::success("req_1", json!({ "pong": true }));
        let failed = Response::failure(
            "req_2",
            StructuredError::new(ErrorCode::HandlerNotFound, "nope").with_field("request"),
        );
        for response in [ok, failed] {
            let bytes = codec.encode(&Message::Response(response.clone())).unwrap();
            assert_eq!(codec.decode_response(&bytes).unwrap(), response);
        }
    }

    #[test]
    fn test_floats_survive_round_trip() {
        let codec = MessageCodec::default();
        for timeout in [
            0.1075,
            0.107_499_500_000_000_01,
            0.108_999_400_000_000_01,
            0.111_999_200_000_000_01,
            299.999_999_9,
        ] {
            let mut request = Request::new("default", "ping", None);
            request.timeout = timeout;
            let bytes = codec.encode_request(&request).unwrap();
            let decoded = codec.decode_request(&bytes).unwrap();
            assert_eq!(decoded.timeout.to_bits(), timeout.to_bits(), "timeout {timeout}");
        }

        let floats = [
            1.071_566_039_146_582_6e-75,
            -1.819_967_304_027_17e-179,
            -1.603_964_615_428_183e143,
            -9.643_915_712_060_552e-234,
        ];
        let mut args = Map::new();
        for (i, value) in floats.iter().enumerate() {
            args.insert(format!("f{i}"), json!(value));
        }
        let request = Request::new("default", "echo", Some(args.clone()));
        let bytes = codec.encode_request(&request).unwrap();
        assert_eq!(codec.decode_request(&bytes).unwrap(), request);

        let response = Response::success("req_f", Value::Object(args));
        let bytes = codec.encode_response(&response).unwrap();
        assert_eq!(codec.decode_response(&bytes).unwrap(), response);
    }

    #[test]
    fn test_size_checked_before_parsing() {
        let codec = MessageCodec::new(16, false);
        let err = codec.decode(&[b'{'; 17]).unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageTooLarge);
    }

    #[test]
    fn test_encoding_rejections() {
        let codec = MessageCodec::default();
        assert_eq!(
            codec.decode(&[0x7b, 0xff, 0x7d]).unwrap_err().code,
            ErrorCode::InvalidCharacterEncoding
        );
        assert_eq!(
            codec.decode(b"{\"id\":\"a\0\"}").unwrap_err().code,
            ErrorCode::InvalidCharacterEncoding
        );
    }

    #[test]
    fn test_structural_rejections() {
        let codec = MessageCodec::default();
        assert_eq!(codec.decode(b"{nope").unwrap_err().code, ErrorCode::ProtocolViolation);
        assert_eq!(codec.decode(b"[1,2]").unwrap_err().code, ErrorCode::ProtocolViolation);
        assert_eq!(codec.decode(b"{}").unwrap_err().code, ErrorCode::ProtocolViolation);

        let missing_id = br#"{"channelId":"default","request":"ping","timestamp":"2024-05-01T12:00:00Z"}"#;
        let err = codec.decode(missing_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolViolation);
        assert_eq!(err.field.as_deref(), Some("id"));

        let bad_timeout = br#"{"id":"a","channelId":"d","request":"p","timeout":"soon","timestamp":"2024-05-01T12:00:00Z"}"#;
        assert_eq!(
            codec.decode(bad_timeout).unwrap_err().field.as_deref(),
            Some("timeout")
        );
    }

    #[test]
    fn test_response_invariant_enforced() {
        let codec = MessageCodec::default();
        let both = br#"{"request_id":"a","id":"b","success":true,"result":1,"error":{"code":"INTERNAL_ERROR","message":"x"},"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert_eq!(codec.decode(both).unwrap_err().field.as_deref(), Some("error"));

        let no_error = br#"{"request_id":"a","id":"b","success":false,"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert_eq!(codec.decode(no_error).unwrap_err().field.as_deref(), Some("error"));

        let null_error = br#"{"request_id":"a","id":"b","success":true,"result":null,"error":null,"timestamp":"2024-05-01T12:00:00Z"}"#;
        let response = codec.decode_response(null_error).unwrap();
        assert_eq!(response.result, Some(Value::Null));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_optional_request_fields_default() {
        let codec = MessageCodec::default();
        let bytes = br#"{"id":"a","channelId":"default","request":"ping","reply_to":null,"timestamp":"2024-05-01T12:00:00Z"}"#;
        let request = codec.decode_request(bytes).unwrap();
        assert!(request.reply_to.is_none());
        assert!(request.args.is_none());
        assert!((request.timeout - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_legacy_names_require_flag() {
        let legacy = br#"{"commandId":"a","id":"b","success":true,"result":{},"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert_eq!(
            MessageCodec::default().decode(legacy).unwrap_err().code,
            ErrorCode::ProtocolViolation
        );

        let codec = MessageCodec::new(1024, true);
        let response = codec.decode_response(legacy).unwrap();
        assert_eq!(response.request_id, "a");

        let bytes = codec.encode_request(&Request::new("default", "ping", None)).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["command"], "ping");
        assert!(value.get("request").is_none());
        assert!(matches!(codec.decode(&bytes).unwrap(), Message::Request(r) if r.request == "ping"));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let codec = MessageCodec::new(64, false);
        let mut args = Map::new();
        args.insert("blob".to_string(), json!("x".repeat(100)));
        let err = codec
            .encode_request(&Request::new("default", "echo", Some(args)))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageTooLarge);
    }

    #[test]
    fn test_salvage_reply_route() {
        let codec = MessageCodec::default();
        let bytes = br#"{"id":"a","reply_to":"/tmp/r.sock","channelId":7}"#;
        assert_eq!(
            codec.salvage_reply_route(bytes),
            Some(("a".to_string(), "/tmp/r.sock".to_string()))
        );
        assert!(codec.salvage_reply_route(b"garbage").is_none());
    }
}
