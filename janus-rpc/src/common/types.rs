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

//! Wire message types and the structured error shared by client and server.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Ordered argument mapping carried by a [`Request`].
pub type Args = Map<String, Value>;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

/// Keeps an explicit `null` distinct from an absent member.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Generates a time-ordered request identifier (`req_<uuidv7>`).
#[must_use]
pub(crate) fn new_request_id() -> String {
    use mti::prelude::*;
    "req".create_type_id::<V7>().to_string()
}

/// Generates a time-ordered response identifier (`rsp_<uuidv7>`).
#[must_use]
pub(crate) fn new_response_id() -> String {
    use mti::prelude::*;
    "rsp".create_type_id::<V7>().to_string()
}

// ============================================================================
// Errors
// ============================================================================

/// The closed set of error kinds that can appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed JSON, missing or mistyped field, broken message invariant.
    ProtocolViolation,
    /// Datagram or argument payload exceeds its size ceiling.
    MessageTooLarge,
    /// Payload is not UTF-8 or carries null bytes.
    InvalidCharacterEncoding,
    /// A field failed a validation rule (empty, too long, missing argument).
    ValidationFailed,
    /// An argument or name carries a disallowed value.
    InvalidArgument,
    /// A path or name contains a `../` or `..\` sequence.
    PathTraversalAttempt,
    /// A socket path is too long, outside the allow-list, or uses bad characters.
    InvalidSocketPath,
    /// A concurrency, capacity, rate or timeout ceiling was breached.
    ResourceLimitExceeded,
    /// No handler is registered under the requested name.
    HandlerNotFound,
    /// Attempt to register or remove one of the built-in handler names.
    ReservedHandlerName,
    /// The server stopped waiting for a handler.
    HandlerTimeout,
    /// The client stopped waiting for a reply.
    CommandTimeout,
    /// A handler failed or panicked.
    InternalError,
    /// Socket send, receive, or bind failure.
    SocketError,
}

/// Error taxonomy used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed, missing or out-of-range fields.
    Validation,
    /// Path traversal, invalid path, resource limits, disallowed characters.
    Security,
    /// Malformed JSON, oversized payload, bad encoding.
    Protocol,
    /// Socket send/receive failure.
    Communication,
    /// Command-level or handler-level deadline.
    Timeout,
    /// Unknown command or failed handler.
    Dispatch,
}

impl ErrorCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::InvalidCharacterEncoding => "INVALID_CHARACTER_ENCODING",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::PathTraversalAttempt => "PATH_TRAVERSAL_ATTEMPT",
            Self::InvalidSocketPath => "INVALID_SOCKET_PATH",
            Self::ResourceLimitExceeded => "RESOURCE_LIMIT_EXCEEDED",
            Self::HandlerNotFound => "HANDLER_NOT_FOUND",
            Self::ReservedHandlerName => "RESERVED_HANDLER_NAME",
            Self::HandlerTimeout => "HANDLER_TIMEOUT",
            Self::CommandTimeout => "COMMAND_TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::SocketError => "SOCKET_ERROR",
        }
    }

    /// Maps the code onto the error taxonomy.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::ValidationFailed | Self::InvalidArgument => ErrorCategory::Validation,
            Self::PathTraversalAttempt
            | Self::InvalidSocketPath
            | Self::ResourceLimitExceeded
            | Self::ReservedHandlerName => ErrorCategory::Security,
            Self::ProtocolViolation | Self::MessageTooLarge | Self::InvalidCharacterEncoding => {
                ErrorCategory::Protocol
            }
            Self::SocketError => ErrorCategory::Communication,
            Self::HandlerTimeout | Self::CommandTimeout => ErrorCategory::Timeout,
            Self::HandlerNotFound | Self::InternalError => ErrorCategory::Dispatch,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried in failed responses and returned by every
/// fallible operation of this crate.
///
/// # Wire Format
///
/// ```json
/// {
///   "code": "INVALID_ARGUMENT",
///   "message": "Argument 'count' must be at most 10",
///   "field": "count",
///   "value": 42,
///   "constraints": { "max": 10 }
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StructuredError {
    /// Machine-readable error kind.
    pub code: ErrorCode,

    /// Human-readable description.
    pub message: String,

    /// Free-form supplementary data.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub details: Option<Value>,

    /// Name of the offending field, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// The offending value, if it is safe to echo back.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,

    /// The constraint that was violated.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub constraints: Option<Value>,
}

impl StructuredError {
    /// Creates an error with just a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            field: None,
            value: None,
            constraints: None,
        }
    }

    /// Attaches the name of the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Attaches the offending value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Attaches supplementary details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attaches the violated constraint.
    #[must_use]
    pub fn with_constraints(mut self, constraints: Value) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Shorthand for a [`ErrorCode::ProtocolViolation`].
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }

    /// Shorthand for a [`ErrorCode::MessageTooLarge`] carrying both sizes.
    #[must_use]
    pub fn message_too_large(what: &str, size: usize, limit: usize) -> Self {
        Self::new(
            ErrorCode::MessageTooLarge,
            format!("{what} size {size} exceeds maximum {limit}"),
        )
        .with_value(size)
        .with_constraints(serde_json::json!({ "max": limit }))
    }

    /// Shorthand for a [`ErrorCode::ResourceLimitExceeded`].
    #[must_use]
    pub fn resource_limit(resource: &str, limit: usize) -> Self {
        Self::new(
            ErrorCode::ResourceLimitExceeded,
            format!("Limit of {limit} {resource} reached"),
        )
        .with_field(resource)
        .with_constraints(serde_json::json!({ "max": limit }))
    }

    /// Shorthand for a [`ErrorCode::InternalError`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} ({}): {}", self.code, field, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for StructuredError {}

impl From<std::io::Error> for StructuredError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::SocketError, err.to_string())
            .with_details(format!("{:?}", err.kind()))
    }
}

impl From<serde_json::Error> for StructuredError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol_violation(err.to_string())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A single self-contained call.
///
/// # Wire Format
///
/// ```json
/// {
///   "id": "req_01h9xz7n2e5p6q8r3t1u2v3w4x",
///   "channelId": "default",
///   "request": "ping",
///   "reply_to": "/tmp/janus_client_4242_1700000000_9f1c.sock",
///   "args": { "message": "hello" },
///   "timeout": 5.0,
///   "timestamp": "2024-05-01T12:00:00.000Z"
/// }
/// ```
///
/// `reply_to` is absent for fire-and-forget calls; `timeout` defaults to 30.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Request {
    /// Caller-generated identifier, echoed back as `request_id`.
    pub id: String,

    /// Routing namespace.
    #[serde(rename = "channelId")]
    pub channel_id: String,

    /// Operation name.
    pub request: String,

    /// Socket path where the response must be delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Named arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Args>,

    /// Command timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Request {
    /// Creates a fire-and-forget request with a generated identifier.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, request: impl Into<String>, args: Option<Args>) -> Self {
        Self {
            id: new_request_id(),
            channel_id: channel_id.into(),
            request: request.into(),
            reply_to: None,
            args,
            timeout: DEFAULT_TIMEOUT_SECS,
            timestamp: Utc::now(),
        }
    }

    /// Sets the reply-to socket path.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs_f64();
        self
    }

    /// Returns `true` if a response should be sent back.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Returns a named argument.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.as_ref().and_then(|args| args.get(name))
    }

    /// Returns a named string argument.
    #[must_use]
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arg(name).and_then(Value::as_str)
    }
}

/// The single correlated reply to a [`Request`].
///
/// # Wire Format
///
/// Success:
/// ```json
/// {
///   "request_id": "req_01h9xz7n2e5p6q8r3t1u2v3w4x",
///   "id": "rsp_01h9xz7n3f0a1b2c3d4e5f6g7h",
///   "success": true,
///   "result": { "pong": true },
///   "timestamp": "2024-05-01T12:00:00.010Z"
/// }
/// ```
///
/// Failure:
/// ```json
/// {
///   "request_id": "req_01h9xz7n2e5p6q8r3t1u2v3w4x",
///   "id": "rsp_01h9xz7n3f0a1b2c3d4e5f6g7h",
///   "success": false,
///   "error": { "code": "HANDLER_NOT_FOUND", "message": "No handler for 'frobnicate'" },
///   "timestamp": "2024-05-01T12:00:00.010Z"
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Response {
    /// The originating request's `id`.
    pub request_id: String,

    /// Identifier of this response instance.
    pub id: String,

    /// Whether the call succeeded.
    pub success: bool,

    /// Handler result, present iff `success`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,

    /// Failure description, present iff not `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,

    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Response {
    /// Creates a successful response.
    #[must_use]
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            id: new_response_id(),
            success: true,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub fn failure(request_id: impl Into<String>, error: StructuredError) -> Self {
        Self {
            request_id: request_id.into(),
            id: new_response_id(),
            success: false,
            result: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    /// Converts the response into the handler's outcome.
    ///
    /// # Errors
    ///
    /// Returns the carried [`StructuredError`] when `success` is `false`.
    pub fn into_result(self) -> Result<Value, StructuredError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| {
                StructuredError::protocol_violation("Failed response carried no error")
            }))
        }
    }
}

/// Either wire shape, as produced by [`MessageCodec::decode`](super::MessageCodec::decode).
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A call.
    Request(Request),
    /// A reply.
    Response(Response),
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

/// Opaque handle identifying one outstanding call.
///
/// Backed by the wire identifier, but callers never need to build or parse it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_code_wire_names() {
        let encoded = serde_json::to_string(&ErrorCode::PathTraversalAttempt).unwrap();
        assert_eq!(encoded, "\"PATH_TRAVERSAL_ATTEMPT\"");
        assert_eq!(ErrorCode::HandlerTimeout.to_string(), "HANDLER_TIMEOUT");
        let decoded: ErrorCode = serde_json::from_str("\"RESOURCE_LIMIT_EXCEEDED\"").unwrap();
        assert_eq!(decoded, ErrorCode::ResourceLimitExceeded);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::CommandTimeout.category(), ErrorCategory::Timeout);
        assert_eq!(ErrorCode::PathTraversalAttempt.category(), ErrorCategory::Security);
        assert_eq!(ErrorCode::MessageTooLarge.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::HandlerNotFound.category(), ErrorCategory::Dispatch);
        assert_eq!(ErrorCode::SocketError.category(), ErrorCategory::Communication);
    }

    #[test]
    fn test_error_omits_empty_members() {
        let err = StructuredError::new(ErrorCode::InternalError, "boom");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value, json!({ "code": "INTERNAL_ERROR", "message": "boom" }));
    }

    #[test]
    fn test_error_display_includes_field() {
        let err = StructuredError::new(ErrorCode::InvalidArgument, "bad").with_field("count");
        assert_eq!(err.to_string(), "INVALID_ARGUMENT (count): bad");
    }

    #[test]
    fn test_request_defaults() {
        let request = Request::new("default", "ping", None);
        assert!(request.id.starts_with("req_"));
        assert!((request.timeout - DEFAULT_TIMEOUT_SECS).abs() < f64::EPSILON);
        assert!(!request.expects_reply());

        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("reply_to").is_none());
        assert!(value.get("args").is_none());
        assert_eq!(value["channelId"], "default");
    }

    #[test]
    fn test_success_response_has_no_error_member() {
        let response = Response::success("req_1", json!({ "pong": true }));
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["result"], json!({ "pong": true }));
        assert!(response.id.starts_with("rsp_"));
        assert_ne!(response.id, response.request_id);
    }

    #[test]
    fn test_null_result_survives_serialization() {
        let response = Response::success("req_1", Value::Null);
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.result, Some(Value::Null));
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_into_result() {
        let ok = Response::success("a", json!(1));
        assert_eq!(ok.into_result().unwrap(), json!(1));

        let err = Response::failure("a", StructuredError::internal("nope"));
        assert_eq!(err.into_result().unwrap_err().code, ErrorCode::InternalError);
    }
}
