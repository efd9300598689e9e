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

//! Validation rules applied to socket paths, names and payloads.
//!
//! Every rule is an independent method returning the first failure as a
//! [`StructuredError`] with a specific code. [`SecurityValidator::validate_request`]
//! composes them and runs before any dispatch or network I/O.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::config::SecurityPolicy;
use super::timeout::TimeoutManager;
use super::types::{Args, ErrorCode, Request, StructuredError};

/// A bounded resource whose ceiling is set by the [`SecurityPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capacity {
    /// Inbound requests in flight on a server.
    Connections,
    /// Handler invocations running at once.
    ConcurrentHandlers,
    /// Client requests waiting for a reply.
    PendingCorrelations,
}

impl Capacity {
    /// The name reported in the error's `field`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connections => "connections",
            Self::ConcurrentHandlers => "concurrent_handlers",
            Self::PendingCorrelations => "pending_correlations",
        }
    }
}

/// Applies a [`SecurityPolicy`].
#[derive(Debug, Clone, Default)]
pub struct SecurityValidator {
    policy: Arc<SecurityPolicy>,
}

/// Counts serialized bytes without buffering them.
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn has_traversal(value: &str) -> bool {
    value.contains("../") || value.contains("..\\")
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-')
}

impl SecurityValidator {
    /// Creates a validator over a shared policy.
    #[must_use]
    pub const fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Validates a socket path.
    ///
    /// Checks, in order: null bytes, traversal sequences, length, character
    /// set, absoluteness and the directory allow-list.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::PathTraversalAttempt`] for `../` or `..\`, otherwise
    /// [`ErrorCode::InvalidSocketPath`].
    pub fn validate_socket_path(&self, path: &str) -> Result<(), StructuredError> {
        let invalid = |message: String| {
            StructuredError::new(ErrorCode::InvalidSocketPath, message).with_field("socket_path")
        };

        if path.contains('\0') {
            return Err(invalid("Socket path contains a null byte".to_string()));
        }
        if has_traversal(path) {
            return Err(StructuredError::new(
                ErrorCode::PathTraversalAttempt,
                "Socket path contains a traversal sequence",
            )
            .with_field("socket_path")
            .with_value(path));
        }
        if path.is_empty() {
            return Err(invalid("Socket path is empty".to_string()));
        }
        if path.len() > self.policy.max_socket_path_length {
            return Err(invalid(format!(
                "Socket path is {} bytes, maximum is {}",
                path.len(),
                self.policy.max_socket_path_length
            ))
            .with_constraints(json!({ "max_length": self.policy.max_socket_path_length })));
        }
        if let Some(bad) = path.chars().find(|c| !is_path_char(*c)) {
            return Err(invalid(format!("Socket path contains disallowed character {bad:?}"))
                .with_value(path)
                .with_constraints(json!({ "pattern": "^[A-Za-z0-9/_.-]+$" })));
        }
        if !path.starts_with('/') {
            return Err(invalid("Socket path must be absolute".to_string()).with_value(path));
        }
        if !self
            .policy
            .allowed_directories
            .iter()
            .any(|dir| path.starts_with(dir.as_str()))
        {
            return Err(invalid("Socket path is outside the allowed directories".to_string())
                .with_value(path)
                .with_constraints(json!({ "allowed_directories": self.policy.allowed_directories })));
        }
        Ok(())
    }

    /// Validates a routing name (`channelId` or `request`).
    ///
    /// # Errors
    ///
    /// [`ErrorCode::PathTraversalAttempt`] for traversal sequences,
    /// [`ErrorCode::ValidationFailed`] for empty or over-long names,
    /// [`ErrorCode::InvalidArgument`] for characters outside `[A-Za-z0-9_-]`.
    pub fn validate_name(&self, field: &str, value: &str) -> Result<(), StructuredError> {
        if has_traversal(value) {
            return Err(StructuredError::new(
                ErrorCode::PathTraversalAttempt,
                format!("{field} contains a traversal sequence"),
            )
            .with_field(field)
            .with_value(value));
        }
        if value.is_empty() {
            return Err(
                StructuredError::new(ErrorCode::ValidationFailed, format!("{field} is empty"))
                    .with_field(field),
            );
        }
        if value.chars().count() > self.policy.max_name_length {
            return Err(StructuredError::new(
                ErrorCode::ValidationFailed,
                format!("{field} exceeds {} characters", self.policy.max_name_length),
            )
            .with_field(field)
            .with_constraints(json!({ "max_length": self.policy.max_name_length })));
        }
        if !value.chars().all(is_name_char) {
            let err = StructuredError::new(
                ErrorCode::InvalidArgument,
                format!("{field} must match [A-Za-z0-9_-]+"),
            )
            .with_field(field)
            .with_constraints(json!({ "pattern": "^[A-Za-z0-9_-]+$" }));
            return Err(if value.contains('\0') { err } else { err.with_value(value) });
        }
        Ok(())
    }

    /// Validates a message identifier.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ValidationFailed`] for empty, over-long or control-character ids.
    pub fn validate_id(&self, field: &str, id: &str) -> Result<(), StructuredError> {
        let failed = |message: &str| {
            StructuredError::new(ErrorCode::ValidationFailed, message.to_string()).with_field(field)
        };
        if id.is_empty() {
            return Err(failed("identifier is empty"));
        }
        if id.chars().count() > self.policy.max_name_length {
            return Err(failed("identifier is too long")
                .with_constraints(json!({ "max_length": self.policy.max_name_length })));
        }
        if id.chars().any(char::is_control) {
            return Err(failed("identifier contains control characters"));
        }
        Ok(())
    }

    /// Validates the argument map: serialized size, nesting depth and string content.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MessageTooLarge`] above `max_args_size`,
    /// [`ErrorCode::ProtocolViolation`] above `max_json_depth`,
    /// [`ErrorCode::InvalidCharacterEncoding`] for null bytes in keys or strings.
    pub fn validate_args(&self, args: &Args) -> Result<(), StructuredError> {
        let mut counter = ByteCounter::default();
        serde_json::to_writer(&mut counter, args)?;
        if counter.0 > self.policy.max_args_size {
            return Err(
                StructuredError::message_too_large("Arguments", counter.0, self.policy.max_args_size)
                    .with_field("args"),
            );
        }

        for (key, value) in args {
            if key.contains('\0') {
                return Err(StructuredError::new(
                    ErrorCode::InvalidCharacterEncoding,
                    "Argument name contains a null byte",
                )
                .with_field("args"));
            }
            self.check_value(key, value, 1)?;
        }
        Ok(())
    }

    fn check_value(&self, field: &str, value: &Value, depth: usize) -> Result<(), StructuredError> {
        if depth > self.policy.max_json_depth {
            return Err(StructuredError::protocol_violation(format!(
                "Argument '{field}' nests deeper than {} levels",
                self.policy.max_json_depth
            ))
            .with_field(field)
            .with_constraints(json!({ "max_depth": self.policy.max_json_depth })));
        }
        match value {
            Value::String(s) if s.contains('\0') => Err(StructuredError::new(
                ErrorCode::InvalidCharacterEncoding,
                format!("Argument '{field}' contains a null byte"),
            )
            .with_field(field)),
            Value::Array(items) => items
                .iter()
                .try_for_each(|item| self.check_value(field, item, depth + 1)),
            Value::Object(map) => map.iter().try_for_each(|(key, item)| {
                if key.contains('\0') {
                    Err(StructuredError::new(
                        ErrorCode::InvalidCharacterEncoding,
                        format!("Argument '{field}' has a key containing a null byte"),
                    )
                    .with_field(field))
                } else {
                    self.check_value(field, item, depth + 1)
                }
            }),
            _ => Ok(()),
        }
    }

    /// Checks a total datagram size.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MessageTooLarge`] above `max_message_size`.
    pub fn validate_message_size(&self, size: usize) -> Result<(), StructuredError> {
        if size > self.policy.max_message_size {
            return Err(StructuredError::message_too_large(
                "Message",
                size,
                self.policy.max_message_size,
            ));
        }
        Ok(())
    }

    /// Checks a wire `timeout`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ResourceLimitExceeded`] outside `0.1..=300` seconds.
    pub fn validate_timeout(&self, secs: f64) -> Result<Duration, StructuredError> {
        TimeoutManager::validate_secs(secs)
    }

    /// The configured ceiling for `capacity`.
    #[must_use]
    pub fn limit(&self, capacity: Capacity) -> usize {
        match capacity {
            Capacity::Connections => self.policy.max_connections,
            Capacity::ConcurrentHandlers => self.policy.max_concurrent_handlers,
            Capacity::PendingCorrelations => self.policy.max_pending_correlations,
        }
    }

    /// Fails when `current` has reached the ceiling for `capacity`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ResourceLimitExceeded`] naming the resource.
    pub fn check_capacity(&self, capacity: Capacity, current: usize) -> Result<(), StructuredError> {
        if current >= self.limit(capacity) {
            return Err(self.capacity_exceeded(capacity));
        }
        Ok(())
    }

    /// The error reported once `capacity` is exhausted.
    #[must_use]
    pub fn capacity_exceeded(&self, capacity: Capacity) -> StructuredError {
        StructuredError::resource_limit(capacity.as_str(), self.limit(capacity))
    }

    /// Runs every request rule and returns the first failure.
    ///
    /// Order: `channelId`, `request`, `id`, `reply_to`, `timeout`, `args`.
    ///
    /// # Errors
    ///
    /// Whatever the first failing rule reports.
    pub fn validate_request(&self, request: &Request) -> Result<(), StructuredError> {
        self.validate_name("channelId", &request.channel_id)?;
        self.validate_name("request", &request.request)?;
        self.validate_id("id", &request.id)?;
        if let Some(reply_to) = &request.reply_to {
            self.validate_socket_path(reply_to)
                .map_err(|e| e.with_field("reply_to"))?;
        }
        self.validate_timeout(request.timeout)?;
        if let Some(args) = &request.args {
            self.validate_args(args)?;
        }
        Ok(())
    }
}
