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

//! Bilateral deadlines.
//!
//! The command timeout bounds how long a client waits for a reply. The
//! handler timeout bounds how long the server waits on one handler. The two
//! clocks are unrelated: neither side can cancel the other.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use super::types::{ErrorCode, StructuredError};

/// Shortest accepted timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest accepted timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout used when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Computes and checks both deadlines.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutManager {
    command: Duration,
    handler: Duration,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self {
            command: DEFAULT_TIMEOUT,
            handler: DEFAULT_TIMEOUT,
        }
    }
}

impl TimeoutManager {
    /// Creates a manager with the given defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ResourceLimitExceeded`] if either duration lies
    /// outside `0.1s..=300s`.
    pub fn new(command: Duration, handler: Duration) -> Result<Self, StructuredError> {
        Self::check_range(command)?;
        Self::check_range(handler)?;
        Ok(Self { command, handler })
    }

    /// Default client wait.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        self.command
    }

    /// Server-side handler deadline.
    #[must_use]
    pub const fn handler_timeout(&self) -> Duration {
        self.handler
    }

    /// Checks a duration against the accepted window.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ResourceLimitExceeded`] carrying the bounds.
    pub fn check_range(timeout: Duration) -> Result<(), StructuredError> {
        if (MIN_TIMEOUT..=MAX_TIMEOUT).contains(&timeout) {
            Ok(())
        } else {
            Err(Self::out_of_range(timeout.as_secs_f64()))
        }
    }

    /// Converts a wire `timeout` (seconds) into a checked duration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ResourceLimitExceeded`] for values outside
    /// `0.1..=300`, including `NaN` and infinities.
    pub fn validate_secs(secs: f64) -> Result<Duration, StructuredError> {
        if !secs.is_finite() || secs < MIN_TIMEOUT.as_secs_f64() || secs > MAX_TIMEOUT.as_secs_f64()
        {
            return Err(Self::out_of_range(secs));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    /// Deadline for a client waiting on a reply, starting now.
    ///
    /// # Errors
    ///
    /// Fails like [`validate_secs`](Self::validate_secs).
    pub fn command_deadline(secs: f64) -> Result<Instant, StructuredError> {
        Ok(Instant::now() + Self::validate_secs(secs)?)
    }

    /// Deadline for one handler invocation, starting now.
    #[must_use]
    pub fn handler_deadline(&self) -> Instant {
        Instant::now() + self.handler
    }

    /// The error a client reports when it stops waiting.
    #[must_use]
    pub fn command_timeout_error(request_id: &str, after: Duration) -> StructuredError {
        StructuredError::new(
            ErrorCode::CommandTimeout,
            format!(
                "No response to request {request_id} within {:.3}s",
                after.as_secs_f64()
            ),
        )
        .with_field("timeout")
        .with_value(after.as_secs_f64())
    }

    /// The error a server reports when it stops waiting on a handler.
    #[must_use]
    pub fn handler_timeout_error(request: &str, after: Duration) -> StructuredError {
        StructuredError::new(
            ErrorCode::HandlerTimeout,
            format!(
                "Handler '{request}' did not finish within {:.3}s",
                after.as_secs_f64()
            ),
        )
        .with_field("request")
        .with_value(request)
    }

    fn out_of_range(secs: f64) -> StructuredError {
        let err = StructuredError::new(
            ErrorCode::ResourceLimitExceeded,
            format!(
                "Timeout must be between {} and {} seconds",
                MIN_TIMEOUT.as_secs_f64(),
                MAX_TIMEOUT.as_secs_f64()
            ),
        )
        .with_field("timeout")
        .with_constraints(json!({
            "min": MIN_TIMEOUT.as_secs_f64(),
            "max": MAX_TIMEOUT.as_secs_f64(),
        }));
        // NaN and infinities are not representable in JSON.
        if secs.is_finite() {
            err.with_value(secs)
        } else {
            err
        }
    }
}
