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

//! Client-side table of outstanding requests.
//!
//! An entry exists only while its request is waiting. Both terminal
//! transitions, [`ResponseCorrelator::resolve`] and
//! [`ResponseCorrelator::expire`], begin by removing the entry; whichever
//! removes it delivers the outcome and the other is a no-op.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::security::{Capacity, SecurityValidator};
use super::timeout::TimeoutManager;
use super::types::{CorrelationToken, ErrorCode, Response, StructuredError};

type Outcome = Result<Response, StructuredError>;

/// Resolution state of one correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    /// No terminal outcome yet.
    Waiting,
    /// A matching response was delivered.
    Resolved,
    /// The deadline elapsed first.
    TimedOut,
}

#[derive(Debug)]
struct PendingCorrelation {
    timeout: Duration,
    sender: oneshot::Sender<Outcome>,
}

/// Maps request identifiers to waiting callers.
#[derive(Debug, Clone)]
pub struct ResponseCorrelator {
    pending: Arc<DashMap<String, PendingCorrelation>>,
    validator: SecurityValidator,
}

impl ResponseCorrelator {
    /// Creates an empty table bounded by the policy's `max_pending_correlations`.
    #[must_use]
    pub fn new(validator: SecurityValidator) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            validator,
        }
    }

    /// Inserts a waiting entry for `request_id`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ResourceLimitExceeded`] when the table is full,
    /// [`ErrorCode::InvalidArgument`] when `request_id` is already waiting.
    pub fn register(
        &self,
        request_id: &str,
        deadline: Instant,
    ) -> Result<CorrelationHandle, StructuredError> {
        self.validator
            .check_capacity(Capacity::PendingCorrelations, self.pending.len())?;

        let (sender, receiver) = oneshot::channel();
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.pending.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(StructuredError::new(
                    ErrorCode::InvalidArgument,
                    format!("Request {request_id} is already awaiting a response"),
                )
                .with_field("id")
                .with_value(request_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCorrelation { timeout, sender });
            }
        }
        trace!("Correlation registered: {}", request_id);

        Ok(CorrelationHandle {
            token: CorrelationToken::new(request_id),
            deadline,
            receiver,
            correlator: self.clone(),
            state: CorrelationState::Waiting,
        })
    }

    /// Delivers `response` to the caller waiting on its `request_id`.
    ///
    /// Returns `false` if nobody is waiting (late, duplicate or unknown).
    pub fn resolve(&self, response: Response) -> bool {
        let Some((request_id, pending)) = self.pending.remove(&response.request_id) else {
            debug!(
                "Discarding response for unknown or expired request: {}",
                response.request_id
            );
            return false;
        };
        trace!("Correlation resolved: {}", request_id);
        // The receiver may already be gone if the caller abandoned the wait.
        let _ = pending.sender.send(Ok(response));
        true
    }

    /// Delivers a `COMMAND_TIMEOUT` to the caller waiting on `request_id`.
    ///
    /// Returns `false` if the entry was already resolved.
    pub fn expire(&self, request_id: &str) -> bool {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            return false;
        };
        debug!("Correlation timed out: {}", request_id);
        let _ = pending.sender.send(Err(TimeoutManager::command_timeout_error(
            request_id,
            pending.timeout,
        )));
        true
    }

    /// Drops the entry for `request_id` without delivering anything.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Number of entries still waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `request_id` is still waiting.
    #[must_use]
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }
}

/// The caller's side of one correlation. Dropping it abandons the wait.
#[derive(Debug)]
pub struct CorrelationHandle {
    token: CorrelationToken,
    deadline: Instant,
    receiver: oneshot::Receiver<Outcome>,
    correlator: ResponseCorrelator,
    state: CorrelationState,
}

impl CorrelationHandle {
    /// The opaque token for this call.
    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// When the wait gives up.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Current resolution state.
    #[must_use]
    pub const fn state(&self) -> CorrelationState {
        self.state
    }

    /// Waits for the terminal outcome: the response, or `COMMAND_TIMEOUT`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::CommandTimeout`] if the deadline elapses first.
    pub async fn wait(&mut self) -> Outcome {
        if self.state != CorrelationState::Waiting {
            return Err(StructuredError::internal(format!(
                "Correlation {} already finished",
                self.token
            )));
        }

        let waited = tokio::time::timeout_at(self.deadline, &mut self.receiver).await;
        let received = match waited {
            Ok(received) => received,
            Err(_elapsed) => {
                // Whichever of expire/resolve removed the entry has already sent.
                self.correlator.expire(self.token.as_str());
                (&mut self.receiver).await
            }
        };

        let outcome = received.unwrap_or_else(|_| {
            Err(StructuredError::internal(format!(
                "Correlation {} was cancelled",
                self.token
            )))
        });
        self.state = match &outcome {
            Err(e) if e.code == ErrorCode::CommandTimeout => CorrelationState::TimedOut,
            _ => CorrelationState::Resolved,
        };
        outcome
    }
}

impl Drop for CorrelationHandle {
    fn drop(&mut self) {
        if self.state == CorrelationState::Waiting && self.correlator.cancel(self.token.as_str()) {
            trace!("Correlation abandoned: {}", self.token);
        }
    }
}
