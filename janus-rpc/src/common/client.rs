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

//! Datagram client.
//!
//! Every call that expects a reply binds its own reply-to socket, sends one
//! datagram and waits for one correlated response. All request validation
//! happens before any socket is created.
//!
//! Per call:
//!
//! ```text
//! Init -> SocketBound -> Sent -> AwaitingResponse -> Completed | TimedOut | Errored -> CleanedUp
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::UnixDatagram;
use tracing::{debug, trace};

use super::codec::MessageCodec;
use super::config::JanusConfig;
use super::correlator::{CorrelationHandle, ResponseCorrelator};
use super::manifest::Manifest;
use super::security::SecurityValidator;
use super::socket::{EphemeralSocket, SocketLifecycleManager};
use super::timeout::TimeoutManager;
use super::types::{Args, CorrelationToken, ErrorCode, Request, Response, StructuredError};

const MAX_IDLE_BUFFERS: usize = 4;

/// Receive buffers shared by a client's calls. Each holds one maximum-size
/// datagram plus a byte, so an oversized reply is detectable.
#[derive(Debug, Clone)]
struct ReceiveBuffers {
    size: usize,
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ReceiveBuffers {
    fn new(max_message_size: usize) -> Self {
        Self {
            size: max_message_size + 1,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn take(&self) -> Vec<u8> {
        self.idle.lock().pop().unwrap_or_else(|| vec![0u8; self.size])
    }

    fn give_back(&self, buf: Vec<u8>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS && buf.len() == self.size {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Per-call client state, used in trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Request built and validated.
    Init,
    /// Reply-to socket bound.
    SocketBound,
    /// Datagram handed to the kernel.
    Sent,
    /// Waiting for the correlated reply.
    AwaitingResponse,
    /// Reply delivered.
    Completed,
    /// Deadline elapsed first.
    TimedOut,
    /// Send or receive failed.
    Errored,
    /// Reply-to socket released.
    CleanedUp,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::SocketBound => "socket_bound",
            Self::Sent => "sent",
            Self::AwaitingResponse => "awaiting_response",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
            Self::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

/// Sends requests to one server on one channel.
#[derive(Debug, Clone)]
pub struct JanusClient {
    server_path: String,
    channel_id: String,
    timeouts: TimeoutManager,
    codec: MessageCodec,
    validator: SecurityValidator,
    sockets: SocketLifecycleManager,
    correlator: ResponseCorrelator,
    buffers: ReceiveBuffers,
    manifest: Option<Arc<Manifest>>,
}

impl JanusClient {
    /// Creates a client, validating the server path and channel up front.
    ///
    /// # Errors
    ///
    /// Configuration, socket path or channel name validation errors.
    pub fn new(
        server_path: impl AsRef<Path>,
        channel_id: impl Into<String>,
        config: JanusConfig,
    ) -> Result<Self, StructuredError> {
        config.validate()?;
        let server_path = server_path
            .as_ref()
            .to_str()
            .ok_or_else(|| {
                StructuredError::new(ErrorCode::InvalidSocketPath, "Socket path is not valid UTF-8")
                    .with_field("socket_path")
            })?
            .to_string();
        let channel_id = channel_id.into();

        let validator = SecurityValidator::new(config.shared_policy());
        validator.validate_socket_path(&server_path)?;
        validator.validate_name("channelId", &channel_id)?;

        let codec =
            MessageCodec::with_validator(validator.clone(), config.protocol.legacy_field_names);
        Ok(Self {
            server_path,
            channel_id,
            timeouts: config.timeout_manager()?,
            buffers: ReceiveBuffers::new(codec.max_message_size()),
            codec,
            sockets: SocketLifecycleManager::new(config.socket.clone(), validator.clone()),
            correlator: ResponseCorrelator::new(validator.clone()),
            validator,
            manifest: None,
        })
    }

    /// Checks arguments against `manifest` before sending.
    #[must_use]
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(Arc::new(manifest));
        self
    }

    /// The server socket path.
    #[must_use]
    pub fn server_path(&self) -> &str {
        &self.server_path
    }

    /// The channel every request is sent on.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    fn build(
        &self,
        request: &str,
        args: Option<Args>,
        timeout: Option<Duration>,
    ) -> Result<Request, StructuredError> {
        let request = Request::new(self.channel_id.clone(), request, args)
            .with_timeout(timeout.unwrap_or_else(|| self.timeouts.command_timeout()));
        self.validator.validate_request(&request)?;
        if let Some(manifest) = &self.manifest {
            manifest.validate_arguments(
                &request.channel_id,
                &request.request,
                request.args.as_ref(),
            )?;
        }
        // Catches an oversized datagram before any socket exists.
        self.codec.encode_request(&request)?;
        trace!("Request {} {}", request.id, RequestPhase::Init);
        Ok(request)
    }

    /// Sends a request and returns a handle to await its reply.
    ///
    /// # Errors
    ///
    /// Validation errors (before any I/O), [`ErrorCode::ResourceLimitExceeded`]
    /// when too many requests are pending, or [`ErrorCode::SocketError`] when
    /// the reply socket cannot be bound or the server socket does not accept
    /// the datagram.
    pub async fn submit(
        &self,
        request: &str,
        args: Option<Args>,
        timeout: Option<Duration>,
    ) -> Result<RequestHandle, StructuredError> {
        let mut request = self.build(request, args, timeout)?;
        let deadline = TimeoutManager::command_deadline(request.timeout)?;
        let correlation = self.correlator.register(&request.id, deadline)?;

        let socket = self.sockets.bind_ephemeral()?;
        trace!("Request {} {}", request.id, RequestPhase::SocketBound);
        request.reply_to = Some(socket.reply_to().to_string());

        let bytes = self.codec.encode_request(&request)?;
        if let Err(e) = socket.socket().send_to(&bytes, &self.server_path).await {
            debug!("Request {} {}: {}", request.id, RequestPhase::Errored, e);
            return Err(StructuredError::from(e).with_field("server_path"));
        }
        trace!("Request {} {}", request.id, RequestPhase::Sent);

        Ok(RequestHandle {
            correlation,
            socket,
            codec: self.codec.clone(),
            correlator: self.correlator.clone(),
            buf: self.buffers.take(),
            buffers: self.buffers.clone(),
        })
    }

    /// Sends a request and waits for its reply.
    ///
    /// A reply carrying `success: false` is returned as `Ok`; use
    /// [`call`](Self::call) to fold it into `Err`.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit), plus [`ErrorCode::CommandTimeout`].
    pub async fn send_request(
        &self,
        request: &str,
        args: Option<Args>,
        timeout: Option<Duration>,
    ) -> Result<Response, StructuredError> {
        self.submit(request, args, timeout).await?.response().await
    }

    /// Sends a request and returns its result value.
    ///
    /// # Errors
    ///
    /// As [`send_request`](Self::send_request), plus the server's error for a
    /// failed reply.
    pub async fn call(
        &self,
        request: &str,
        args: Option<Args>,
        timeout: Option<Duration>,
    ) -> Result<Value, StructuredError> {
        self.send_request(request, args, timeout).await?.into_result()
    }

    /// Sends a request without `reply_to`. The server runs it and sends nothing back.
    ///
    /// # Errors
    ///
    /// Validation errors, or [`ErrorCode::SocketError`] if the datagram
    /// cannot be delivered.
    pub async fn send_no_reply(&self, request: &str, args: Option<Args>) -> Result<(), StructuredError> {
        let request = self.build(request, args, None)?;
        let bytes = self.codec.encode_request(&request)?;
        let socket = UnixDatagram::unbound()?;
        socket
            .send_to(&bytes, &self.server_path)
            .await
            .map_err(|e| StructuredError::from(e).with_field("server_path"))?;
        trace!("Request {} {} without reply", request.id, RequestPhase::Sent);
        Ok(())
    }

    /// Returns `true` if the server answers `ping` successfully in time.
    pub async fn ping(&self) -> bool {
        matches!(
            self.send_request("ping", None, None).await,
            Ok(response) if response.success
        )
    }
}

/// An in-flight call. Owns the reply-to socket; dropping the handle
/// abandons the wait and releases the socket.
pub struct RequestHandle {
    correlation: CorrelationHandle,
    socket: EphemeralSocket,
    codec: MessageCodec,
    correlator: ResponseCorrelator,
    buf: Vec<u8>,
    buffers: ReceiveBuffers,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("token", self.correlation.token())
            .field("reply_to", &self.socket.reply_to())
            .finish_non_exhaustive()
    }
}

impl RequestHandle {
    /// The opaque token for this call.
    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        self.correlation.token()
    }

    /// Waits for the reply or the command timeout.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::CommandTimeout`] if the deadline elapses first,
    /// [`ErrorCode::SocketError`] if the reply socket fails.
    pub async fn response(mut self) -> Result<Response, StructuredError> {
        let id = self.correlation.token().to_string();
        trace!("Request {} {}", id, RequestPhase::AwaitingResponse);

        let outcome = tokio::select! {
            outcome = self.correlation.wait() => outcome,
            error = pump(&self.socket, &mut self.buf, &self.codec, &self.correlator) => Err(error),
        };

        match &outcome {
            Ok(_) => trace!("Request {} {}", id, RequestPhase::Completed),
            Err(e) if e.code == ErrorCode::CommandTimeout => {
                debug!("Request {} {}", id, RequestPhase::TimedOut);
            }
            Err(e) => debug!("Request {} {}: {}", id, RequestPhase::Errored, e),
        }
        drop(self);
        trace!("Request {} {}", id, RequestPhase::CleanedUp);
        outcome
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.buffers.give_back(std::mem::take(&mut self.buf));
    }
}

/// Feeds every datagram arriving on the reply socket to the correlator.
/// Returns only on a receive failure.
async fn pump(
    socket: &EphemeralSocket,
    buf: &mut [u8],
    codec: &MessageCodec,
    correlator: &ResponseCorrelator,
) -> StructuredError {
    loop {
        match socket.socket().recv(buf).await {
            Ok(len) => match codec.decode_response(&buf[..len]) {
                Ok(response) => {
                    correlator.resolve(response);
                }
                Err(e) => debug!("Ignoring undecodable datagram on {}: {}", socket.reply_to(), e),
            },
            Err(e) => return StructuredError::from(e).with_field("reply_to"),
        }
    }
}
