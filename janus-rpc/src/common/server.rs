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

//! Datagram server: receive loop, per-request tasks and lifecycle handle.
//!
//! The receive loop never waits on a handler. Every accepted datagram is
//! processed on its own task, bounded by `max_connections`; datagrams that
//! arrive over the rate limit or the in-flight ceiling are refused inline
//! with a non-blocking reply.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UnixDatagram;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::codec::MessageCodec;
use super::config::JanusConfig;
use super::dispatcher::{CommandDispatcher, Handler, RequestStage};
use super::manifest::Manifest;
use super::rate_limiter::RateLimiter;
use super::security::{Capacity, SecurityValidator};
use super::socket::{ServerSocket, SocketLifecycleManager};
use super::types::{ErrorCode, Response, StructuredError};

const REPLY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters for one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Datagrams taken off the socket.
    pub requests_received: AtomicUsize,
    /// Requests refused before execution.
    pub requests_rejected: AtomicUsize,
    /// Requests handed to a handler.
    pub requests_dispatched: AtomicUsize,
    /// Requests currently being processed.
    pub requests_in_flight: AtomicUsize,
    /// Responses delivered to a reply socket.
    pub responses_sent: AtomicUsize,
    /// Handlers the server stopped waiting on.
    pub handler_timeouts: AtomicUsize,
    /// Handlers that returned an error or panicked.
    pub handler_failures: AtomicUsize,
    /// Receive or send failures.
    pub socket_errors: AtomicUsize,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// See [`ServerStats::requests_received`].
    pub requests_received: usize,
    /// See [`ServerStats::requests_rejected`].
    pub requests_rejected: usize,
    /// See [`ServerStats::requests_dispatched`].
    pub requests_dispatched: usize,
    /// See [`ServerStats::requests_in_flight`].
    pub requests_in_flight: usize,
    /// See [`ServerStats::responses_sent`].
    pub responses_sent: usize,
    /// See [`ServerStats::handler_timeouts`].
    pub handler_timeouts: usize,
    /// See [`ServerStats::handler_failures`].
    pub handler_failures: usize,
    /// See [`ServerStats::socket_errors`].
    pub socket_errors: usize,
}

impl ServerStats {
    /// Create new statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of datagrams received.
    #[must_use]
    pub fn requests_received(&self) -> usize {
        self.requests_received.load(Ordering::Relaxed)
    }

    /// Get the number of rejected requests.
    #[must_use]
    pub fn requests_rejected(&self) -> usize {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    /// Get the number of dispatched requests.
    #[must_use]
    pub fn requests_dispatched(&self) -> usize {
        self.requests_dispatched.load(Ordering::Relaxed)
    }

    /// Get the number of requests currently being processed.
    #[must_use]
    pub fn requests_in_flight(&self) -> usize {
        self.requests_in_flight.load(Ordering::Relaxed)
    }

    /// Get the number of responses sent.
    #[must_use]
    pub fn responses_sent(&self) -> usize {
        self.responses_sent.load(Ordering::Relaxed)
    }

    /// Get the number of handler timeouts.
    #[must_use]
    pub fn handler_timeouts(&self) -> usize {
        self.handler_timeouts.load(Ordering::Relaxed)
    }

    /// Get the number of failed or panicked handlers.
    #[must_use]
    pub fn handler_failures(&self) -> usize {
        self.handler_failures.load(Ordering::Relaxed)
    }

    /// Get the number of socket errors.
    #[must_use]
    pub fn socket_errors(&self) -> usize {
        self.socket_errors.load(Ordering::Relaxed)
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_received: self.requests_received(),
            requests_rejected: self.requests_rejected(),
            requests_dispatched: self.requests_dispatched(),
            requests_in_flight: self.requests_in_flight(),
            responses_sent: self.responses_sent(),
            handler_timeouts: self.handler_timeouts(),
            handler_failures: self.handler_failures(),
            socket_errors: self.socket_errors(),
        }
    }
}

/// Outcome of [`ServerHandle::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every in-flight request finished within the drain timeout.
    pub drained: bool,
    /// Requests in flight when shutdown began.
    pub in_flight_at_shutdown: usize,
    /// Requests still running when the drain timeout elapsed.
    pub abandoned: usize,
    /// Final counters.
    pub stats: StatsSnapshot,
}

/// A configured, not yet listening server.
///
/// ```rust,ignore
/// let server = JanusServer::new(config)?;
/// server.register_handler("add", sync_handler(|req| Ok(json!(1 + 1))))?;
/// let handle = server.start()?;
/// // ...
/// let report = handle.shutdown().await;
/// ```
#[derive(Debug)]
pub struct JanusServer {
    config: JanusConfig,
    socket_path: PathBuf,
    validator: SecurityValidator,
    dispatcher: Arc<CommandDispatcher>,
    stats: Arc<ServerStats>,
}

impl JanusServer {
    /// Creates a server bound to `config.socket_path()` once started.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ValidationFailed`] for an invalid configuration, or a
    /// socket path validation error.
    pub fn new(config: JanusConfig) -> Result<Self, StructuredError> {
        config.validate()?;
        let socket_path = config.socket_path();
        let path_str = socket_path.to_str().ok_or_else(|| {
            StructuredError::new(ErrorCode::InvalidSocketPath, "Socket path is not valid UTF-8")
                .with_field("socket_path")
        })?;

        let validator = SecurityValidator::new(config.shared_policy());
        validator.validate_socket_path(path_str)?;

        let stats = Arc::new(ServerStats::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            validator.clone(),
            config.timeout_manager()?,
            Arc::clone(&stats),
            path_str,
        ));

        Ok(Self {
            config,
            socket_path,
            validator,
            dispatcher,
            stats,
        })
    }

    /// Registers a custom handler.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::register`].
    pub fn register_handler(&self, name: &str, handler: impl Handler) -> Result<(), StructuredError> {
        self.dispatcher.register(name, handler)
    }

    /// Removes a custom handler.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::unregister`].
    pub fn unregister_handler(&self, name: &str) -> Result<(), StructuredError> {
        self.dispatcher.unregister(name)
    }

    /// Attaches the manifest used for argument checks and the `manifest` command.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::set_manifest`].
    pub fn set_manifest(&self, manifest: Manifest) -> Result<(), StructuredError> {
        self.dispatcher.set_manifest(manifest)
    }

    /// Where the server listens.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The handler registry.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Binds the socket and spawns the receive loop.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// See [`SocketLifecycleManager::bind_server`].
    pub fn start(&self) -> Result<ServerHandle, StructuredError> {
        let lifecycle =
            SocketLifecycleManager::new(self.config.socket.clone(), self.validator.clone());
        let server_socket = lifecycle.bind_server(&self.socket_path)?;

        let context = Arc::new(ServerContext {
            codec: MessageCodec::with_validator(
                self.validator.clone(),
                self.config.protocol.legacy_field_names,
            ),
            validator: self.validator.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            rate_limiter: RateLimiter::new(&self.config.rate_limit),
            in_flight: Arc::new(Semaphore::new(self.validator.limit(Capacity::Connections))),
            stats: Arc::clone(&self.stats),
            socket: server_socket.socket(),
        });

        if context.rate_limiter.is_enabled() {
            info!(
                "Rate limiting inbound requests to {}/s, burst {}",
                self.config.rate_limit.requests_per_second, self.config.rate_limit.burst_size
            );
        }

        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let receive_task = tokio::spawn(receive_loop(
            context,
            cancel_token.clone(),
            tracker.clone(),
        ));

        info!("Server listening on: {}", self.socket_path.display());
        Ok(ServerHandle {
            socket_path: self.socket_path.clone(),
            stats: Arc::clone(&self.stats),
            dispatcher: Arc::clone(&self.dispatcher),
            cancel_token,
            tracker,
            receive_task: Some(receive_task),
            server_socket,
            drain_timeout: self.config.drain_timeout(),
        })
    }
}

/// Handle to a running server.
///
/// Dropping the handle stops the receive loop and releases the socket file
/// without draining; call [`shutdown`](Self::shutdown) to drain first.
#[derive(Debug)]
pub struct ServerHandle {
    socket_path: PathBuf,
    stats: Arc<ServerStats>,
    dispatcher: Arc<CommandDispatcher>,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
    receive_task: Option<JoinHandle<()>>,
    server_socket: ServerSocket,
    drain_timeout: Duration,
}

impl ServerHandle {
    /// Where the server listens.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Live counters.
    #[must_use]
    pub const fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// The handler registry, for changes while running.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Request the receive loop to stop.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the server has been told to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stops receiving, waits up to the drain timeout for in-flight requests,
    /// then closes the socket.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.cancel_token.cancel();
        if let Some(task) = self.receive_task.take() {
            if let Err(e) = task.await {
                error!("Receive loop ended abnormally: {}", e);
            }
        }

        self.tracker.close();
        let in_flight_at_shutdown = self.tracker.len();
        if in_flight_at_shutdown > 0 {
            debug!("Draining {} in-flight requests", in_flight_at_shutdown);
        }
        let drained = tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_ok();
        let abandoned = if drained { 0 } else { self.tracker.len() };
        if !drained {
            warn!(
                "Drain timeout elapsed with {} requests still running",
                abandoned
            );
        }

        self.server_socket.close();
        let report = ShutdownReport {
            drained,
            in_flight_at_shutdown,
            abandoned,
            stats: self.stats.snapshot(),
        };
        info!("Server at {} shut down", self.socket_path.display());
        report
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct ServerContext {
    codec: MessageCodec,
    validator: SecurityValidator,
    dispatcher: Arc<CommandDispatcher>,
    rate_limiter: RateLimiter,
    in_flight: Arc<Semaphore>,
    stats: Arc<ServerStats>,
    socket: Arc<UnixDatagram>,
}

async fn receive_loop(
    context: Arc<ServerContext>,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
) {
    // One byte over the ceiling so oversized datagrams are detectable.
    let mut buf = vec![0u8; context.codec.max_message_size() + 1];

    loop {
        tokio::select! {
            biased;

            () = cancel_token.cancelled() => {
                info!("Server received shutdown signal");
                break;
            }

            received = context.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, _addr)) => {
                        context.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                        trace!("Datagram {}: {} bytes", RequestStage::Received, len);
                        context.accept(buf[..len].to_vec(), &tracker);
                    }
                    Err(e) => {
                        error!("Failed to receive datagram: {}", e);
                        context.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

impl ServerContext {
    fn accept(self: &Arc<Self>, payload: Vec<u8>, tracker: &TaskTracker) {
        if let Err(e) = self.rate_limiter.acquire() {
            warn!("Rate limit exceeded, rejecting datagram");
            self.reject_inline(&payload, e);
            return;
        }

        let limit = self.validator.limit(Capacity::Connections);
        let in_use = limit.saturating_sub(self.in_flight.available_permits());
        let acquired = self
            .validator
            .check_capacity(Capacity::Connections, in_use)
            .and_then(|()| {
                Arc::clone(&self.in_flight)
                    .try_acquire_owned()
                    .map_err(|_| self.validator.capacity_exceeded(Capacity::Connections))
            });
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Maximum in-flight requests reached, rejecting datagram");
                self.reject_inline(&payload, e);
                return;
            }
        };

        let context = Arc::clone(self);
        tracker.spawn(async move {
            context.stats.requests_in_flight.fetch_add(1, Ordering::Relaxed);
            context.process(payload).await;
            context.stats.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    async fn process(&self, payload: Vec<u8>) {
        let request = match self.codec.decode_request(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Datagram {}: {}", RequestStage::Rejected, e);
                self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
                if let Some((id, reply_to)) = self.codec.salvage_reply_route(&payload) {
                    self.respond(&reply_to, Response::failure(id, e)).await;
                }
                return;
            }
        };

        let reply_to = request.reply_to.clone();
        let response = self.dispatcher.dispatch(request).await;
        match reply_to {
            Some(reply_to) => self.respond(&reply_to, response).await,
            None => trace!("Request {} was fire-and-forget", response.request_id),
        }
    }

    fn reject_inline(&self, payload: &[u8], error: StructuredError) {
        self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
        let Some((id, reply_to)) = self.codec.salvage_reply_route(payload) else {
            return;
        };
        if self.validator.validate_socket_path(&reply_to).is_err() {
            return;
        }
        let Some(bytes) = self.encode(Response::failure(id, error)) else {
            return;
        };
        match self.socket.try_send_to(&bytes, &reply_to) {
            Ok(_) => {
                self.stats.responses_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Dropped rejection for {}: {}", reply_to, e);
                self.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn respond(&self, reply_to: &str, response: Response) {
        trace!("Request {} {}", response.request_id, RequestStage::Responding);
        if let Err(e) = self.validator.validate_socket_path(reply_to) {
            warn!("Refusing to reply to {}: {}", reply_to, e);
            return;
        }
        let Some(bytes) = self.encode(response) else {
            return;
        };

        match tokio::time::timeout(REPLY_SEND_TIMEOUT, self.socket.send_to(&bytes, reply_to)).await {
            Ok(Ok(_)) => {
                self.stats.responses_sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!("Failed to deliver response to {}: {}", reply_to, e);
                self.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!("Timed out delivering response to {}", reply_to);
                self.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Encodes `response`, replacing an oversized one with a `MESSAGE_TOO_LARGE` failure.
    fn encode(&self, response: Response) -> Option<Vec<u8>> {
        match self.codec.encode_response(&response) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Response to {} could not be encoded: {}", response.request_id, e);
                let fallback = Response::failure(response.request_id, e);
                self.codec
                    .encode_response(&fallback)
                    .map_err(|e| error!("Failed to encode fallback response: {}", e))
                    .ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = ServerStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = ServerStats::new();
        stats.requests_received.fetch_add(3, Ordering::Relaxed);
        stats.handler_timeouts.fetch_add(1, Ordering::Relaxed);
        stats.handler_failures.fetch_add(2, Ordering::Relaxed);
        stats.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.handler_failures(), 2);
        assert_eq!(stats.requests_in_flight(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_received, 3);
        assert_eq!(snapshot.handler_timeouts, 1);
        assert_eq!(snapshot.handler_failures, 2);
        assert_eq!(snapshot.requests_in_flight, 1);
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["requests_received"], 3);
    }

    #[test]
    fn test_new_rejects_path_outside_allow_list() {
        let mut config = JanusConfig::default();
        config.socket.path = Some(PathBuf::from("/etc/janus.sock"));
        assert_eq!(
            JanusServer::new(config).unwrap_err().code,
            ErrorCode::InvalidSocketPath
        );
    }

    #[tokio::test]
    async fn test_handle_stop_and_shutdown() {
        let dir = tempfile::Builder::new()
            .prefix("janus")
            .tempdir_in("/tmp")
            .unwrap();
        let mut config = JanusConfig::default();
        config.socket.path = Some(dir.path().join("server.sock"));
        let server = JanusServer::new(config).unwrap();
        let handle = server.start().unwrap();
        assert!(handle.socket_path().exists());
        assert!(!handle.is_cancelled());

        handle.stop();
        assert!(handle.is_cancelled());
        let path = handle.socket_path().to_path_buf();
        let report = handle.shutdown().await;
        assert!(report.drained);
        assert_eq!(report.abandoned, 0);
        assert!(!path.exists());
    }
}
