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

//! Server-side handler registry and execution pipeline.
//!
//! The registry is pre-populated with the built-in commands. Custom handlers
//! are added by name; built-in names are reserved and can be neither
//! replaced nor removed.
//!
//! Each request moves through:
//!
//! ```text
//! Received -> Validating -> Rejected
//!                        -> Dispatching -> Executing -> Responding
//!                                                    -> HandlerTimedOut
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, trace, warn};

use super::builtins::{self, BuiltinCommand, BuiltinContext};
use super::manifest::Manifest;
use super::security::{Capacity, SecurityValidator};
use super::server::ServerStats;
use super::timeout::TimeoutManager;
use super::types::{ErrorCode, Request, Response, StructuredError};

/// An invocable operation registered under a command name.
///
/// Returning `Err` produces a failed response carrying that error. A panic
/// inside `invoke` is reported as `INTERNAL_ERROR`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Runs the operation for one request.
    async fn invoke(&self, request: Request) -> Result<Value, StructuredError>;
}

/// A [`Handler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StructuredError>> + Send + 'static,
{
    async fn invoke(&self, request: Request) -> Result<Value, StructuredError> {
        (self.0)(request).await
    }
}

/// A [`Handler`] backed by a plain closure. See [`sync_handler`].
pub struct SyncHandler<F>(F);

#[async_trait]
impl<F> Handler for SyncHandler<F>
where
    F: Fn(&Request) -> Result<Value, StructuredError> + Send + Sync + 'static,
{
    async fn invoke(&self, request: Request) -> Result<Value, StructuredError> {
        (self.0)(&request)
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StructuredError>> + Send + 'static,
{
    FnHandler(f)
}

/// Wraps a synchronous closure as a [`Handler`].
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(&Request) -> Result<Value, StructuredError> + Send + Sync + 'static,
{
    SyncHandler(f)
}

#[derive(Clone)]
enum HandlerEntry {
    Builtin(BuiltinCommand),
    Custom(Arc<dyn Handler>),
}

/// Per-request server state, used in trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    /// Datagram taken off the socket.
    Received,
    /// Decoding and rule checks.
    Validating,
    /// Refused before execution.
    Rejected,
    /// Looking up the handler and acquiring a permit.
    Dispatching,
    /// Handler running.
    Executing,
    /// Sending the response.
    Responding,
    /// Stopped waiting on the handler.
    HandlerTimedOut,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Validating => "validating",
            Self::Rejected => "rejected",
            Self::Dispatching => "dispatching",
            Self::Executing => "executing",
            Self::Responding => "responding",
            Self::HandlerTimedOut => "handler_timed_out",
        };
        f.write_str(name)
    }
}

/// Registry of named handlers plus the pipeline that runs them.
pub struct CommandDispatcher {
    handlers: DashMap<String, HandlerEntry>,
    manifest: RwLock<Arc<Manifest>>,
    validator: SecurityValidator,
    timeouts: TimeoutManager,
    handler_permits: Arc<Semaphore>,
    stats: Arc<ServerStats>,
    socket_path: String,
    started_at: Instant,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("handlers", &self.handler_names())
            .field("handler_timeout", &self.timeouts.handler_timeout())
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Creates a dispatcher holding only the built-in commands.
    #[must_use]
    pub fn new(
        validator: SecurityValidator,
        timeouts: TimeoutManager,
        stats: Arc<ServerStats>,
        socket_path: impl Into<String>,
    ) -> Self {
        let handlers = DashMap::new();
        for builtin in BuiltinCommand::ALL {
            handlers.insert(builtin.as_str().to_string(), HandlerEntry::Builtin(builtin));
        }
        let max_handlers = validator.limit(Capacity::ConcurrentHandlers);
        Self {
            handlers,
            manifest: RwLock::new(Arc::new(Manifest::default())),
            validator,
            timeouts,
            handler_permits: Arc::new(Semaphore::new(max_handlers)),
            stats,
            socket_path: socket_path.into(),
            started_at: Instant::now(),
        }
    }

    /// Registers `handler` under `name`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ReservedHandlerName`] for a built-in name,
    /// [`ErrorCode::ValidationFailed`] for an invalid or already registered name.
    pub fn register(&self, name: &str, handler: impl Handler) -> Result<(), StructuredError> {
        if BuiltinCommand::from_name(name).is_some() {
            return Err(StructuredError::new(
                ErrorCode::ReservedHandlerName,
                format!("'{name}' is a reserved built-in command"),
            )
            .with_field("name")
            .with_value(name));
        }
        self.validator.validate_name("name", name).map_err(|e| {
            StructuredError::new(ErrorCode::ValidationFailed, e.message).with_field("name")
        })?;

        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(StructuredError::new(
                ErrorCode::ValidationFailed,
                format!("A handler is already registered for '{name}'"),
            )
            .with_field("name")
            .with_value(name)),
            Entry::Vacant(slot) => {
                slot.insert(HandlerEntry::Custom(Arc::new(handler)));
                debug!("Registered handler: {}", name);
                Ok(())
            }
        }
    }

    /// Removes the custom handler registered under `name`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ReservedHandlerName`] for a built-in name,
    /// [`ErrorCode::HandlerNotFound`] if nothing is registered.
    pub fn unregister(&self, name: &str) -> Result<(), StructuredError> {
        if BuiltinCommand::from_name(name).is_some() {
            return Err(StructuredError::new(
                ErrorCode::ReservedHandlerName,
                format!("'{name}' is a reserved built-in command"),
            )
            .with_field("name"));
        }
        self.handlers.remove(name).map(|_| ()).ok_or_else(|| {
            StructuredError::new(
                ErrorCode::HandlerNotFound,
                format!("No handler registered for '{name}'"),
            )
            .with_field("name")
        })
    }

    /// Returns `true` if `name` resolves to a built-in or custom handler.
    #[must_use]
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All command names, sorted.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Attaches a manifest, replacing the current one.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ValidationFailed`] if the manifest is inconsistent.
    pub fn set_manifest(&self, manifest: Manifest) -> Result<(), StructuredError> {
        manifest.check()?;
        *self.manifest.write() = Arc::new(manifest);
        Ok(())
    }

    /// The manifest currently in force.
    #[must_use]
    pub fn manifest(&self) -> Arc<Manifest> {
        self.manifest.read().clone()
    }

    /// Handler invocations currently holding a permit.
    #[must_use]
    pub fn active_handlers(&self) -> usize {
        self.validator
            .limit(Capacity::ConcurrentHandlers)
            .saturating_sub(self.handler_permits.available_permits())
    }

    /// Runs `request` through validation, lookup and execution and builds
    /// the response. Never fails: every error becomes a failed response.
    pub async fn dispatch(&self, request: Request) -> Response {
        let request_id = request.id.clone();
        match self.execute(request).await {
            Ok(result) => Response::success(request_id, result),
            Err(error) => Response::failure(request_id, error),
        }
    }

    /// Like [`dispatch`](Self::dispatch), returning the handler's outcome.
    ///
    /// # Errors
    ///
    /// Validation errors, [`ErrorCode::HandlerNotFound`],
    /// [`ErrorCode::ResourceLimitExceeded`] when every handler permit is in
    /// use, [`ErrorCode::HandlerTimeout`], [`ErrorCode::InternalError`] for a
    /// panicking handler, or the handler's own error.
    pub async fn execute(&self, request: Request) -> Result<Value, StructuredError> {
        let id = request.id.clone();
        trace!("Request {} {}", id, RequestStage::Validating);
        if let Err(e) = self.validate(&request) {
            debug!("Request {} {}: {}", id, RequestStage::Rejected, e);
            self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        trace!("Request {} {}", id, RequestStage::Dispatching);
        let Some(entry) = self.handlers.get(&request.request).map(|e| e.value().clone()) else {
            self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StructuredError::new(
                ErrorCode::HandlerNotFound,
                format!("No handler for '{}'", request.request),
            )
            .with_field("request")
            .with_value(request.request.as_str()));
        };

        let acquired = self
            .validator
            .check_capacity(Capacity::ConcurrentHandlers, self.active_handlers())
            .and_then(|()| {
                Arc::clone(&self.handler_permits)
                    .try_acquire_owned()
                    .map_err(|_| self.validator.capacity_exceeded(Capacity::ConcurrentHandlers))
            });
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Maximum concurrent handlers reached, rejecting request {}", id);
                self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        trace!("Request {} {}: {}", id, RequestStage::Executing, request.request);
        self.stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        let name = request.request.clone();
        let task = match entry {
            HandlerEntry::Builtin(command) => {
                let context = self.builtin_context();
                tokio::spawn(async move {
                    let _permit = permit;
                    builtins::run(command, request, context).await
                })
            }
            HandlerEntry::Custom(handler) => tokio::spawn(async move {
                let _permit = permit;
                handler.invoke(request).await
            }),
        };

        // On timeout the task is detached and keeps its permit until it ends.
        match tokio::time::timeout_at(self.timeouts.handler_deadline(), task).await {
            Ok(Ok(outcome)) => {
                if outcome.is_err() {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
                outcome
            }
            Ok(Err(join_error)) => {
                error!("Handler '{}' for request {} failed: {}", name, id, join_error);
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                Err(StructuredError::internal(format!("Handler '{name}' failed unexpectedly"))
                    .with_field("request"))
            }
            Err(_elapsed) => {
                warn!("Request {} {}: '{}'", id, RequestStage::HandlerTimedOut, name);
                self.stats.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(TimeoutManager::handler_timeout_error(
                    &name,
                    self.timeouts.handler_timeout(),
                ))
            }
        }
    }

    fn validate(&self, request: &Request) -> Result<(), StructuredError> {
        self.validator.validate_request(request)?;
        self.manifest().validate_arguments(
            &request.channel_id,
            &request.request,
            request.args.as_ref(),
        )
    }

    fn builtin_context(&self) -> BuiltinContext {
        BuiltinContext {
            manifest: self.manifest(),
            validator: self.validator.clone(),
            socket_path: self.socket_path.clone(),
            uptime: self.started_at.elapsed(),
            handlers: self.handler_names(),
            stats: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::JanusConfig;
    use std::time::Duration;
    use serde_json::json;

    fn dispatcher_with(config: &JanusConfig) -> CommandDispatcher {
        CommandDispatcher::new(
            SecurityValidator::new(config.shared_policy()),
            config.timeout_manager().unwrap(),
            Arc::new(ServerStats::new()),
            "/tmp/janus/test.sock",
        )
    }

    fn dispatcher() -> CommandDispatcher {
        dispatcher_with(&JanusConfig::default())
    }

    #[test]
    fn test_builtins_present() {
        let d = dispatcher();
        for name in ["ping", "echo", "get_info", "validate", "slow_process", "manifest"] {
            assert!(d.has_handler(name), "missing {name}");
        }
        assert_eq!(d.handler_names().len(), 6);
    }

    #[test]
    fn test_reserved_names_rejected() {
        let d = dispatcher();
        let err = d
            .register("ping", sync_handler(|_| Ok(json!("hijacked"))))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ReservedHandlerName);
        assert_eq!(d.unregister("manifest").unwrap_err().code, ErrorCode::ReservedHandlerName);
    }

    #[test]
    fn test_register_rules() {
        let d = dispatcher();
        d.register("add", sync_handler(|_| Ok(json!(0)))).unwrap();
        assert!(d.has_handler("add"));
        assert_eq!(
            d.register("add", sync_handler(|_| Ok(json!(1)))).unwrap_err().code,
            ErrorCode::ValidationFailed
        );
        assert_eq!(
            d.register("bad name", sync_handler(|_| Ok(json!(1)))).unwrap_err().code,
            ErrorCode::ValidationFailed
        );
        d.unregister("add").unwrap();
        assert_eq!(d.unregister("add").unwrap_err().code, ErrorCode::HandlerNotFound);
    }

    #[tokio::test]
    async fn test_ping_still_answers_after_rejected_registration() {
        let d = dispatcher();
        let _ = d.register("ping", sync_handler(|_| Ok(json!("hijacked"))));
        let response = d.dispatch(Request::new("default", "ping", None)).await;
        assert!(response.success);
        assert_eq!(response.result.unwrap()["pong"], json!(true));
    }

    #[tokio::test]
    async fn test_custom_handler_result_and_error() {
        let d = dispatcher();
        d.register(
            "double",
            handler_fn(|request: Request| async move {
                match request.arg("n").and_then(Value::as_i64) {
                    Some(n) => Ok(json!(n * 2)),
                    None => Err(StructuredError::new(ErrorCode::InvalidArgument, "n is required")
                        .with_field("n")),
                }
            }),
        )
        .unwrap();

        let mut args = serde_json::Map::new();
        args.insert("n".to_string(), json!(21));
        let ok = d.dispatch(Request::new("default", "double", Some(args))).await;
        assert_eq!(ok.result, Some(json!(42)));

        let failed = d.dispatch(Request::new("default", "double", None)).await;
        assert!(!failed.success);
        assert_eq!(failed.error.unwrap().field.as_deref(), Some("n"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let response = dispatcher().dispatch(Request::new("default", "frobnicate", None)).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::HandlerNotFound);
    }

    #[tokio::test]
    async fn test_validation_happens_before_lookup() {
        let response = dispatcher().dispatch(Request::new("../etc", "frobnicate", None)).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::PathTraversalAttempt);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_internal_error() {
        let d = dispatcher();
        d.register(
            "explode",
            sync_handler(|_| -> Result<Value, StructuredError> { panic!("boom") }),
        )
        .unwrap();
        let response = d.dispatch(Request::new("default", "explode", None)).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InternalError);
        assert_eq!(d.active_handlers(), 0);
    }

    #[tokio::test]
    async fn test_handler_timeout() {
        let mut config = JanusConfig::default();
        config.timeouts.handler = 100;
        let d = dispatcher_with(&config);
        let mut args = serde_json::Map::new();
        args.insert("delay_ms".to_string(), json!(1_000));
        let response = d.dispatch(Request::new("default", "slow_process", Some(args))).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::HandlerTimeout);
    }

    #[tokio::test]
    async fn test_handler_ceiling() {
        let mut config = JanusConfig::default();
        config.limits.max_concurrent_handlers = 1;
        let d = Arc::new(dispatcher_with(&config));
        d.register(
            "block",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, StructuredError>(Value::Null)
            }),
        )
        .unwrap();

        let first = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(Request::new("default", "block", None)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(d.active_handlers(), 1);
        let second = d.dispatch(Request::new("default", "ping", None)).await;
        let error = second.error.unwrap();
        assert_eq!(error.code, ErrorCode::ResourceLimitExceeded);
        assert_eq!(error.field.as_deref(), Some("concurrent_handlers"));
        assert!(first.await.unwrap().success);
    }

    #[tokio::test]
    async fn test_manifest_checks_arguments() {
        let d = dispatcher();
        d.register("reserve", sync_handler(|_| Ok(json!("ok")))).unwrap();
        d.set_manifest(
            Manifest::from_value(json!({
                "version": "3.0.0",
                "channels": { "default": { "commands": { "reserve": { "args": {
                    "sku": { "type": "string", "required": true }
                } } } } }
            }))
            .unwrap(),
        )
        .unwrap();

        let response = d.dispatch(Request::new("default", "reserve", None)).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::ValidationFailed);
        assert_eq!(d.manifest().version, "3.0.0");
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(RequestStage::HandlerTimedOut.to_string(), "handler_timed_out");
    }
}
