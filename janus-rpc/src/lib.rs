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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Janus RPC
//!
//! A connectionless request/response engine over Unix datagram sockets.
//! A caller sends one self-contained datagram naming an operation; the server
//! validates it, runs the registered handler and sends exactly one correlated
//! reply to the caller's ephemeral reply-to socket.
//!
//! ## Key Concepts
//!
//! - **Requests and responses**: single JSON documents, one per datagram,
//!   matched purely by identifier.
//! - **Reply-to sockets**: each call binds its own temporary socket, released
//!   on every exit path.
//! - **Bilateral timeouts**: the client's command timeout and the server's
//!   handler timeout are independent.
//! - **Built-ins**: `ping`, `echo`, `get_info`, `validate`, `slow_process` and
//!   `manifest` are always available and cannot be replaced.
//! - **Structured errors**: every failure is a [`StructuredError`] with a
//!   closed [`ErrorCode`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use janus_rpc::prelude::*;
//!
//! let mut config = JanusConfig::default();
//! config.socket.path = Some("/tmp/janus/server.sock".into());
//!
//! let server = JanusServer::new(config.clone())?;
//! server.register_handler("add", sync_handler(|req| {
//!     let a = req.arg("a").and_then(Value::as_i64).unwrap_or(0);
//!     let b = req.arg("b").and_then(Value::as_i64).unwrap_or(0);
//!     Ok(json!(a + b))
//! }))?;
//! let handle = server.start()?;
//!
//! let client = JanusClient::new("/tmp/janus/server.sock", "default", config)?;
//! let sum = client.call("add", Some(args), None).await?;
//!
//! handle.shutdown().await;
//! ```

/// Internal components of the engine.
pub(crate) mod common;

pub use common::{
    handler_fn, socket_is_alive, sync_handler, ArgumentSpec, ArgumentType, Args, BuiltinCommand,
    Capacity, ChannelSpec, CommandDispatcher, CommandSpec, CorrelationHandle, CorrelationState,
    CorrelationToken, EphemeralSocket, ErrorCategory, ErrorCode, FnHandler, Handler, JanusClient,
    JanusConfig, JanusServer, LimitsConfig, Manifest, Message, MessageCodec, ProtocolConfig,
    RateLimitConfig, RateLimiter, Request, RequestHandle, RequestPhase, RequestStage, Response,
    ResponseCorrelator, SecurityConfig, SecurityPolicy, SecurityValidator, ServerHandle,
    ServerSocket, ServerStats, ShutdownConfig, ShutdownReport, SocketConfig,
    SocketLifecycleManager, StatsSnapshot, StructuredError, SyncHandler, TimeoutManager,
    TimeoutsConfig, DEFAULT_TIMEOUT, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT, MIN_TIMEOUT,
};

/// A prelude module for conveniently importing the most commonly used items.
///
/// # Re-exports
///
/// ## External Crates
/// *   [`async_trait::async_trait`](https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html):
///     the macro for implementing [`Handler`](crate::Handler) by hand.
/// *   [`serde_json::json`] and [`serde_json::Value`]: building and reading arguments and results.
///
/// ## Core Types
/// *   [`crate::JanusServer`] and [`crate::ServerHandle`]: the listening side.
/// *   [`crate::JanusClient`] and [`crate::RequestHandle`]: the calling side.
/// *   [`crate::JanusConfig`]: configuration.
/// *   [`crate::Handler`], [`crate::handler_fn`], [`crate::sync_handler`]: custom handlers.
/// *   [`crate::Manifest`]: argument descriptions.
/// *   [`crate::Request`], [`crate::Response`], [`crate::StructuredError`], [`crate::ErrorCode`]: wire types.
pub mod prelude {
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};

    pub use crate::common::{
        handler_fn, sync_handler, Args, ErrorCode, Handler, JanusClient, JanusConfig, JanusServer,
        Manifest, Request, RequestHandle, Response, ServerHandle, StructuredError,
    };
}
