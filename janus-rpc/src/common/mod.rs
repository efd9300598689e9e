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

//! Engine internals.
//!
//! # Key Components
//!
//! * [`MessageCodec`]: one JSON document per datagram, with size and encoding
//!   checks ahead of parsing.
//!
//! * [`SecurityValidator`]: independent rules for socket paths, names,
//!   identifiers and argument payloads.
//!
//! * [`SocketLifecycleManager`]: binds the server socket and the per-call
//!   reply sockets, and removes their files.
//!
//! * [`TimeoutManager`]: the client's command deadline and the server's
//!   handler deadline.
//!
//! * [`ResponseCorrelator`]: exactly-once delivery of a reply to its caller.
//!
//! * [`CommandDispatcher`]: handler registry with reserved built-ins.
//!
//! * [`JanusServer`] / [`JanusClient`]: the two ends of the wire.

pub use builtins::BuiltinCommand;
pub use client::{JanusClient, RequestHandle, RequestPhase};
pub use codec::MessageCodec;
pub use config::{
    JanusConfig, LimitsConfig, ProtocolConfig, RateLimitConfig, SecurityConfig, SecurityPolicy,
    ShutdownConfig, SocketConfig, TimeoutsConfig,
};
pub use correlator::{CorrelationHandle, CorrelationState, ResponseCorrelator};
pub use dispatcher::{
    handler_fn, sync_handler, CommandDispatcher, FnHandler, Handler, RequestStage, SyncHandler,
};
pub use manifest::{ArgumentSpec, ArgumentType, ChannelSpec, CommandSpec, Manifest};
pub use rate_limiter::RateLimiter;
pub use security::{Capacity, SecurityValidator};
pub use server::{JanusServer, ServerHandle, ServerStats, ShutdownReport, StatsSnapshot};
pub use socket::{socket_is_alive, EphemeralSocket, ServerSocket, SocketLifecycleManager};
pub use timeout::{TimeoutManager, DEFAULT_TIMEOUT, MAX_TIMEOUT, MIN_TIMEOUT};
pub use types::{
    Args, CorrelationToken, ErrorCategory, ErrorCode, Message, Request, Response,
    StructuredError, DEFAULT_TIMEOUT_SECS,
};

/// Reserved commands answered by every server.
mod builtins;

/// Client: reply sockets, sending and waiting.
mod client;

/// Datagram encoding and structural decoding.
mod codec;

/// Configuration with XDG-compliant loading.
mod config;

/// Exactly-once response correlation.
mod correlator;

/// Handler registry and execution pipeline.
mod dispatcher;

/// Channel/command descriptions for argument checks.
mod manifest;

/// Server-wide token bucket.
mod rate_limiter;

/// Path, name and payload rules.
mod security;

/// Receive loop and server lifecycle.
mod server;

/// Server and reply socket lifecycle.
mod socket;

/// Command and handler deadlines.
mod timeout;

/// Wire types: [`Request`], [`Response`], [`StructuredError`].
mod types;
