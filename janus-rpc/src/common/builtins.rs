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

//! The reserved commands every server answers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::manifest::Manifest;
use super::security::SecurityValidator;
use super::server::StatsSnapshot;
use super::timeout::MAX_TIMEOUT;
use super::types::{ErrorCode, Request, StructuredError};

const DEFAULT_SLOW_DELAY_MS: u64 = 2_000;

/// Built-in command names. None of them can be registered or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCommand {
    /// Liveness check.
    Ping,
    /// Returns the submitted arguments.
    Echo,
    /// Server metadata.
    GetInfo,
    /// Checks arguments without running anything.
    Validate,
    /// Replies after a delay.
    SlowProcess,
    /// Returns the attached manifest.
    Manifest,
}

impl BuiltinCommand {
    /// Every built-in, in registration order.
    pub const ALL: [Self; 6] = [
        Self::Ping,
        Self::Echo,
        Self::GetInfo,
        Self::Validate,
        Self::SlowProcess,
        Self::Manifest,
    ];

    /// The command name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Echo => "echo",
            Self::GetInfo => "get_info",
            Self::Validate => "validate",
            Self::SlowProcess => "slow_process",
            Self::Manifest => "manifest",
        }
    }

    /// Parses a command name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == name)
    }
}

/// Server state visible to built-ins, captured when the request is dispatched.
#[derive(Debug, Clone)]
pub(crate) struct BuiltinContext {
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) validator: SecurityValidator,
    pub(crate) socket_path: String,
    pub(crate) uptime: Duration,
    pub(crate) handlers: Vec<String>,
    pub(crate) stats: StatsSnapshot,
}

pub(crate) async fn run(
    command: BuiltinCommand,
    request: Request,
    context: BuiltinContext,
) -> Result<Value, StructuredError> {
    match command {
        BuiltinCommand::Ping => Ok(ping(&request)),
        BuiltinCommand::Echo => echo(&request),
        BuiltinCommand::GetInfo => Ok(get_info(&context)),
        BuiltinCommand::Validate => Ok(validate(&request, &context)),
        BuiltinCommand::SlowProcess => slow_process(&request).await,
        BuiltinCommand::Manifest => Ok(serde_json::to_value(&*context.manifest)?),
    }
}

fn ping(request: &Request) -> Value {
    let mut result = json!({
        "pong": true,
        "status": "pong",
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(message) = request.arg("message") {
        result["echo"] = message.clone();
    }
    result
}

fn echo(request: &Request) -> Result<Value, StructuredError> {
    let Some(message) = request.arg("message") else {
        return Ok(json!({ "echo": request.args.clone().unwrap_or_default() }));
    };

    let Some(transform) = request.str_arg("transform") else {
        let mut result = json!({ "echo": message });
        if let Some(text) = message.as_str() {
            result["original_length"] = json!(text.chars().count());
        }
        return Ok(result);
    };

    let Some(text) = message.as_str() else {
        return Err(StructuredError::new(
            ErrorCode::InvalidArgument,
            "A transform can only be applied to a string message",
        )
        .with_field("message"));
    };
    let echoed: String = match transform {
        "uppercase" => text.to_uppercase(),
        "lowercase" => text.to_lowercase(),
        "reverse" => text.chars().rev().collect(),
        other => {
            return Err(StructuredError::new(
                ErrorCode::InvalidArgument,
                format!("Unknown transform '{other}'"),
            )
            .with_field("transform")
            .with_value(other)
            .with_constraints(json!({ "enum": ["uppercase", "lowercase", "reverse"] })));
        }
    };
    Ok(json!({
        "echo": echoed,
        "original_length": text.chars().count(),
        "transform_applied": transform,
    }))
}

fn get_info(context: &BuiltinContext) -> Value {
    json!({
        "implementation": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "SOCK_DGRAM",
        "socket_path": context.socket_path,
        "uptime_secs": context.uptime.as_secs_f64(),
        "handlers": context.handlers,
        "stats": context.stats,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn validate(request: &Request, context: &BuiltinContext) -> Value {
    let empty = Map::new();
    let args = request.args.as_ref().unwrap_or(&empty);
    let mut errors = Vec::new();

    if let Err(e) = context.validator.validate_args(args) {
        errors.push(e);
    }

    if let Some(Value::String(message)) = args.get("message") {
        if let Err(e) = serde_json::from_str::<Value>(message) {
            errors.push(
                StructuredError::protocol_violation(format!("message is not valid JSON: {e}"))
                    .with_field("message"),
            );
        }
    }

    if let Some(target) = args.get("target_request").and_then(Value::as_str) {
        let target_args = match args.get("target_args") {
            Some(Value::Object(map)) => Some(map),
            Some(Value::Null) | None => None,
            Some(_) => {
                errors.push(
                    StructuredError::new(ErrorCode::InvalidArgument, "target_args must be an object")
                        .with_field("target_args"),
                );
                None
            }
        };
        if let Err(e) = context
            .manifest
            .validate_arguments(&request.channel_id, target, target_args)
        {
            errors.push(e);
        }
    }

    json!({
        "valid": errors.is_empty(),
        "validated_fields": args.keys().collect::<Vec<_>>(),
        "errors": errors,
    })
}

async fn slow_process(request: &Request) -> Result<Value, StructuredError> {
    let delay_ms = match request.arg("delay_ms") {
        None | Some(Value::Null) => DEFAULT_SLOW_DELAY_MS,
        Some(value) => value.as_u64().ok_or_else(|| {
            StructuredError::new(ErrorCode::InvalidArgument, "delay_ms must be a non-negative integer")
                .with_field("delay_ms")
                .with_value(value.clone())
        })?,
    };
    let max_ms = u64::try_from(MAX_TIMEOUT.as_millis()).unwrap_or(u64::MAX);
    let delay_ms = delay_ms.min(max_ms);

    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let mut result = json!({ "processed": true, "delay_ms": delay_ms });
    if let Some(message) = request.arg("message") {
        result["message"] = message.clone();
    }
    Ok(result)
}
