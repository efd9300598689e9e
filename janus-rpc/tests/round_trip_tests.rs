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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use janus_rpc::prelude::*;
use janus_rpc::{BuiltinCommand, JanusClient};

use crate::setup::*;

mod setup;

fn args(value: Value) -> Option<Args> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[tokio::test]
async fn test_ping_round_trip_correlates_by_id() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let handle = client.submit("ping", None, None).await?;
    let token = handle.token().to_string();
    let response = handle.response().await?;

    assert!(response.success);
    assert_eq!(response.request_id, token);
    let result = response.result.expect("ping returns a result");
    assert_eq!(result["pong"], true);
    assert!(result["timestamp"].is_string());
    assert!(client.ping().await);
    assert_eq!(client.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_echo_applies_transform() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let result = client
        .call(
            "echo",
            args(json!({ "message": "Hello", "transform": "uppercase" })),
            None,
        )
        .await?;
    assert_eq!(result["echo"], "HELLO");
    assert_eq!(result["original_length"], 5);
    assert_eq!(result["transform_applied"], "uppercase");

    let err = client
        .call(
            "echo",
            args(json!({ "message": "Hello", "transform": "sideways" })),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert_eq!(err.field.as_deref(), Some("transform"));
    Ok(())
}

#[tokio::test]
async fn test_get_info_reports_server() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let info = client.call("get_info", None, None).await?;
    assert_eq!(info["implementation"], "janus-rpc");
    assert_eq!(info["protocol"], "SOCK_DGRAM");
    assert_eq!(
        info["socket_path"].as_str(),
        fixture.socket_path().to_str()
    );
    let handlers: Vec<&str> = info["handlers"]
        .as_array()
        .expect("handler list")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    for builtin in BuiltinCommand::ALL {
        assert!(handlers.contains(&builtin.as_str()));
    }
    assert!(info["stats"]["requests_received"].as_u64().unwrap_or(0) >= 1);
    Ok(())
}

#[tokio::test]
async fn test_manifest_returned_unwrapped() -> anyhow::Result<()> {
    let fixture = Fixture::start_with(
        |_| {},
        |server| {
            let manifest = Manifest::from_value(json!({
                "version": "2.1.0",
                "name": "calculator",
                "channels": {
                    "test": {
                        "commands": {
                            "add": {
                                "args": {
                                    "a": { "type": "integer", "required": true },
                                    "b": { "type": "integer", "required": true }
                                }
                            }
                        }
                    }
                }
            }))?;
            server.set_manifest(manifest)?;
            Ok(())
        },
    )?;
    let client = fixture.client()?;

    let manifest = client.call("manifest", None, None).await?;
    assert_eq!(manifest["version"], "2.1.0");
    assert!(manifest.get("manifest").is_none());
    assert!(manifest["channels"]["test"]["commands"]["add"].is_object());
    Ok(())
}

#[tokio::test]
async fn test_validate_reports_bad_json() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let ok = client
        .call("validate", args(json!({ "message": "{\"a\": 1}" })), None)
        .await?;
    assert_eq!(ok["valid"], true);

    let bad = client
        .call("validate", args(json!({ "message": "{not json" })), None)
        .await?;
    assert_eq!(bad["valid"], false);
    assert_eq!(bad["errors"][0]["code"], "PROTOCOL_VIOLATION");
    Ok(())
}

#[tokio::test]
async fn test_slow_process_completes_within_timeout() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let result = client
        .call(
            "slow_process",
            args(json!({ "delay_ms": 150, "message": "later" })),
            Some(Duration::from_secs(5)),
        )
        .await?;
    assert_eq!(result["processed"], true);
    assert_eq!(result["delay_ms"], 150);
    assert_eq!(result["message"], "later");
    Ok(())
}

#[tokio::test]
async fn test_custom_handler_and_manifest_checks() -> anyhow::Result<()> {
    let fixture = Fixture::start_with(
        |_| {},
        |server| {
            server.register_handler(
                "add",
                sync_handler(|request: &Request| {
                    let a = request.arg("a").and_then(Value::as_i64).unwrap_or(0);
                    let b = request.arg("b").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!({ "sum": a + b }))
                }),
            )?;
            let manifest = Manifest::from_value(json!({
                "version": "1.0.0",
                "channels": {
                    "test": {
                        "commands": {
                            "add": {
                                "args": {
                                    "a": { "type": "integer", "required": true },
                                    "b": { "type": "integer", "required": true }
                                }
                            }
                        }
                    }
                }
            }))?;
            server.set_manifest(manifest)?;
            Ok(())
        },
    )?;
    let client = fixture.client()?;

    let result = client
        .call("add", args(json!({ "a": 2, "b": 40 })), None)
        .await?;
    assert_eq!(result["sum"], 42);

    let response = client
        .send_request("add", args(json!({ "a": 2 })), None)
        .await?;
    assert!(!response.success);
    let error = response.error.expect("missing argument error");
    assert_eq!(error.code, ErrorCode::ValidationFailed);
    assert_eq!(error.field.as_deref(), Some("b"));

    let err = client
        .call("add", args(json!({ "a": "two", "b": 1 })), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn test_builtin_names_are_reserved() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;

    let err = fixture
        .handle
        .dispatcher()
        .register("ping", sync_handler(|_| Ok(json!("shadowed"))))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ReservedHandlerName);
    let err = fixture.handle.dispatcher().unregister("echo").unwrap_err();
    assert_eq!(err.code, ErrorCode::ReservedHandlerName);

    let client = fixture.client()?;
    let result = client.call("ping", None, None).await?;
    assert_eq!(result["pong"], true);
    Ok(())
}

#[tokio::test]
async fn test_handlers_registered_while_running() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let err = client.call("late", None, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::HandlerNotFound);

    fixture
        .handle
        .dispatcher()
        .register("late", sync_handler(|_| Ok(json!("here"))))?;
    assert_eq!(client.call("late", None, None).await?, json!("here"));

    fixture.handle.dispatcher().unregister("late")?;
    let err = client.call("late", None, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::HandlerNotFound);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_each_get_their_reply() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;

    let calls = (0..16).map(|i| {
        let client = client.clone();
        async move {
            let message = format!("message-{i}");
            let result = client
                .call("echo", args(json!({ "message": message })), None)
                .await;
            (message, result)
        }
    });

    for (message, result) in futures::future::join_all(calls).await {
        let result = result?;
        assert_eq!(result["echo"], Value::String(message));
    }
    assert_eq!(client.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_runs_handler() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let fixture = Fixture::start_with(
        |_| {},
        move |server| {
            server.register_handler(
                "count",
                sync_handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }),
            )?;
            Ok(())
        },
    )?;
    let client = fixture.client()?;

    client.send_no_reply("count", None).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while hits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.handle.stats().responses_sent(), 0);
    Ok(())
}

#[tokio::test]
async fn test_async_handler_result() -> anyhow::Result<()> {
    let fixture = Fixture::start_with(
        |_| {},
        |server| {
            server.register_handler(
                "greet",
                handler_fn(|request: Request| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let name = request.str_arg("name").unwrap_or("stranger").to_string();
                    Ok::<_, StructuredError>(json!(format!("hello, {name}")))
                }),
            )?;
            Ok(())
        },
    )?;
    let client = fixture.client()?;

    let result = client
        .call("greet", args(json!({ "name": "janus" })), None)
        .await?;
    assert_eq!(result, json!("hello, janus"));
    Ok(())
}

#[tokio::test]
async fn test_legacy_field_names_round_trip() -> anyhow::Result<()> {
    let fixture = Fixture::start_with(|config| config.protocol.legacy_field_names = true, |_| Ok(()))?;
    let client = JanusClient::new(fixture.socket_path(), "test", fixture.config.clone())?;

    let result = client.call("ping", None, None).await?;
    assert_eq!(result["pong"], true);
    Ok(())
}
