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

//! Starts a server with one custom handler, calls it and a few built-ins
//! from a client in the same process, then shuts down.
//!
//! ```sh
//! RUST_LOG=janus_rpc=debug cargo run --example echo_server
//! ```

use std::time::Duration;

use janus_rpc::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let dir = std::path::Path::new("/tmp").join(format!("janus_demo_{}", std::process::id()));
    let mut config = JanusConfig::default();
    config.socket.path = Some(dir.join("server.sock"));

    let server = JanusServer::new(config.clone())?;
    server.register_handler(
        "word_count",
        handler_fn(|request: Request| async move {
            let text = request.str_arg("text").unwrap_or_default();
            Ok::<_, StructuredError>(json!({ "words": text.split_whitespace().count() }))
        }),
    )?;
    let handle = server.start()?;

    let client = JanusClient::new(handle.socket_path(), "demo", config)?;
    println!("ping: {}", client.ping().await);

    let mut args = Args::new();
    args.insert("message".into(), json!("Hello, Janus"));
    args.insert("transform".into(), json!("reverse"));
    let echoed = client.call("echo", Some(args), None).await?;
    println!("echo: {echoed}");

    let mut args = Args::new();
    args.insert("text".into(), json!("one datagram per request"));
    let counted = client
        .call("word_count", Some(args), Some(Duration::from_secs(2)))
        .await?;
    println!("word_count: {counted}");

    let manifest = client.call("manifest", None, None).await?;
    println!("manifest version: {}", manifest["version"]);

    let report = handle.shutdown().await;
    println!(
        "served {} requests, drained: {}",
        report.stats.responses_sent, report.drained
    );
    let _ = std::fs::remove_dir(&dir);
    Ok(())
}
