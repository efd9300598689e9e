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
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use janus_rpc::{JanusClient, JanusConfig, JanusServer, ServerHandle};
use tempfile::TempDir;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Ensures tracing initialization happens only once across all tests.
static INIT: Once = Once::new();

/// Initializes the global tracing subscriber for tests, writing to
/// `logs/janus_tests.txt`.
pub fn initialize_tracing() {
    INIT.call_once(|| {
        std::fs::create_dir_all("logs").expect("could not create logs dir");

        let file_appender = RollingFileAppender::new(Rotation::NEVER, "logs", "janus_tests.txt");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard so the non-blocking writer is not dropped before process exit
        Box::leak(Box::new(guard));

        let filter = EnvFilter::new("trace")
            .add_directive("janus_rpc=trace".parse().unwrap())
            .add_directive("round_trip_tests=trace".parse().unwrap())
            .add_directive("resilience_tests=trace".parse().unwrap())
            .add_directive("tokio=info".parse().unwrap())
            .add_directive(tracing_subscriber::filter::LevelFilter::TRACE.into());

        let subscriber = FmtSubscriber::builder()
            .with_span_events(FmtSpan::NONE)
            .with_max_level(Level::TRACE)
            .compact()
            .with_line_number(true)
            .without_time()
            .with_target(true)
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// A scratch directory under `/tmp`, inside the default allow-list.
pub fn scratch_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("janus")
        .tempdir_in("/tmp")
        .expect("could not create scratch dir")
}

/// Default configuration listening inside `dir`.
pub fn config_in(dir: &Path) -> JanusConfig {
    let mut config = JanusConfig::default();
    config.socket.path = Some(dir.join("server.sock"));
    config
}

/// A running server plus the directory that holds its socket.
pub struct Fixture {
    pub dir: TempDir,
    pub config: JanusConfig,
    pub handle: ServerHandle,
}

impl Fixture {
    /// Starts a server with default configuration.
    pub fn start() -> anyhow::Result<Self> {
        Self::start_with(|_| {}, |_| Ok(()))
    }

    /// Starts a server after adjusting its configuration and registering handlers.
    pub fn start_with(
        configure: impl FnOnce(&mut JanusConfig),
        register: impl FnOnce(&JanusServer) -> anyhow::Result<()>,
    ) -> anyhow::Result<Self> {
        initialize_tracing();
        let dir = scratch_dir();
        let mut config = config_in(dir.path());
        configure(&mut config);
        let server = JanusServer::new(config.clone())?;
        register(&server)?;
        let handle = server.start()?;
        Ok(Self {
            dir,
            config,
            handle,
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.handle.socket_path().to_path_buf()
    }

    /// A client on the `test` channel.
    pub fn client(&self) -> anyhow::Result<JanusClient> {
        Ok(JanusClient::new(
            self.socket_path(),
            "test",
            self.config.clone(),
        )?)
    }
}

/// Reply sockets this process left behind in `/tmp`.
pub fn leftover_reply_sockets() -> usize {
    let prefix = format!("janus_client_{}_", std::process::id());
    std::fs::read_dir("/tmp")
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
                .count()
        })
        .unwrap_or(0)
}
