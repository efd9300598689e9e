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

//! Socket lifecycle: the server's listening socket and per-request reply sockets.
//!
//! Both socket kinds own their filesystem entry and remove it on drop, so a
//! reply socket is released on every exit path of a request, including
//! timeouts and early returns.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UnixDatagram;
use tracing::{debug, info, trace, warn};

use super::config::SocketConfig;
use super::security::SecurityValidator;
use super::types::{ErrorCode, StructuredError};

const BIND_ATTEMPTS: usize = 3;

/// Returns `true` if some process has a datagram socket bound at `path`.
#[must_use]
pub fn socket_is_alive(path: &Path) -> bool {
    std::os::unix::net::UnixDatagram::unbound()
        .and_then(|peer| peer.connect(path))
        .is_ok()
}

fn path_str(path: &Path) -> Result<&str, StructuredError> {
    path.to_str().ok_or_else(|| {
        StructuredError::new(ErrorCode::InvalidSocketPath, "Socket path is not valid UTF-8")
            .with_field("socket_path")
    })
}

fn bind_error(path: &Path, err: &io::Error) -> StructuredError {
    StructuredError::new(
        ErrorCode::SocketError,
        format!("Failed to bind socket at {}: {}", path.display(), err),
    )
    .with_field("socket_path")
    .with_details(format!("{:?}", err.kind()))
}

/// Creates, binds and releases sockets according to `[socket]` settings.
#[derive(Debug, Clone)]
pub struct SocketLifecycleManager {
    config: SocketConfig,
    validator: SecurityValidator,
}

impl SocketLifecycleManager {
    /// Creates a manager.
    #[must_use]
    pub const fn new(config: SocketConfig, validator: SecurityValidator) -> Self {
        Self { config, validator }
    }

    /// Binds the server's listening socket.
    ///
    /// Refuses to replace a live socket or any file that is not a socket. A
    /// stale socket is removed first when `cleanup_on_start` is set.
    ///
    /// # Errors
    ///
    /// Path validation failures, [`ErrorCode::ResourceLimitExceeded`] if the
    /// path is held by a live socket, [`ErrorCode::SocketError`] if it is held
    /// by something else or on I/O failure.
    pub fn bind_server(&self, path: &Path) -> Result<ServerSocket, StructuredError> {
        self.validator.validate_socket_path(path_str(path)?)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StructuredError::new(
                    ErrorCode::SocketError,
                    format!("Failed to create socket directory {}: {}", parent.display(), e),
                )
            })?;
        }

        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                return Err(StructuredError::new(
                    ErrorCode::SocketError,
                    format!("{} exists and is not a socket", path.display()),
                )
                .with_field("socket_path"));
            }
            if socket_is_alive(path) {
                return Err(StructuredError::new(
                    ErrorCode::ResourceLimitExceeded,
                    format!("Another server is already bound at {}", path.display()),
                )
                .with_field("socket_path"));
            }
            if self.config.cleanup_on_start {
                warn!("Removing stale socket: {}", path.display());
                std::fs::remove_file(path).map_err(|e| {
                    StructuredError::new(
                        ErrorCode::SocketError,
                        format!("Failed to remove stale socket {}: {}", path.display(), e),
                    )
                })?;
            }
        }

        let socket = UnixDatagram::bind(path).map_err(|e| bind_error(path, &e))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(self.config.mode);
            std::fs::set_permissions(path, perms).map_err(|e| {
                StructuredError::new(
                    ErrorCode::SocketError,
                    format!("Failed to set socket permissions on {}: {}", path.display(), e),
                )
            })?;
        }

        info!("Server socket bound at: {}", path.display());
        Ok(ServerSocket {
            socket: Arc::new(socket),
            path: path.to_path_buf(),
            cleanup_on_shutdown: self.config.cleanup_on_shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// A fresh, unique path under `reply_dir`.
    #[must_use]
    pub fn unique_reply_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.config.reply_dir.join(format!(
            "janus_client_{}_{}_{:016x}.sock",
            std::process::id(),
            nanos,
            rand::random::<u64>()
        ))
    }

    /// Binds a reply-to socket at a fresh path.
    ///
    /// # Errors
    ///
    /// Path validation failures or [`ErrorCode::SocketError`].
    pub fn bind_ephemeral(&self) -> Result<EphemeralSocket, StructuredError> {
        let mut last_error = None;
        for _ in 0..BIND_ATTEMPTS {
            let path = self.unique_reply_path();
            let reply_to = path_str(&path)?.to_string();
            self.validator.validate_socket_path(&reply_to)?;

            match UnixDatagram::bind(&path) {
                Ok(socket) => {
                    trace!("Reply socket bound at: {}", reply_to);
                    return Ok(EphemeralSocket {
                        socket,
                        path,
                        reply_to,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("Reply path collision at {}, retrying", reply_to);
                    last_error = Some(bind_error(&path, &e));
                }
                Err(e) => return Err(bind_error(&path, &e)),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            StructuredError::new(ErrorCode::SocketError, "Failed to bind a reply socket")
        }))
    }
}

/// The server's persistent listening socket.
#[derive(Debug)]
pub struct ServerSocket {
    socket: Arc<UnixDatagram>,
    path: PathBuf,
    cleanup_on_shutdown: bool,
    closed: AtomicBool,
}

impl ServerSocket {
    /// Shared handle for receiving and replying.
    #[must_use]
    pub fn socket(&self) -> Arc<UnixDatagram> {
        Arc::clone(&self.socket)
    }

    /// Where the socket is bound.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the filesystem entry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) || !self.cleanup_on_shutdown {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Socket file removed: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket file on shutdown: {}", e),
        }
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// A client's single-use reply-to socket.
#[derive(Debug)]
pub struct EphemeralSocket {
    socket: UnixDatagram,
    path: PathBuf,
    reply_to: String,
}

impl EphemeralSocket {
    /// The value to put in a request's `reply_to`.
    #[must_use]
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Where the socket is bound.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The bound socket.
    #[must_use]
    pub const fn socket(&self) -> &UnixDatagram {
        &self.socket
    }
}

impl Drop for EphemeralSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => trace!("Reply socket removed: {}", self.reply_to),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove reply socket {}: {}", self.reply_to, e),
        }
    }
}
