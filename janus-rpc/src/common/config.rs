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

//! Engine configuration with XDG-compliant file loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::timeout::TimeoutManager;
use super::types::{ErrorCode, StructuredError};

/// Configuration for the datagram RPC engine.
///
/// # XDG Compliance
///
/// [`JanusConfig::load`] reads `$XDG_CONFIG_HOME/janus/config.toml` and falls
/// back to defaults when the file is missing or malformed.
///
/// # Example Configuration File
///
/// ```toml
/// [socket]
/// path = "/tmp/janus/server.sock"
/// mode = 0o660
/// cleanup_on_start = true
/// cleanup_on_shutdown = true
/// reply_dir = "/tmp"
///
/// [limits]
/// max_message_size = 10485760  # 10 MiB
/// max_args_size = 5242880      # 5 MiB
/// max_concurrent_handlers = 100
/// max_pending_correlations = 1000
///
/// [security]
/// allowed_directories = ["/tmp/", "/var/run/"]
///
/// [timeouts]
/// command_timeout_ms = 30000
/// handler_timeout_ms = 30000
///
/// [rate_limit]
/// enabled = true
/// requests_per_second = 1000
/// burst_size = 200
///
/// [protocol]
/// legacy_field_names = false
///
/// [shutdown]
/// drain_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JanusConfig {
    /// Socket locations and lifecycle switches.
    pub socket: SocketConfig,
    /// Size, length and concurrency ceilings.
    pub limits: LimitsConfig,
    /// Path allow-list.
    pub security: SecurityConfig,
    /// Client and handler deadlines.
    pub timeouts: TimeoutsConfig,
    /// Inbound request throttling.
    pub rate_limit: RateLimitConfig,
    /// Wire compatibility switches.
    pub protocol: ProtocolConfig,
    /// Graceful shutdown.
    pub shutdown: ShutdownConfig,
}

/// Socket-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Path of the server's listening socket.
    ///
    /// If `None`, defaults to `$XDG_RUNTIME_DIR/janus/server.sock`, or
    /// `/tmp/janus/server.sock` when the runtime directory is unset.
    pub path: Option<PathBuf>,

    /// Socket file permissions. Default is `0o660`.
    pub mode: u32,

    /// Remove a stale (unbound) socket file at `path` before binding.
    pub cleanup_on_start: bool,

    /// Remove the socket file when the server shuts down.
    pub cleanup_on_shutdown: bool,

    /// Directory where clients create their ephemeral reply-to sockets.
    pub reply_dir: PathBuf,
}

/// Size, length and concurrency ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum datagram size in bytes.
    pub max_message_size: usize,
    /// Maximum serialized size of a request's `args`.
    pub max_args_size: usize,
    /// Maximum length of `channelId`, `request` and `id`.
    pub max_name_length: usize,
    /// Maximum socket path length (the `sun_path` ceiling).
    pub max_socket_path_length: usize,
    /// Maximum nesting depth of `args`.
    pub max_json_depth: usize,
    /// Maximum inbound requests a server processes at once.
    pub max_connections: usize,
    /// Maximum handler invocations running at once.
    pub max_concurrent_handlers: usize,
    /// Maximum outstanding correlations per client.
    pub max_pending_correlations: usize,
}

/// Path allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Directories under which every socket path must reside.
    pub allowed_directories: Vec<String>,
}

/// Timeout configuration. All values are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// How long a client waits for a reply when the caller gives no timeout.
    #[serde(rename = "command_timeout_ms")]
    pub command: u64,

    /// How long the server waits on one handler invocation.
    #[serde(rename = "handler_timeout_ms")]
    pub handler: u64,
}

/// Token bucket settings for inbound requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Sustained refill rate.
    pub requests_per_second: u32,
    /// Bucket capacity.
    pub burst_size: u32,
}

/// Wire compatibility switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Speak the older `command` / `commandId` field names.
    pub legacy_field_names: bool,
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Maximum time in milliseconds to wait for in-flight requests.
    #[serde(rename = "drain_timeout_ms")]
    pub drain_timeout: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: None,
            mode: 0o660,
            cleanup_on_start: true,
            cleanup_on_shutdown: true,
            reply_dir: PathBuf::from("/tmp"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            max_args_size: 5 * 1024 * 1024,
            max_name_length: 256,
            max_socket_path_length: 108,
            max_json_depth: 64,
            max_connections: 100,
            max_concurrent_handlers: 100,
            max_pending_correlations: 1_000,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_directories: vec![
                "/tmp/".to_string(),
                "/var/tmp/".to_string(),
                "/var/run/".to_string(),
                "/run/".to_string(),
            ],
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            command: 30_000,
            handler: 30_000,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 1_000,
            burst_size: 200,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: 5_000,
        }
    }
}

/// Process-wide security limits, derived once from [`JanusConfig`] and
/// shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Maximum datagram size in bytes.
    pub max_message_size: usize,
    /// Maximum serialized size of `args`.
    pub max_args_size: usize,
    /// Maximum length of names and identifiers.
    pub max_name_length: usize,
    /// Maximum socket path length.
    pub max_socket_path_length: usize,
    /// Maximum nesting depth of `args`.
    pub max_json_depth: usize,
    /// Directories under which socket paths must reside.
    pub allowed_directories: Vec<String>,
    /// Maximum inbound requests in flight on a server.
    pub max_connections: usize,
    /// Maximum concurrent handler invocations.
    pub max_concurrent_handlers: usize,
    /// Maximum outstanding correlations per client.
    pub max_pending_correlations: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        JanusConfig::default().security_policy()
    }
}

impl JanusConfig {
    /// Load configuration from the XDG config directory.
    ///
    /// Attempts to read `$XDG_CONFIG_HOME/janus/config.toml` (usually
    /// `~/.config/janus/config.toml`). Missing or unreadable files yield the
    /// default configuration.
    #[must_use]
    pub fn load() -> Self {
        let xdg_dirs = match xdg::BaseDirectories::with_prefix("janus") {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to initialize XDG directories for janus config: {}", e);
                return Self::default();
            }
        };

        xdg_dirs.find_config_file("config.toml").map_or_else(
            || {
                info!("No janus configuration file found, using defaults");
                Self::default()
            },
            |path| match Self::load_from_path(&path) {
                Ok(config) => {
                    info!("Loaded janus configuration from: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Ignoring configuration file {}: {}", path.display(), e);
                    Self::default()
                }
            },
        )
    }

    /// Load and validate configuration from an explicit file.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationFailed`] if the file cannot be read or
    /// parsed, or if a value is out of range.
    pub fn load_from_path(path: &Path) -> Result<Self, StructuredError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StructuredError::new(
                ErrorCode::ValidationFailed,
                format!("Failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationFailed`] on parse errors or out-of-range
    /// values.
    pub fn from_toml_str(text: &str) -> Result<Self, StructuredError> {
        let config: Self = toml::from_str(text).map_err(|e| {
            StructuredError::new(ErrorCode::ValidationFailed, format!("Invalid configuration: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationFailed`] naming the offending key.
    pub fn validate(&self) -> Result<(), StructuredError> {
        let invalid = |field: &str, message: &str| {
            StructuredError::new(ErrorCode::ValidationFailed, message.to_string()).with_field(field)
        };

        TimeoutManager::check_range(self.command_timeout())
            .map_err(|e| invalid("timeouts.command_timeout_ms", &e.message))?;
        TimeoutManager::check_range(self.handler_timeout())
            .map_err(|e| invalid("timeouts.handler_timeout_ms", &e.message))?;

        if self.limits.max_args_size > self.limits.max_message_size {
            return Err(invalid(
                "limits.max_args_size",
                "max_args_size cannot exceed max_message_size",
            ));
        }
        if self.limits.max_concurrent_handlers == 0 || self.limits.max_connections == 0 {
            return Err(invalid("limits", "concurrency ceilings must be positive"));
        }
        if self.limits.max_pending_correlations == 0 {
            return Err(invalid(
                "limits.max_pending_correlations",
                "max_pending_correlations must be positive",
            ));
        }
        if self.security.allowed_directories.is_empty() {
            return Err(invalid(
                "security.allowed_directories",
                "at least one allowed directory is required",
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.burst_size == 0 {
            return Err(invalid("rate_limit.burst_size", "burst_size must be positive"));
        }
        Ok(())
    }

    /// Get the socket path for the server.
    ///
    /// # Default Path
    ///
    /// - Linux: `$XDG_RUNTIME_DIR/janus/server.sock`
    /// - Fallback: `/tmp/janus/server.sock`
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket.path.clone().unwrap_or_else(|| {
            let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
                .map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from);
            runtime_dir.join("janus").join("server.sock")
        })
    }

    /// Builds the read-only security policy shared by every component.
    #[must_use]
    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy {
            max_message_size: self.limits.max_message_size,
            max_args_size: self.limits.max_args_size,
            max_name_length: self.limits.max_name_length,
            max_socket_path_length: self.limits.max_socket_path_length,
            max_json_depth: self.limits.max_json_depth,
            allowed_directories: self.security.allowed_directories.clone(),
            max_connections: self.limits.max_connections,
            max_concurrent_handlers: self.limits.max_concurrent_handlers,
            max_pending_correlations: self.limits.max_pending_correlations,
        }
    }

    /// Same as [`security_policy`](Self::security_policy), shared.
    #[must_use]
    pub fn shared_policy(&self) -> Arc<SecurityPolicy> {
        Arc::new(self.security_policy())
    }

    /// Get the default client wait as a `Duration`.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command)
    }

    /// Get the handler deadline as a `Duration`.
    #[must_use]
    pub const fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.handler)
    }

    /// Both deadlines as a [`TimeoutManager`].
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ResourceLimitExceeded`] if either lies outside
    /// the accepted window.
    pub fn timeout_manager(&self) -> Result<TimeoutManager, StructuredError> {
        TimeoutManager::new(self.command_timeout(), self.handler_timeout())
    }

    /// Get the drain timeout as a `Duration`.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.drain_timeout)
    }

    /// Check if rate limiting is enabled.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        self.rate_limit.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JanusConfig::default();
        assert_eq!(config.limits.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.limits.max_args_size, 5 * 1024 * 1024);
        assert_eq!(config.limits.max_socket_path_length, 108);
        assert_eq!(config.timeouts.command, 30_000);
        assert!(config.socket.cleanup_on_start);
        assert!(!config.protocol.legacy_field_names);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_socket_path_override() {
        let mut config = JanusConfig::default();
        config.socket.path = Some(PathBuf::from("/tmp/custom/server.sock"));
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/custom/server.sock"));
    }

    #[test]
    fn test_socket_path_default_ends_with_server_sock() {
        let config = JanusConfig::default();
        let path = config.socket_path();
        assert!(path.to_string_lossy().ends_with("janus/server.sock"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = JanusConfig::from_toml_str(
            r"
            [limits]
            max_concurrent_handlers = 4

            [timeouts]
            handler_timeout_ms = 250
            ",
        )
        .unwrap();
        assert_eq!(config.limits.max_concurrent_handlers, 4);
        assert_eq!(config.handler_timeout(), Duration::from_millis(250));
        assert_eq!(config.limits.max_connections, 100);
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        let err = JanusConfig::from_toml_str("[timeouts]\ncommand_timeout_ms = 50\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert_eq!(err.field.as_deref(), Some("timeouts.command_timeout_ms"));

        let err = JanusConfig::from_toml_str("[timeouts]\nhandler_timeout_ms = 301000\n").unwrap_err();
        assert_eq!(err.field.as_deref(), Some("timeouts.handler_timeout_ms"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = JanusConfig::from_toml_str("[limits]\nmax_message_size = \"big\"\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn test_args_limit_cannot_exceed_message_limit() {
        let mut config = JanusConfig::default();
        config.limits.max_args_size = config.limits.max_message_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = JanusConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: JanusConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.limits.max_connections, config.limits.max_connections);
        assert_eq!(parsed.security.allowed_directories, config.security.allowed_directories);
    }

    #[test]
    fn test_security_policy_mirrors_limits() {
        let mut config = JanusConfig::default();
        config.limits.max_pending_correlations = 7;
        config.security.allowed_directories = vec!["/tmp/janus/".to_string()];
        let policy = config.security_policy();
        assert_eq!(policy.max_pending_correlations, 7);
        assert_eq!(policy.allowed_directories, vec!["/tmp/janus/".to_string()]);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "[rate_limit]\nenabled = false\n").unwrap();
        let config = JanusConfig::load_from_path(&file).unwrap();
        assert!(!config.is_rate_limited());

        let missing = JanusConfig::load_from_path(&dir.path().join("nope.toml")).unwrap_err();
        assert_eq!(missing.code, ErrorCode::ValidationFailed);
    }
}
