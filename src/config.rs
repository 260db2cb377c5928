//! Configuration for daemon-link
//!
//! [`ClientConfig`] is the typed form the client runs on. [`Config`] is the
//! file form, with signed millisecond values following the daemon tooling
//! conventions (negative cooldown disables reconnection, negative idle timeout
//! never disconnects, non-positive heartbeat disables pings).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DaemonError;

/// When an idle connection is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    /// Stay connected indefinitely.
    Never,
    /// Disconnect once idle for this long. Zero disconnects immediately.
    After(Duration),
}

impl IdlePolicy {
    pub fn is_indefinite(&self) -> bool {
        matches!(self, Self::Never)
    }
}

/// Runtime configuration for a [`DaemonClient`](crate::DaemonClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Daemon WebSocket URL
    pub url: String,
    /// Service name we register as and stamp on outgoing requests
    pub origin: String,
    /// Bound on connect plus registration
    pub connect_timeout: Duration,
    /// Default timeout for individual requests (None = wait forever)
    pub request_timeout: Option<Duration>,
    /// Wait before reconnecting (None = never reconnect)
    pub reconnect_cooldown: Option<Duration>,
    /// Idle disconnection policy
    pub idle: IdlePolicy,
    /// Ping interval (None = no heartbeat)
    pub heartbeat: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            origin: default_origin(),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms() as u64),
            request_timeout: Some(Duration::from_millis(default_request_timeout_ms() as u64)),
            reconnect_cooldown: Some(Duration::from_millis(default_reconnect_cooldown_ms() as u64)),
            idle: IdlePolicy::Never,
            heartbeat: Some(Duration::from_millis(default_heartbeat_ms() as u64)),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn reconnects(&self) -> bool {
        self.reconnect_cooldown.is_some()
    }

    /// Heartbeats only make sense when the connection is meant to stay up.
    pub fn heartbeat_period(&self) -> Option<Duration> {
        if self.idle.is_indefinite() {
            self.heartbeat
        } else {
            None
        }
    }

    /// Connect at construction instead of on first use.
    pub fn auto_connects(&self) -> bool {
        self.idle.is_indefinite() && self.reconnects()
    }
}

/// Where TLS client credentials come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Plain `ws://`, no client certificate
    #[default]
    None,
    /// `<prefix>.crt` and `<prefix>.key`
    Prefix,
    /// The home-directory convention
    Home,
}

/// Credential settings in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub source: CredentialSource,

    /// Path prefix for `source = "prefix"`
    #[serde(default)]
    pub prefix: Option<PathBuf>,

    /// CA certificate the daemon's certificate is checked against
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// Name the daemon certificate must be valid for (defaults to the URL host)
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daemon WebSocket URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Service name to register as
    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: i64,

    /// Non-positive waits forever
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: i64,

    /// Negative disables reconnection
    #[serde(default = "default_reconnect_cooldown_ms")]
    pub reconnect_cooldown_ms: i64,

    /// Negative never disconnects, zero disconnects immediately
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,

    /// Non-positive disables heartbeats
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: i64,

    #[serde(default)]
    pub credentials: CredentialConfig,

    /// Command name → destination service
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

fn default_url() -> String {
    "ws://localhost:55400".to_string()
}

fn default_origin() -> String {
    "client_ui".to_string()
}

fn default_connect_timeout_ms() -> i64 {
    10_000
}

fn default_request_timeout_ms() -> i64 {
    60_000
}

fn default_reconnect_cooldown_ms() -> i64 {
    5_000
}

fn default_idle_timeout_ms() -> i64 {
    -1
}

fn default_heartbeat_ms() -> i64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            origin: default_origin(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_cooldown_ms: default_reconnect_cooldown_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            credentials: CredentialConfig::default(),
            routes: HashMap::new(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DaemonError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply the sign conventions and produce the runtime configuration.
    pub fn to_client_config(&self) -> Result<ClientConfig, DaemonError> {
        if self.connect_timeout_ms <= 0 {
            return Err(DaemonError::Config(format!(
                "connect_timeout_ms must be positive, got {}",
                self.connect_timeout_ms
            )));
        }

        Ok(ClientConfig {
            url: self.url.clone(),
            origin: self.origin.clone(),
            connect_timeout: millis(self.connect_timeout_ms),
            request_timeout: positive(self.request_timeout_ms),
            reconnect_cooldown: (self.reconnect_cooldown_ms >= 0)
                .then(|| millis(self.reconnect_cooldown_ms)),
            idle: if self.idle_timeout_ms < 0 {
                IdlePolicy::Never
            } else {
                IdlePolicy::After(millis(self.idle_timeout_ms))
            },
            heartbeat: positive(self.heartbeat_ms),
        })
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0).unsigned_abs())
}

fn positive(ms: i64) -> Option<Duration> {
    (ms > 0).then(|| millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default().to_client_config().unwrap();
        assert_eq!(config.url, "ws://localhost:55400");
        assert_eq!(config.origin, "client_ui");
        assert_eq!(config.idle, IdlePolicy::Never);
        assert!(config.auto_connects());
        assert_eq!(config.heartbeat_period(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_sign_conventions() {
        let config: Config = toml::from_str(
            r#"
            url = "wss://daemon:55400"
            request_timeout_ms = 0
            reconnect_cooldown_ms = -1
            idle_timeout_ms = 0
            heartbeat_ms = -5
            "#,
        )
        .unwrap();
        let client = config.to_client_config().unwrap();

        assert_eq!(client.request_timeout, None);
        assert_eq!(client.reconnect_cooldown, None);
        assert_eq!(client.idle, IdlePolicy::After(Duration::ZERO));
        assert_eq!(client.heartbeat, None);
        assert!(!client.auto_connects());
    }

    #[test]
    fn test_heartbeat_needs_indefinite_policy() {
        let client = ClientConfig {
            idle: IdlePolicy::After(Duration::from_secs(1)),
            ..Default::default()
        };
        assert_eq!(client.heartbeat_period(), None);
    }

    #[test]
    fn test_credentials_section() {
        let config: Config = toml::from_str(
            r#"
            [credentials]
            source = "prefix"
            prefix = "/etc/daemon/ssl/client"
            server_name = "daemon.local"

            [routes]
            get_balance = "wallet"
            "#,
        )
        .unwrap();
        assert_eq!(config.routes.get("get_balance").map(String::as_str), Some("wallet"));
        assert_eq!(config.credentials.source, CredentialSource::Prefix);
        assert_eq!(config.credentials.server_name.as_deref(), Some("daemon.local"));
    }

    #[test]
    fn test_rejects_non_positive_connect_timeout() {
        let config = Config {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.to_client_config(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/definitely/not/here.toml").is_err());
    }
}
