//! Connection configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IPROTO_CONFIG)
//! 3. Environment variables

use iproto_protocol::{FeatureSet, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default capacity of the ignored-packet broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Largest reply payload accepted by default (256 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: u64 = 256 * 1024 * 1024;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web PKI roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the host part of the address).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address, `host:port`.
    pub addr: String,
    /// Budget for resolve, TCP connect, TLS and greeting, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Default per-request timeout in milliseconds. `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    /// User to authenticate as after connect.
    pub user: Option<String>,
    /// Password for `user`.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Subscribe to `box.shutdown` and drain gracefully when the server
    /// announces shutdown.
    pub graceful_shutdown: bool,
    /// Capacity of the ignored-packet broadcast channel.
    pub event_channel_capacity: usize,
    /// Largest reply payload accepted from the server, in bytes. A larger
    /// frame is a protocol error and closes the connection.
    pub max_response_size: u64,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
    /// Features declared in `IPROTO_ID`.
    #[serde(skip, default = "FeatureSet::all")]
    pub features: FeatureSet,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(format!("127.0.0.1:{}", DEFAULT_PORT))
    }
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: Some(30_000),
            user: None,
            password: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            graceful_shutdown: true,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            tls: None,
            features: FeatureSet::all(),
        }
    }

    /// Loads configuration from the file named by `IPROTO_CONFIG` (if set),
    /// then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("IPROTO_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: ConnectionConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))?;
        config.read_buffer_size = clamp_buffer(config.read_buffer_size);
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("IPROTO_ADDR") {
            self.addr = addr;
        }
        if let Ok(user) = std::env::var("IPROTO_USER") {
            self.user = Some(user);
        }
        if let Ok(password) = std::env::var("IPROTO_PASSWORD") {
            self.password = Some(password);
        }
        if let Ok(ms) = std::env::var("IPROTO_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.connect_timeout_ms = ms;
            }
        }
        if let Ok(ms) = std::env::var("IPROTO_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.request_timeout_ms = (ms > 0).then_some(ms);
            }
        }
        if let Ok(enabled) = std::env::var("IPROTO_GRACEFUL_SHUTDOWN") {
            self.graceful_shutdown = parse_flag(&enabled);
        }
        if let Ok(enabled) = std::env::var("IPROTO_TLS") {
            let tls = self.tls.get_or_insert_with(TlsClientConfig::default);
            tls.enabled = parse_flag(&enabled);
        }
    }

    /// Saves configuration to a YAML file. The password is never written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = clamp_buffer(size);
        self
    }

    pub fn with_graceful_shutdown(mut self, enabled: bool) -> Self {
        self.graceful_shutdown = enabled;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    pub fn with_max_response_size(mut self, size: u64) -> Self {
        self.max_response_size = size;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Host part of the address, used for TLS server names.
    pub fn host(&self) -> &str {
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.addr,
        }
    }

    pub(crate) fn tls_enabled(&self) -> Option<&TlsClientConfig> {
        self.tls.as_ref().filter(|tls| tls.enabled)
    }
}

fn clamp_buffer(size: usize) -> usize {
    size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, String),
}
