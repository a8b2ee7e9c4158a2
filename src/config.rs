use crate::core::connection::ServerAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Client configuration, loadable from YAML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Cache server as `host:port`
    pub server: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Send/receive bound per request; `None` blocks indefinitely
    #[serde(default)]
    pub socket_timeout_ms: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub cas_missing_key: CasMissingKey,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

/// SASL PLAIN credentials used once per connection
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What `cas` does when the key does not exist on the server
///
/// The server cannot tell a deleted key from one that never existed, so only
/// `Reject` makes `cas` with a token issued before a delete return `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CasMissingKey {
    /// Send `cas` as a `Set`; the server creates the entry and adopts the
    /// token, even when the key was deleted after the token was issued
    #[default]
    Create,
    /// Send `cas` as a `Replace`; a missing key is reported as a failed `cas`
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long an operation waits for a free connection; unset waits forever
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: Option<u64>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            wait_timeout_secs: default_wait_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

// Default values for connection and pool configuration
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_connections() -> usize {
    10
}
fn default_wait_timeout_secs() -> Option<u64> {
    Some(5)
}
fn default_idle_timeout_secs() -> u64 {
    300
} // 5 minutes
fn default_max_lifetime_secs() -> u64 {
    3600
} // 1 hour

impl Config {
    /// Configuration for `server` with every other setting at its default
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            credentials: None,
            socket_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            cas_missing_key: CasMissingKey::default(),
            connection_pool: ConnectionPoolConfig::default(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout_ms = timeout.map(whole_millis);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_cas_missing_key(mut self, policy: CasMissingKey) -> Self {
        self.cas_missing_key = policy;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.connection_pool.max_connections = max_connections;
        self
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parsed form of `server`
    pub fn server_address(&self) -> Result<ServerAddress, ConfigError> {
        self.server.parse().map_err(|e| {
            ConfigError::ValidationError(format!("Invalid server '{}': {}", self.server, e))
        })
    }

    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Validate the configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_address()?;

        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Credentials require a non-empty username".to_string(),
                ));
            }
        }

        if self.socket_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "socket_timeout_ms must be positive; omit it to block indefinitely".to_string(),
            ));
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }

        if self.connection_pool.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "connection_pool.max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Milliseconds rounded up, so a non-zero duration never becomes zero
fn whole_millis(duration: Duration) -> u64 {
    duration.as_nanos().div_ceil(1_000_000) as u64
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
