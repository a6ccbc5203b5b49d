//! Config schema types (server, auth, storage).

use std::path::PathBuf;

use {
    secrecy::SecretString,
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
}

/// Origin of the bundled web client during local development.
pub const DEFAULT_CLIENT_ORIGIN: &str = "http://localhost:5011";

/// Listener and HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// How many consecutive ports to try when `port` is already taken.
    pub port_search: u16,
    /// Allowed CORS origin. `"*"` or `None` allows any origin.
    pub allowed_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 5012,
            port_search: 10,
            allowed_origin: Some(DEFAULT_CLIENT_ORIGIN.into()),
        }
    }
}

/// Bearer-token verification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HS256 secret. Never written back to disk.
    #[serde(skip_serializing)]
    pub jwt_secret: Option<SecretString>,
    /// Clock skew tolerated when checking `exp`, in seconds.
    pub leeway_secs: u64,
}

/// Message store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `<data_dir>/relay.db`.
    pub database: Option<PathBuf>,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("relay.db"))
    }
}
