//! Configuration loading for the signaling server.
//!
//! Configuration is read from a TOML file (default: `signaling.toml`). A
//! missing file means defaults; every section and key is optional.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use shared_protocol::DEFAULT_SESSION_LIFETIME_SECS;

use crate::ServerError;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub cleanup: CleanupConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP + WebSocket bind address (default: 0.0.0.0:5000)
    pub bind_address: String,
}

/// Session registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Session lifetime in seconds (default: 180)
    pub lifetime_secs: u64,
    /// Largest file a session may announce, in bytes (default: 1 GiB)
    pub max_file_size: u64,
}

/// Expired-session sweep configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Enable the sweep (default: false, expiry is lazy)
    pub enabled: bool,
    /// Sweep interval in seconds (default: 30)
    pub interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_string(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: DEFAULT_SESSION_LIFETIME_SECS,
            max_file_size: 1024 * 1024 * 1024,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
        }
    }
}

impl SessionsConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load from `path`, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ServerError> {
        self.server
            .bind_address
            .parse()
            .map_err(|_| ServerError::BindAddress(self.server.bind_address.clone()))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:5000");
        assert_eq!(config.sessions.lifetime(), Duration::from_secs(180));
        assert_eq!(config.sessions.max_file_size, 1 << 30);
        assert!(!config.cleanup.enabled);
        assert_eq!(config.cleanup.interval_secs, 30);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [sessions]
            lifetime_secs = 60

            [cleanup]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.sessions.lifetime_secs, 60);
        assert_eq!(config.sessions.max_file_size, 1 << 30);
        assert!(config.cleanup.enabled);
        assert_eq!(config.cleanup.interval_secs, 30);
        assert_eq!(config.server.bind_address, "0.0.0.0:5000");
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config =
            Config::load_or_default(Path::new("/nonexistent/cipherdrop/signaling.toml")).unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:5000");
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        assert!(Config::from_toml("[sessions]\nlifetime_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_bind_address() {
        let mut config = Config::default();
        assert_eq!(config.bind_address().unwrap().port(), 5000);

        config.server.bind_address = "not an address".to_string();
        assert!(matches!(config.bind_address(), Err(ServerError::BindAddress(_))));
    }
}
