//! Server configuration
//!
//! TOML-backed configuration with serde defaults, loaded from the XDG
//! config dir. Every section falls back to sane defaults so a missing file
//! yields a working sync-only server; the console extension activates only
//! when a secret is configured.

use std::path::Path;

use serde::{Deserialize, Serialize};

use databridge_utils::{config_file, BridgeError, Result};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub console: ConsoleConfig,
    pub sync: SyncConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8365,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote-console settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Shared secret; the console extension is disabled when unset
    pub secret: Option<String>,
    /// Seconds of keepalive silence before the watchdog closes a client
    pub keepalive_timeout_secs: u64,
    /// Seconds between watchdog sweeps
    pub sweep_interval_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            secret: None,
            keepalive_timeout_secs: 10,
            sweep_interval_secs: 1,
        }
    }
}

/// State-sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enable the state-sync extension
    pub enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default location
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| BridgeError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| BridgeError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.console.sweep_interval_secs == 0 {
            return Err(BridgeError::config("sweep_interval_secs must be at least 1"));
        }

        if config.console.keepalive_timeout_secs <= config.console.sweep_interval_secs {
            return Err(BridgeError::config(
                "keepalive_timeout_secs must exceed sweep_interval_secs",
            ));
        }

        if let Some(secret) = &config.console.secret {
            if secret.is_empty() {
                return Err(BridgeError::config("console secret must not be empty"));
            }
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<AppConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:8365");
        assert!(config.console.secret.is_none());
        assert_eq!(config.console.keepalive_timeout_secs, 10);
        assert_eq!(config.console.sweep_interval_secs, 1);
        assert!(config.sync.enabled);
    }

    #[test]
    fn test_parse_partial_config() {
        let content = r#"
            [server]
            port = 9000

            [console]
            secret = "s3cr3t"
        "#;

        let config = ConfigLoader::parse(content, Path::new("test.toml")).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.console.secret.as_deref(), Some("s3cr3t"));
        assert_eq!(config.console.keepalive_timeout_secs, 10);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigLoader::parse("not = [valid", Path::new("bad.toml"));
        assert!(matches!(result, Err(BridgeError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[sync]").unwrap();
        writeln!(file, "enabled = false").unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert!(!config.sync.enabled);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = ConfigLoader::load_from_path(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(BridgeError::FileRead { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_sweep() {
        let mut config = AppConfig::default();
        config.console.sweep_interval_secs = 0;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_timeout_within_sweep() {
        let mut config = AppConfig::default();
        config.console.sweep_interval_secs = 10;
        config.console.keepalive_timeout_secs = 10;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_secret() {
        let mut config = AppConfig::default();
        config.console.secret = Some(String::new());
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(ConfigLoader::validate(&AppConfig::default()).is_ok());
    }
}
