//! # Gateway Configuration
//!
//! Loaded once at startup from a TOML file, resolved from the
//! `BASTION_CONFIG` environment variable or `./bastion.toml`. A missing
//! file falls back to the defaults below so a development gateway runs
//! with no setup; a malformed file is a startup error. `BASTION_DB`
//! overrides the database DSN.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Default config path when `BASTION_CONFIG` is unset.
const DEFAULT_PATH: &str = "bastion.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub guacd: GuacdConfig,
    pub database: DatabaseConfig,
    pub i18n: I18nConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the HTTP/WebSocket surface.
    pub listen: String,
}

/// The upstream SSH relay every shell session goes through. The gateway
/// never opens SSH to target assets directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub account: String,
    pub password: String,
    /// Optional pinned SHA-256 host key fingerprint
    /// (`SHA256:...` as printed by `ssh-keygen -lf`). When unset the
    /// first observed key is trusted and logged.
    pub host_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuacdConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct I18nConfig {
    /// Optional TOML message bundle overlaying the built-in catalog.
    pub bundle: Option<PathBuf>,
    pub default_lang: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7070".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 22,
            account: "bastion".to_string(),
            password: String::new(),
            host_key: None,
        }
    }
}

impl Default for GuacdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4822,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite://bastion.db?mode=rwc".to_string(),
        }
    }
}

impl Default for I18nConfig {
    fn default() -> Self {
        Self {
            bundle: None,
            default_lang: "en".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from the environment-selected path.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("BASTION_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        if let Ok(dsn) = std::env::var("BASTION_DB") {
            config.database.dsn = dsn;
        }
        Ok(config)
    }

    /// Parses `path`, or returns the defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn guacd_addr(&self) -> String {
        format!("{}:{}", self.guacd.host, self.guacd.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_section() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:7070");
        assert_eq!(config.relay.port, 22);
        assert_eq!(config.guacd_addr(), "127.0.0.1:4822");
        assert_eq!(config.i18n.default_lang, "en");
        assert!(config.relay.host_key.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[relay]\nhost = \"relay.internal\"\naccount = \"ops\"\npassword = \"secret\"\n\n\
             [database]\ndsn = \"sqlite://gw.db?mode=rwc\""
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.relay.host, "relay.internal");
        assert_eq!(config.relay.port, 22);
        assert_eq!(config.database.dsn, "sqlite://gw.db?mode=rwc");
        assert_eq!(config.server.listen, "0.0.0.0:7070");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::from_file(Path::new("/nonexistent/bastion.toml")).unwrap();
        assert_eq!(config.guacd.port, 4822);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "relay = 7").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}
