//! TOML configuration for the `dkx` binary.
//!
//! Looked up in the platform config directory (`~/.config/dkx/config.toml`
//! on Linux) unless `--config` names a file. Every section is optional.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dkx_crypto::{codec, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::{DEFAULT_MAX_VALUE_LEN, DEFAULT_SLICE_SIZE};
use crate::session::ChannelSettings;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
const DEFAULT_ADDR: &str = "127.0.0.1:7878";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot render config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field parsed but holds an unusable value
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Harness configuration.
///
/// ```toml
/// [identity]
/// public_key = "<base64, 32 bytes>"
/// private_key = "<base64, 64 bytes>"
///
/// [transport]
/// listen_addr = "127.0.0.1:7878"
/// connect_addr = "127.0.0.1:7878"
/// slice_size = 30
/// timeout_seconds = 30
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

/// Long-term key pair, both halves Base64. Unset means a fresh pair per run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl IdentityConfig {
    /// Decode and import the configured pair, if any.
    pub fn key_pair(&self) -> Result<Option<KeyPair>, ConfigError> {
        let (Some(public), Some(private)) = (&self.public_key, &self.private_key) else {
            if self.public_key.is_some() || self.private_key.is_some() {
                return Err(ConfigError::invalid(
                    "identity",
                    "public_key and private_key must be set together",
                ));
            }
            return Ok(None);
        };

        let public = codec::decode(public)
            .map_err(|e| ConfigError::invalid("identity.public_key", e.to_string()))?;
        let private = codec::decode(private)
            .map_err(|e| ConfigError::invalid("identity.private_key", e.to_string()))?;
        let mut pair = KeyPair::new();
        pair.import(&public, &private)
            .map_err(|e| ConfigError::invalid("identity", e.to_string()))?;
        Ok(Some(pair))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `dkx server` binds here
    pub listen_addr: String,
    /// `dkx device` dials here
    pub connect_addr: String,
    /// Value characters per `{{key;value}}` line
    pub slice_size: usize,
    /// Receive timeout per message
    pub timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ADDR.to_string(),
            connect_addr: DEFAULT_ADDR.to_string(),
            slice_size: DEFAULT_SLICE_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl TransportConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr("transport.listen_addr", &self.listen_addr)
    }

    pub fn connect_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr("transport.connect_addr", &self.connect_addr)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            slice_size: self.slice_size,
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

fn socket_addr(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("{value:?} is not host:port")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Read, parse and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// The file at [`Config::default_path`], or defaults when there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(Self::load_default, Self::load)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "dkx", "dkx")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Write as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let rendered = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, rendered)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("{:?} is not one of {LOG_LEVELS:?}", self.logging.level),
            ));
        }
        if !(1..=DEFAULT_MAX_VALUE_LEN).contains(&self.transport.slice_size) {
            return Err(ConfigError::invalid(
                "transport.slice_size",
                format!("must be between 1 and {DEFAULT_MAX_VALUE_LEN}"),
            ));
        }
        if self.transport.timeout_seconds == 0 {
            return Err(ConfigError::invalid("transport.timeout_seconds", "must be at least 1"));
        }
        self.transport.listen_addr()?;
        self.transport.connect_addr()?;
        self.identity.key_pair()?;
        Ok(())
    }

    /// Commented starting point for a config file.
    pub fn sample_toml() -> &'static str {
        r#"# dkx harness configuration

[identity]
# Static key pair, Base64 encoded. Leave both unset to generate a fresh
# key pair on every run. `dkx keygen` prints a matching pair.
# public_key = ""
# private_key = ""

[transport]
# Address `dkx server` listens on
listen_addr = "127.0.0.1:7878"
# Address `dkx device` connects to
connect_addr = "127.0.0.1:7878"
# Maximum value characters per {{key;value}} line
slice_size = 30
# Per-message receive timeout in seconds
timeout_seconds = 30

[logging]
# error, warn, info, debug or trace
level = "warn"
"#
    }

    /// Layer command-line values over the file.
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if overrides.debug == Some(true) {
            self.logging.level = "debug".to_string();
        } else if overrides.verbose == Some(true) {
            self.logging.level = "info".to_string();
        }
        if let Some(addr) = &overrides.listen_addr {
            self.transport.listen_addr.clone_from(addr);
        }
        if let Some(addr) = &overrides.connect_addr {
            self.transport.connect_addr.clone_from(addr);
        }
        if let Some(slice_size) = overrides.slice_size {
            self.transport.slice_size = slice_size;
        }
        if let Some(timeout) = overrides.timeout_seconds {
            self.transport.timeout_seconds = timeout;
        }
        self
    }
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbose: Option<bool>,
    pub debug: Option<bool>,
    pub listen_addr: Option<String>,
    pub connect_addr: Option<String>,
    pub slice_size: Option<usize>,
    pub timeout_seconds: Option<u64>,
}
