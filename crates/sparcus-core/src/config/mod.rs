//! Service configuration.
//!
//! This module handles:
//! - Loading the TOML config file
//! - Resolution order (CLI > env > config file > defaults)
//! - Validation of numeric limits
//! - Redaction of broker credentials for display

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::dispatch::DispatchConfig;
use crate::forward::MqttSettings;

/// Config file read when none is given explicitly.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sparcus.toml";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SPARCUS_CONFIG";

/// Placeholder shown instead of secrets.
pub const REDACTED: &str = "<REDACTED>";

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid TOML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Full service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address.
    pub bind: String,
    pub port: u16,
    /// Root of the handler tree.
    pub handlers_path: PathBuf,
    /// State file written on shutdown and read on startup.
    pub data_file: PathBuf,
    /// Event log capacity.
    pub max_events: usize,

    /// Graphite host; empty disables the metrics sink.
    pub graphite_host: String,
    /// Graphite port; 0 disables the metrics sink.
    pub graphite_port: u16,

    /// MQTT broker host; empty disables pub/sub.
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
    /// Topic prefix for publish and subscribe.
    pub mqtt_namespace: String,
    pub mqtt_client_id: String,

    /// Connect/write timeout for sinks.
    pub forward_timeout_ms: u64,
    pub forward_queue_capacity: usize,
    pub handler_timeout_ms: u64,
    /// Per-stream capture limit for handler output.
    pub handler_max_output_bytes: usize,
    /// Upper bound on the shutdown snapshot.
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            handlers_path: PathBuf::from("/var/lib/sparcus/handlers"),
            data_file: PathBuf::from("/var/lib/sparcus/data.json"),
            max_events: crate::events::DEFAULT_MAX_EVENTS,
            graphite_host: "localhost".to_string(),
            graphite_port: 2003,
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            mqtt_namespace: "sparcus".to_string(),
            mqtt_client_id: "sparcus".to_string(),
            forward_timeout_ms: 2000,
            forward_queue_capacity: 1024,
            handler_timeout_ms: crate::dispatch::DEFAULT_TIMEOUT_MS,
            handler_max_output_bytes: crate::dispatch::DEFAULT_MAX_OUTPUT_BYTES,
            shutdown_grace_ms: 5000,
        }
    }
}

impl Config {
    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load a config file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::IoError {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Check limits that must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 6] = [
            ("port", self.port as u64),
            ("max_events", self.max_events as u64),
            ("forward_timeout_ms", self.forward_timeout_ms),
            ("forward_queue_capacity", self.forward_queue_capacity as u64),
            ("handler_timeout_ms", self.handler_timeout_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "bind",
                message: "must not be empty".to_string(),
            });
        }
        if self.mqtt_enabled() && self.mqtt_namespace.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid {
                field: "mqtt_namespace",
                message: "must not be empty when mqtt is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// A copy safe to display: the broker password is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.mqtt_password.is_empty() {
            copy.mqtt_password = REDACTED.to_string();
        }
        copy
    }

    pub fn graphite_enabled(&self) -> bool {
        !self.graphite_host.is_empty() && self.graphite_port != 0
    }

    pub fn mqtt_enabled(&self) -> bool {
        !self.mqtt_host.is_empty()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            timeout: Duration::from_millis(self.handler_timeout_ms),
            max_output_bytes: self.handler_max_output_bytes,
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_user.clone(),
            password: self.mqtt_password.clone(),
            namespace: self.mqtt_namespace.clone(),
        }
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(bind) = &overrides.bind {
            self.bind = bind.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(path) = &overrides.handlers_path {
            self.handlers_path = path.clone();
        }
        if let Some(path) = &overrides.data_file {
            self.data_file = path.clone();
        }
    }
}

/// Values given on the command line (or their environment variables).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub handlers_path: Option<PathBuf>,
    pub data_file: Option<PathBuf>,
}

/// Configuration resolution options.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority); must exist.
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

/// Resolved configuration with provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Config,
    /// File the config was read from (None if using defaults).
    pub source: Option<PathBuf>,
}

/// Load configuration with the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit CLI flags (via ConfigOptions)
/// 2. Config file from `--config`, then `SPARCUS_CONFIG`
/// 3. `/etc/sparcus.toml` if present
/// 4. Built-in defaults
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    load_config_with_default(options, Path::new(DEFAULT_CONFIG_PATH))
}

fn load_config_with_default(
    options: &ConfigOptions,
    default_path: &Path,
) -> Result<ResolvedConfig, ConfigError> {
    let explicit = options
        .config_path
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    let (mut config, source) = match explicit {
        Some(path) => (Config::load_file(&path)?, Some(path)),
        None if default_path.exists() => (
            Config::load_file(default_path)?,
            Some(default_path.to_path_buf()),
        ),
        None => (Config::default(), None),
    };

    config.apply(&options.overrides);
    config.validate()?;

    Ok(ResolvedConfig { config, source })
}
