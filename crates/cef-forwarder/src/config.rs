// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON configuration for the forwarder.
//!
//! The document is split in sections (`api`, `syslog`, `cef`, `processing`,
//! `state`, `logging`). Every key has a default except the credentials and the
//! collector address, which [`Config::validate`] reports when missing.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file looked up in the working directory when no path is given.
pub const LOCAL_CONFIG_PATH: &str = "./config.json";
/// System wide config file, checked after [`LOCAL_CONFIG_PATH`].
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cef-forwarder/config.json";

/// Upper bound the events feed accepts for a single request.
pub const MAX_EVENTS_LIMIT: u32 = 5000;
/// Shortest accepted polling interval, in seconds.
pub const MIN_FETCH_INTERVAL_SECS: u64 = 10;

const VALID_LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: [&str; 2] = ["json", "text"];

/// Errors raised while locating, parsing or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("specified config file not found: {0}")]
    NotFound(PathBuf),

    #[error("no config file found (searched: {})", .0.join(", "))]
    NoConfigFile(Vec<String>),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing required configuration fields: [{}]", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transport used to reach the syslog collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// GraphQL endpoint of the events feed.
    pub url: String,
    pub api_key: String,
    pub account_id: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.catonetworks.com/api/v1/graphql2".to_string(),
            api_key: String::new(),
            account_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    pub server: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Messages longer than this many bytes are truncated before sending.
    pub max_message_size: usize,
    /// Use the source IP found in the event as the syslog hostname.
    pub use_event_ip_as_source: bool,
    /// Hostname override, used when `use_event_ip_as_source` is off.
    pub custom_source_ip: String,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 514,
            protocol: Protocol::Tcp,
            max_message_size: 8192,
            use_event_ip_as_source: false,
            custom_source_ip: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CefConfig {
    pub vendor: String,
    pub product: String,
    pub version: String,
    /// Event field name to CEF extension key.
    pub field_mappings: BTreeMap<String, String>,
    /// Extension keys emitted first, in this order.
    pub ordered_fields: Vec<String>,
}

impl Default for CefConfig {
    fn default() -> Self {
        Self {
            vendor: "Cato Networks".to_string(),
            product: "SASE Platform".to_string(),
            version: "1.0".to_string(),
            field_mappings: BTreeMap::new(),
            ordered_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub fetch_interval_seconds: u64,
    pub max_events_per_request: u32,
    pub max_pagination_requests: u32,
    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub max_backoff_delay_seconds: u64,
    pub connection_timeout_seconds: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            fetch_interval_seconds: 60,
            max_events_per_request: MAX_EVENTS_LIMIT,
            max_pagination_requests: 10,
            retry_attempts: 3,
            retry_delay_seconds: 5,
            max_backoff_delay_seconds: 300,
            connection_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub marker_file: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            marker_file: PathBuf::from("./config/last_marker.txt"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of debug, info, warn, error
    pub level: String,
    /// Either json or text
    pub format: String,
    /// stdout, stderr or a file path
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
        }
    }
}

/// Complete forwarder configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub syslog: SyslogConfig,
    pub cef: CefConfig,
    pub processing: ProcessingConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
    /// Path the configuration was read from.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Config {
    /// Locates the config file and loads it.
    ///
    /// An explicit path must exist. Without one, [`LOCAL_CONFIG_PATH`] and then
    /// [`SYSTEM_CONFIG_PATH`] are tried.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = find_config_file(explicit_path)?;
        Self::from_file(&path)
    }

    /// Parses the configuration stored at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&data)?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Parses a JSON document, clamping the page size to [`MAX_EVENTS_LIMIT`].
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(data)?;
        if config.processing.max_events_per_request > MAX_EVENTS_LIMIT {
            config.processing.max_events_per_request = MAX_EVENTS_LIMIT;
        }
        Ok(config)
    }

    /// Checks required fields and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.api.api_key.trim().is_empty() {
            missing.push("api.api_key");
        }
        if self.api.account_id.trim().is_empty() {
            missing.push("api.account_id");
        }
        if self.syslog.server.trim().is_empty() {
            missing.push("syslog.server");
        }
        if self.syslog.port == 0 {
            missing.push("syslog.port");
        }
        if self.cef.field_mappings.is_empty() {
            missing.push("cef.field_mappings");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}', must be one of: debug, info, warn, error",
                self.logging.level
            )));
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log format '{}', must be one of: json, text",
                self.logging.format
            )));
        }

        let processing = &self.processing;
        if processing.fetch_interval_seconds < MIN_FETCH_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "fetch_interval_seconds must be at least {MIN_FETCH_INTERVAL_SECS} seconds, got {}",
                processing.fetch_interval_seconds
            )));
        }
        if processing.max_events_per_request < 1
            || processing.max_events_per_request > MAX_EVENTS_LIMIT
        {
            return Err(ConfigError::Invalid(format!(
                "max_events_per_request must be between 1 and {MAX_EVENTS_LIMIT}, got {}",
                processing.max_events_per_request
            )));
        }
        if processing.max_pagination_requests < 1 {
            return Err(ConfigError::Invalid(format!(
                "max_pagination_requests must be at least 1, got {}",
                processing.max_pagination_requests
            )));
        }
        if processing.retry_attempts < 1 {
            return Err(ConfigError::Invalid(format!(
                "retry_attempts must be at least 1, got {}",
                processing.retry_attempts
            )));
        }
        if processing.connection_timeout_seconds < 1 {
            return Err(ConfigError::Invalid(format!(
                "connection_timeout_seconds must be at least 1, got {}",
                processing.connection_timeout_seconds
            )));
        }
        if self.syslog.max_message_size < 1 {
            return Err(ConfigError::Invalid(
                "syslog.max_message_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// `server:port` of the syslog collector.
    pub fn syslog_address(&self) -> String {
        format!("{}:{}", self.syslog.server, self.syslog.port)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.processing.fetch_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.processing.retry_delay_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.processing.max_backoff_delay_seconds)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.connection_timeout_seconds)
    }
}

fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    for candidate in [LOCAL_CONFIG_PATH, SYSTEM_CONFIG_PATH] {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    Err(ConfigError::NoConfigFile(vec![
        LOCAL_CONFIG_PATH.to_string(),
        SYSTEM_CONFIG_PATH.to_string(),
    ]))
}
