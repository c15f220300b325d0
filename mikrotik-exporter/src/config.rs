//! Configuration for the MikroTik exporter.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use mikrotik_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::convert::Conversion;
use crate::labels::reserved_label_keys;

/// Environment variable overriding `router.host`.
pub const ENV_HOST: &str = "ME_HOST";
/// Environment variable overriding `router.user`.
pub const ENV_USER: &str = "ME_USER";
/// Environment variable overriding `router.password`.
pub const ENV_PASSWORD: &str = "ME_PASS";

/// Shortest host name accepted after overrides are merged.
const MIN_HOST_LEN: usize = 3;

/// Paths served by the HTTP server besides the metrics endpoint.
const RESERVED_PATHS: [&str; 3] = ["/", "/health", "/ready"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid router credentials: {0}")]
    Credentials(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterConfig {
    /// HTTP port for the scrape endpoint (default: 9120).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Full listen address; overrides `port` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Path for the metrics endpoint (default: "/metrics").
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Prefix of every exported metric name (default: "mikrotikexporter").
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Seconds between poll cycles (default: 15).
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,

    /// Seconds to wait before reconnecting (default: 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,

    /// What to do when an active stream delivers an error.
    #[serde(default)]
    pub stream_error_policy: StreamErrorPolicy,

    /// Device connection settings.
    #[serde(alias = "routeros")]
    pub router: RouterConfig,

    /// Attribute groups to acquire.
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_port() -> u16 {
    9120
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "mikrotikexporter".to_string()
}

fn default_scrape_interval() -> u64 {
    15
}

fn default_reconnect_delay() -> u64 {
    5
}

/// Handling of a delivery error on an active stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamErrorPolicy {
    /// Drop the session and go through the reconnect path.
    #[default]
    Reconnect,
    /// Stop the exporter with a non-zero exit status.
    Exit,
}

/// Device connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// API port (default: 8728).
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Connection timeout in seconds (default: 30).
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_api_port() -> u16 {
    8728
}

fn default_timeout() -> u64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            password: String::new(),
            port: default_api_port(),
            timeout: default_timeout(),
        }
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How an attribute acquires its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AcquisitionMode {
    /// Continuous push: subscribe to `command` on the menu.
    Stream,
    /// One-shot list query on every poll.
    Get,
    /// One-shot single-record query on every poll.
    GetOne,
}

impl AcquisitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionMode::Stream => "stream",
            AcquisitionMode::Get => "get",
            AcquisitionMode::GetOne => "getOne",
        }
    }
}

/// An attribute group: what to fetch from one menu and which series it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinition {
    pub name: String,

    #[serde(alias = "type")]
    pub mode: AcquisitionMode,

    pub menu: String,

    /// Stream command (stream mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// `[field, value]` filter applied before subscribing or querying.
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<(String, String)>,

    /// Query modifiers passed verbatim (get/getOne modes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,

    /// Static `[key, value]` labels attached to every observation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<(String, String)>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,

    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

/// One series fed by an attribute.
///
/// Every field is optional at parse time; malformed specs are skipped with a
/// diagnostic when the attribute is wired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Field to read from the response record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Synthetic value derived from the response shape.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MetricKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl MetricSpec {
    /// A spec reading `attribute` into series `name`.
    pub fn field(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            attribute: Some(attribute.into()),
            ..Default::default()
        }
    }

    /// A spec counting the records returned into series `name`.
    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            kind: Some(MetricKind::Count),
            ..Default::default()
        }
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = Some(conversion);
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

/// Synthetic metric kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricKind {
    /// Number of records returned by a list query.
    Count,
    /// Anything else; skipped at wiring time.
    Unknown(String),
}

impl From<String> for MetricKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "count" => MetricKind::Count,
            _ => MetricKind::Unknown(value),
        }
    }
}

impl From<MetricKind> for String {
    fn from(value: MetricKind) -> Self {
        match value {
            MetricKind::Count => "count".to_string(),
            MetricKind::Unknown(s) => s,
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    ///
    /// Validation is left to the caller so environment overrides can be
    /// merged first.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Replace router credentials from `ME_HOST`, `ME_USER` and `ME_PASS`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Replace router credentials from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.router.host = host;
        }
        if let Some(user) = lookup(ENV_USER) {
            self.router.user = user;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.router.password = password;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.router.host.trim().len() < MIN_HOST_LEN {
            return Err(ConfigError::Credentials(format!(
                "router host '{}' is missing or too short (set router.host or {})",
                self.router.host, ENV_HOST
            )));
        }

        if self.router.user.trim().is_empty() {
            return Err(ConfigError::Credentials(format!(
                "router user is missing (set router.user or {})",
                ENV_USER
            )));
        }

        if self.router.password.trim().is_empty() {
            return Err(ConfigError::Credentials(format!(
                "router password is missing (set router.password or {})",
                ENV_PASSWORD
            )));
        }

        if self.scrape_interval == 0 {
            return Err(ConfigError::Validation(
                "scrapeInterval must be > 0".to_string(),
            ));
        }

        if self.reconnect_delay == 0 {
            return Err(ConfigError::Validation(
                "reconnectDelay must be > 0".to_string(),
            ));
        }

        if self.router.timeout == 0 {
            return Err(ConfigError::Validation(
                "router.timeout must be > 0".to_string(),
            ));
        }

        if !self.metrics_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if RESERVED_PATHS.contains(&self.metrics_path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path '{}' is reserved",
                self.metrics_path
            )));
        }

        self.listen_addr()?;

        for attribute in &self.attributes {
            if attribute.name.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Attribute on menu '{}' has an empty name",
                    attribute.menu
                )));
            }

            if !attribute.menu.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Attribute '{}': menu must start with /",
                    attribute.name
                )));
            }

            for key in reserved_label_keys(attribute) {
                warn!(
                    attribute = %attribute.name,
                    label = %key,
                    "Static label 'name' is reserved for the attribute name, ignoring"
                );
            }

            if attribute.mode == AcquisitionMode::Stream
                && attribute
                    .command
                    .as_deref()
                    .is_none_or(|c| c.trim().is_empty())
            {
                return Err(ConfigError::Validation(format!(
                    "Attribute '{}': stream mode requires a command",
                    attribute.name
                )));
            }
        }

        Ok(())
    }

    /// The socket address the HTTP server binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = self
            .listen
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port));

        listen
            .parse()
            .map_err(|_| ConfigError::Validation(format!("Invalid listen address: {}", listen)))
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    /// Bound on a connect attempt or a single query.
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.router.timeout)
    }
}

impl Default for ExporterConfig {
    /// The starter configuration written when no file exists.
    fn default() -> Self {
        Self {
            port: default_port(),
            listen: None,
            metrics_path: default_metrics_path(),
            prefix: default_prefix(),
            scrape_interval: default_scrape_interval(),
            reconnect_delay: default_reconnect_delay(),
            stream_error_policy: StreamErrorPolicy::default(),
            router: RouterConfig {
                host: "192.168.88.1".to_string(),
                user: "admin".to_string(),
                password: "changeme".to_string(),
                ..Default::default()
            },
            attributes: vec![
                AttributeDefinition {
                    name: "resources".to_string(),
                    mode: AcquisitionMode::GetOne,
                    menu: "/system/resource".to_string(),
                    command: None,
                    filter: None,
                    options: Vec::new(),
                    labels: Vec::new(),
                    help: Some("System resources".to_string()),
                    metrics: vec![
                        MetricSpec::field("uptime", "uptime")
                            .with_conversion(Conversion::Uptime)
                            .with_help("in seconds"),
                        MetricSpec::field("cpu_load", "cpu-load").with_help("in percent"),
                        MetricSpec::field("free_memory", "free-memory").with_help("in bytes"),
                    ],
                },
                AttributeDefinition {
                    name: "interfaces".to_string(),
                    mode: AcquisitionMode::Get,
                    menu: "/interface".to_string(),
                    command: None,
                    filter: None,
                    options: Vec::new(),
                    labels: Vec::new(),
                    help: None,
                    metrics: vec![
                        MetricSpec::count("interface_count").with_help("Configured interfaces"),
                    ],
                },
                AttributeDefinition {
                    name: "ether1".to_string(),
                    mode: AcquisitionMode::Stream,
                    menu: "/interface".to_string(),
                    command: Some("monitor-traffic".to_string()),
                    filter: Some(("name".to_string(), "ether1".to_string())),
                    options: Vec::new(),
                    labels: vec![("Interface Role".to_string(), "uplink".to_string())],
                    help: Some("Interface traffic".to_string()),
                    metrics: vec![
                        MetricSpec::field("rx_bits_per_second", "rx-bits-per-second"),
                        MetricSpec::field("tx_bits_per_second", "tx-bits-per-second"),
                    ],
                },
            ],
            logging: LoggingConfig::default(),
        }
    }
}
