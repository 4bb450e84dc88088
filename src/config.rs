//! Configuration for the consumer feature.
//!
//! Loaded from a TOML file; credentials may be supplied inline or resolved
//! from an environment variable at load time. The manager treats the loaded
//! value as a read-mostly snapshot fetched at the start of each `update()`
//! through a shared [`ConfigStore`] handle.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

/// Default watchdog recurrence when the config does not set one.
pub const DEFAULT_WATCHDOG_PERIOD_SECS: u64 = 60;

/// URI schemes accepted for the broker endpoint.
const AMQP_SCHEMES: [&str; 2] = ["amqp", "amqps"];

/// A credential value whose `Debug`/`Display` never reveal the content.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the underlying value; only the broker dialer should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Desired-state record pairing a queue with the application ids permitted to
/// receive messages delivered on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeItem {
    /// Queue to consume from.
    pub queue_name: String,
    /// Application ids allowed through the delivery filter.
    #[serde(default)]
    pub app_ids: HashSet<String>,
}

/// Full consumer configuration as seen by the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Master switch for the consumer feature.
    pub enabled: bool,
    /// Broker endpoint; `None` disables connection management outright.
    pub service_uri: Option<String>,
    pub user_name: Option<String>,
    pub password: Option<Secret>,
    /// Watchdog recurrence period.
    pub watchdog_period: Duration,
    /// Desired consume channels.
    pub consume: Vec<ConsumeItem>,
    /// When set, deliveries tagged with the reserved debug app id are
    /// dispatched regardless of the queue allow-list.
    pub debug: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_uri: None,
            user_name: None,
            password: None,
            watchdog_period: Duration::from_secs(DEFAULT_WATCHDOG_PERIOD_SECS),
            consume: Vec::new(),
            debug: false,
        }
    }
}

/// On-disk shape of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileConfig {
    broker: BrokerSection,
    #[serde(default, rename = "queue")]
    queues: Vec<QueueSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BrokerSection {
    #[serde(default)]
    enabled: bool,
    service_uri: Option<String>,
    user_name: Option<String>,
    /// Inline password. Prefer `password_env` outside of tests.
    password: Option<String>,
    /// Environment variable holding the password.
    password_env: Option<String>,
    #[serde(default = "default_watchdog_period_secs")]
    watchdog_period_secs: u64,
    #[serde(default)]
    debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueSection {
    name: String,
    #[serde(default)]
    app_ids: Vec<String>,
}

fn default_watchdog_period_secs() -> u64 {
    DEFAULT_WATCHDOG_PERIOD_SECS
}

impl ConsumerConfig {
    /// Load configuration from a TOML file, resolving the password from the
    /// environment when `password_env` is set.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&content)?;

        let service_uri = match file.broker.service_uri.as_deref() {
            Some(raw) => normalize_service_uri(raw)?,
            None => None,
        };

        let password = match (&file.broker.password, &file.broker.password_env) {
            (_, Some(env_name)) => {
                let value = std::env::var(env_name)
                    .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?;
                Some(Secret::new(value))
            }
            (Some(inline), None) => Some(Secret::new(inline.clone())),
            (None, None) => None,
        };

        Ok(Self {
            enabled: file.broker.enabled,
            service_uri,
            user_name: file.broker.user_name,
            password,
            watchdog_period: Duration::from_secs(file.broker.watchdog_period_secs),
            consume: file
                .queues
                .into_iter()
                .map(|q| ConsumeItem {
                    queue_name: q.name,
                    app_ids: q.app_ids.into_iter().collect(),
                })
                .collect(),
            debug: file.broker.debug,
        })
    }
}

/// Trim whitespace and trailing slashes, then validate the scheme.
///
/// An empty value collapses to `None` (treated as "not configured" rather
/// than an error, so a blank form field does not wedge the manager).
pub fn normalize_service_uri(raw: &str) -> Result<Option<String>, ConfigError> {
    let stripped = raw.trim().trim_end_matches('/');
    if stripped.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(stripped).map_err(|_| ConfigError::InvalidUri(stripped.to_string()))?;
    if !AMQP_SCHEMES.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUri(stripped.to_string()));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUri(stripped.to_string()));
    }

    Ok(Some(stripped.to_string()))
}

/// Immutable connection parameters captured when a connection is opened.
///
/// A live connection compares its own snapshot against the current desired
/// config to decide whether it must be recycled.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub service_uri: String,
    pub user_name: Option<String>,
    pub password: Option<Secret>,
    pub watchdog_period: Duration,
}

impl ConnectionConfig {
    pub fn from_consumer(config: &ConsumerConfig, service_uri: String) -> Self {
        Self {
            service_uri,
            user_name: config.user_name.clone(),
            password: config.password.clone(),
            watchdog_period: config.watchdog_period,
        }
    }

    /// Whether this snapshot still matches the desired parameters.
    ///
    /// A difference in any of URI, username, or password forces recreation.
    pub fn matches(&self, desired: &ConnectionConfig) -> bool {
        self.service_uri == desired.service_uri
            && self.user_name == desired.user_name
            && self.password == desired.password
    }
}

/// Shared handle to the current configuration.
///
/// Explicitly constructed and injected into the manager and the watchdog
/// (no hidden global); `snapshot()` is cheap enough to call on every tick.
#[derive(Clone, Default)]
pub struct ConfigStore {
    inner: Arc<RwLock<ConsumerConfig>>,
}

impl ConfigStore {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> ConsumerConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Replace the stored configuration (configuration-save path).
    pub fn replace(&self, config: ConsumerConfig) {
        *self.inner.write().expect("config lock poisoned") = config;
    }
}
