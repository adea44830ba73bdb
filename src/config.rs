/*!
 * Configuration types for Conduit
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConduitError, Result};

/// Where callbacks or connection events are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Run on whichever thread produced the outcome
    #[default]
    Immediate,
    /// Run on a dedicated dispatcher thread, in submission order
    Dispatcher,
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Main configuration for a client host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Log level
    pub log_level: LogLevel,

    /// Log file path (None = stderr)
    pub log_file: Option<PathBuf>,

    /// Verbose logging (overrides log_level with debug)
    pub verbose: bool,

    /// Where result callbacks run unless a call names its own context
    pub callback_context: ContextMode,

    /// Where connection events are delivered to façades
    pub event_context: ContextMode,

    /// Thread name for the callback dispatcher
    pub dispatcher_name: String,

    /// Thread name for the event dispatcher
    pub event_dispatcher_name: String,

    /// Default wait for a call's result, in milliseconds
    pub default_timeout_ms: u64,

    /// Name of the host process the façades belong to
    pub host_name: String,

    /// Optional attribution tag; distinct tags get distinct connections
    pub attribution_tag: Option<String>,
}

fn default_dispatcher_name() -> String {
    "conduit-callbacks".to_string()
}

fn default_event_dispatcher_name() -> String {
    "conduit-events".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_host_name() -> String {
    "conduit".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_file: None,
            verbose: false,
            callback_context: ContextMode::Dispatcher,
            event_context: ContextMode::Immediate,
            dispatcher_name: default_dispatcher_name(),
            event_dispatcher_name: default_event_dispatcher_name(),
            default_timeout_ms: default_timeout_ms(),
            host_name: default_host_name(),
            attribution_tag: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Reject settings the host cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(ConduitError::Config(
                "default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.host_name.trim().is_empty() {
            return Err(ConduitError::Config("host_name must not be empty".to_string()));
        }
        if self.callback_context == ContextMode::Dispatcher && self.dispatcher_name.is_empty() {
            return Err(ConduitError::Config(
                "dispatcher_name must not be empty".to_string(),
            ));
        }
        if self.event_context == ContextMode::Dispatcher && self.event_dispatcher_name.is_empty()
        {
            return Err(ConduitError::Config(
                "event_dispatcher_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
