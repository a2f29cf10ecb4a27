// src/config.rs

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::component::OutputOrder;

pub const LOG_LEVEL: &str = "IPFLOW_LOG_LEVEL";
pub const LOG_DIR: &str = "IPFLOW_LOG_DIR";
pub const EVENT_CAPACITY: &str = "IPFLOW_EVENT_CAPACITY";
pub const DEFAULT_ORDERING: &str = "IPFLOW_DEFAULT_ORDERING";
pub const DEBUG: &str = "IPFLOW_DEBUG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Where configuration values come from.
pub trait ConfigSource: Send + Sync {
    fn keys(&self) -> Vec<String>;
    fn get(&self, key: &str) -> Option<String>;

    fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys() {
            if let Some(value) = self.get(&key) {
                config.push((key, value));
            }
        }
        config
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    env_file: Option<PathBuf>,
}

impl EnvConfig {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        if let Some(path) = &env_file {
            if path.exists() {
                dotenvy::from_path(path).ok();
                info!("Loaded .env from {}", path.display());
            } else {
                warn!("could not load .env from {}", path.display())
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }
}

impl ConfigSource for EnvConfig {
    fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// In-memory source, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

impl ConfigSource for MapConfig {
    fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `EnvFilter` directive, e.g. `info` or `ipflow=debug`.
    pub log_level: String,
    /// Write rolling log files here instead of stdout.
    pub log_dir: Option<PathBuf>,
    /// Buffer size of the network event channel.
    pub event_capacity: usize,
    /// Ordering for components that do not pick one.
    pub default_ordering: OutputOrder,
    /// Publish a `Packet` event for every socket delivery.
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            event_capacity: 1024,
            default_ordering: OutputOrder::Ordered,
            debug: false,
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl RuntimeConfig {
    /// Defaults, overridden by whatever `source` provides.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(level) = source.get(LOG_LEVEL) {
            config.log_level = level;
        }
        if let Some(dir) = source.get(LOG_DIR).filter(|dir| !dir.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = source.get(EVENT_CAPACITY) {
            config.event_capacity = match raw.trim().parse::<usize>() {
                Ok(0) => return Err(invalid(EVENT_CAPACITY, &raw, "must be at least 1")),
                Ok(capacity) => capacity,
                Err(e) => return Err(invalid(EVENT_CAPACITY, &raw, e)),
            };
        }
        if let Some(raw) = source.get(DEFAULT_ORDERING) {
            config.default_ordering = raw
                .parse()
                .map_err(|e: String| invalid(DEFAULT_ORDERING, &raw, e))?;
        }
        if let Some(raw) = source.get(DEBUG) {
            config.debug = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => return Err(invalid(DEBUG, &raw, "expected a boolean")),
            };
        }
        Ok(config)
    }

    pub fn from_env(env_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_source(&EnvConfig::new(env_file))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
