// src/logger.rs

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::config::RuntimeConfig;

/// Target of the per-activation events written by components.
pub const ACTIVATION_TARGET: &str = "activation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive for the text log.
    pub level: String,
    /// Log to files here. `None` logs to stdout.
    pub dir: Option<PathBuf>,
    pub file: String,
    /// JSON lines, one per activation/deactivation.
    pub events_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: "ipflow.log".to_string(),
            events_file: "ipflow-events.log".to_string(),
        }
    }
}

impl From<&RuntimeConfig> for LogConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            level: config.log_level.clone(),
            dir: config.log_dir.clone(),
            ..Self::default()
        }
    }
}

fn appender(dir: &Path, file: &str) -> anyhow::Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .build(dir)
        .with_context(|| format!("creating rolling log {} in {}", file, dir.display()))
}

/// Install the global subscriber.
///
/// With a log directory this writes a daily-rotated text log plus a JSON
/// log that only carries `activation` events. Without one it logs to stdout.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<bool> {
    let installed = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;

            let txt_layer = fmt::layer()
                .with_writer(appender(dir, &config.file)?)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&config.level));

            let json_layer = fmt::layer()
                .json()
                .with_writer(appender(dir, &config.events_file)?)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{ACTIVATION_TARGET}=info")));

            Registry::default().with(txt_layer).with(json_layer).try_init()
        }
        None => Registry::default()
            .with(fmt::layer().with_target(true).with_filter(EnvFilter::new(&config.level)))
            .try_init(),
    };
    Ok(installed.is_ok())
}
