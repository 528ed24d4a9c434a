// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing setup.
//!
//! Two outputs: the full log goes to a file in the config directory, and
//! only warnings and errors reach the terminal so progress bars stay
//! readable. `RUST_LOG` overrides the file level when set.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "distroget.log";

/// Log levels selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tracing_level().as_str().to_ascii_lowercase())
    }
}

/// Default log file: `~/.config/distroget/distroget.log`.
pub fn default_log_file() -> Result<PathBuf> {
    Ok(crate::config::get_config_dir()?.join(LOG_FILE_NAME))
}

/// Install the global subscriber and return the log file in use.
///
/// The file is appended to, never truncated.
pub fn init_logging(level: LogLevel, log_file: Option<&Path>) -> Result<PathBuf> {
    let path = match log_file {
        Some(p) => p.to_path_buf(),
        None => default_log_file()?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(file_filter);

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(level = %level, file = %path.display(), "logging initialized");
    Ok(path)
}
