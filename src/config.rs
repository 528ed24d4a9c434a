// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent user configuration.
//!
//! Stored as pretty-printed JSON in `~/.config/distroget/config.json`.
//! Missing fields fall back to their defaults, so older files keep loading.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::{EngineOptions, RetryPolicy};

const CONFIG_FILE: &str = "config.json";

/// Remote target for the deploy hand-off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    /// rsync destination, e.g. `root@pve:/var/lib/vz/template/iso/`
    pub destination: String,
    /// Extra rsync flags, one per element
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where downloads land; supports `~` and `$VAR`
    pub download_dir: String,
    pub max_concurrency: usize,
    /// Item labels that are handed to the deploy transport when complete
    pub auto_deploy_items: BTreeSet<String>,
    pub retry: RetryPolicy,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub fetch_binary: String,
    pub skip_existing: bool,
    pub decompress: bool,
    pub keep_partial_on_cancel: bool,
    pub deploy: Option<DeployTarget>,
}

fn default_download_dir() -> String {
    "~/Downloads/distroget".to_string()
}

fn default_max_concurrency() -> usize {
    3
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_fetch_binary() -> String {
    "aria2c".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrency: default_max_concurrency(),
            auto_deploy_items: BTreeSet::new(),
            retry: RetryPolicy::default(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            fetch_binary: default_fetch_binary(),
            skip_existing: true,
            decompress: true,
            keep_partial_on_cancel: false,
            deploy: None,
        }
    }
}

impl Config {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay > self.retry.max_delay {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay.as_millis(),
                self.retry.max_delay.as_millis()
            );
        }
        if self.fetch_binary.trim().is_empty() {
            bail!("fetch_binary must not be empty");
        }
        if self.idle_timeout_secs == 0 {
            bail!("idle_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Download directory with `~` and `$VAR` expanded.
    pub fn download_dir(&self) -> PathBuf {
        expand_path(&self.download_dir)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_concurrency: self.max_concurrency.max(1),
            retry: self.retry,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            skip_existing: self.skip_existing,
            decompress: self.decompress,
        }
    }

    /// Read a config file; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// `~/.config/distroget`, created on first use.
pub fn get_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not find home directory")?;
    let config_dir = base.join("distroget");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }
    Ok(config_dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

pub fn load_config() -> Result<Config> {
    Config::load_from(&config_path()?)
}

pub fn save_config(config: &Config) -> Result<()> {
    config.save_to(&config_path()?)
}

/// Expand a leading `~` and any `$VAR` / `${VAR}` references.
///
/// Unknown variables are left as written.
pub fn expand_path(raw: &str) -> PathBuf {
    let with_home = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => format!("{}{}", home.display(), rest),
            None => raw.to_string(),
        },
        _ => raw.to_string(),
    };
    PathBuf::from(expand_vars(&with_home))
}

fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&(_, n)) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        let closed = if braced {
            chars.next_if(|&(_, n)| n == '}').is_some()
        } else {
            true
        };

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() && closed => out.push_str(&value),
            _ => {
                let end = chars.peek().map(|&(j, _)| j).unwrap_or(input.len());
                out.push_str(&input[i..end]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.retry.max_delay, Duration::from_millis(30000));
        assert_eq!(config.idle_timeout_secs, 300);
        assert_eq!(config.fetch_binary, "aria2c");
        assert!(config.skip_existing);
        assert!(config.decompress);
        assert!(!config.keep_partial_on_cancel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"max_concurrency": 5}"#).expect("parse");
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.read_timeout_secs, 60);
        assert_eq!(config.fetch_binary, "aria2c");
    }

    #[test]
    fn test_retry_fields_are_milliseconds() {
        let config: Config =
            serde_json::from_str(r#"{"retry": {"max_attempts": 5, "base_delay_ms": 250, "max_delay_ms": 4000}}"#)
                .expect("parse");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(4));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.download_dir = "/srv/iso".to_string();
        config.auto_deploy_items.insert("debian-12".to_string());
        config.deploy = Some(DeployTarget {
            destination: "root@pve:/var/lib/vz/template/iso/".to_string(),
            extra_args: vec!["--bwlimit=50000".to_string()],
        });
        config.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let loaded = Config::load_from(&dir.path().join("absent.json")).expect("load");
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_concurrency": 0}"#).expect("write");
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "not json").expect("write");
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_engine_options() {
        let mut config = Config::default();
        config.max_concurrency = 7;
        config.decompress = false;
        let options = config.engine_options();
        assert_eq!(options.max_concurrency, 7);
        assert_eq!(options.idle_timeout, Duration::from_secs(300));
        assert!(!options.decompress);
    }

    #[test]
    fn test_expand_vars() {
        std::env::set_var("DISTROGET_TEST_ROOT", "/data");
        assert_eq!(expand_vars("$DISTROGET_TEST_ROOT/iso"), "/data/iso");
        assert_eq!(expand_vars("${DISTROGET_TEST_ROOT}/iso"), "/data/iso");
        assert_eq!(expand_vars("/plain/path"), "/plain/path");
        assert_eq!(expand_vars("$DISTROGET_TEST_UNSET_VAR/x"), "$DISTROGET_TEST_UNSET_VAR/x");
        assert_eq!(expand_vars("cost$"), "cost$");
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/iso"), home.join("iso"));
        }
        assert_eq!(expand_path("~user/iso"), PathBuf::from("~user/iso"));
    }
}
