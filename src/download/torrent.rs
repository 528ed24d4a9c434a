// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Torrent transfers, delegated to an external fetch binary (aria2c).
//!
//! The engine never speaks BitTorrent itself. It checks once whether the
//! binary can be started, spawns it with a fixed argument set per task and
//! reads its console summaries through [`TorrentProcessSupervisor`].

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::error::TransferError;
use super::strategy::{TransferContext, TransferOutcome};
use super::supervisor::{ProcessExit, TorrentProcessSupervisor};
use super::types::Progress;

/// Default name of the fetch binary.
pub const DEFAULT_FETCH_BINARY: &str = "aria2c";

const TORRENT_SUFFIXES: &[&str] = &[".torrent"];
const MAGNET_SCHEMES: &[&str] = &["magnet:"];
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const INSTALL_HINT: &str = "aria2c is not installed. To enable torrent downloads:

Ubuntu/Debian:  sudo apt install aria2
Fedora/RHEL:    sudo dnf install aria2
openSUSE:       sudo zypper install aria2
Arch Linux:     sudo pacman -S aria2
macOS:          brew install aria2";

/// Returns true if `source` is a `.torrent` URL or a magnet link.
///
/// Pure; safe to call before submitting a request.
pub fn is_torrent_source(source: &str) -> bool {
    let lower = source.trim().to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or("");
    TORRENT_SUFFIXES.iter().any(|s| path.ends_with(s))
        || MAGNET_SCHEMES.iter().any(|s| lower.starts_with(s))
}

/// Result of probing the fetch binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    /// Version line when available, install instructions otherwise
    pub message: String,
}

impl Availability {
    pub fn available(message: impl Into<String>) -> Self {
        Self {
            available: true,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            available: false,
            message: message.into(),
        }
    }
}

/// The external fetch binary, with a probe result memoized for the
/// lifetime of this value.
///
/// Construct with [`FetchBinary::new`] to probe lazily, or with
/// [`FetchBinary::with_availability`] to inject a known result.
#[derive(Debug)]
pub struct FetchBinary {
    program: PathBuf,
    probed: OnceLock<Availability>,
}

impl Default for FetchBinary {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_BINARY)
    }
}

impl FetchBinary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            probed: OnceLock::new(),
        }
    }

    /// Use a fixed probe result instead of spawning the binary.
    pub fn with_availability(program: impl Into<PathBuf>, availability: Availability) -> Self {
        let probed = OnceLock::new();
        let _ = probed.set(availability);
        Self {
            program: program.into(),
            probed,
        }
    }

    /// A fetch binary that is known to be missing.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_availability(DEFAULT_FETCH_BINARY, Availability::unavailable(message))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Probe result; spawns `<program> --version` on first call only.
    ///
    /// Blocks for up to two seconds on the first call.
    pub fn availability(&self) -> &Availability {
        self.probed.get_or_init(|| probe(&self.program))
    }

    /// `(available, diagnostic message)` pair for callers.
    pub fn is_available(&self) -> (bool, String) {
        let a = self.availability();
        (a.available, a.message.clone())
    }
}

fn probe(program: &Path) -> Availability {
    let spawned = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(program = %program.display(), "fetch binary not found");
            return Availability::unavailable(INSTALL_HINT);
        }
        Err(e) => {
            warn!(program = %program.display(), error = %e, "fetch binary could not be started");
            return Availability::unavailable(format!(
                "{} could not be started: {}\n\n{}",
                program.display(),
                e,
                INSTALL_HINT
            ));
        }
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if started.elapsed() >= PROBE_TIMEOUT => {
                let _ = child.kill();
                let _ = child.wait();
                return Availability::available(format!("{} is available", program.display()));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(_) => break,
        }
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    let version = stdout.lines().next().map(str::trim).filter(|l| !l.is_empty());
    let message = match version {
        Some(v) => format!("{} is available: {}", program.display(), v),
        None => format!("{} is available", program.display()),
    };
    debug!(%message, "fetch binary probe");
    Availability::available(message)
}

/// Fixed argument set for one torrent download.
///
/// Only `dir` and `source` vary, and both are passed as separate process
/// arguments. `source` must already be validated as a URL or magnet link so
/// it cannot be read as an option.
pub fn fetch_args(dir: &Path, source: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--dir".into(), dir.as_os_str().to_owned()];
    args.extend(
        [
            "--seed-time=0",
            "--summary-interval=1",
            "--console-log-level=notice",
            "--max-connection-per-server=5",
            "--split=5",
            "--file-allocation=none",
            "--check-certificate=true",
        ]
        .iter()
        .map(OsString::from),
    );
    args.push(source.into());
    args
}

/// Path of the fetch binary's resume control file for `destination`.
pub fn control_file(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".aria2");
    PathBuf::from(name)
}

/// Total size of the regular files under `dir`.
fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Torrent strategy: one supervised fetch process per attempt.
#[derive(Debug, Clone)]
pub struct TorrentTransfer {
    fetch: Arc<FetchBinary>,
    source: String,
    destination: PathBuf,
}

impl TorrentTransfer {
    pub fn new(fetch: Arc<FetchBinary>, source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            fetch,
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub async fn execute(&self, ctx: &mut TransferContext) -> Result<TransferOutcome, TransferError> {
        let fetch = Arc::clone(&self.fetch);
        let availability = tokio::task::spawn_blocking(move || fetch.availability().clone())
            .await
            .map_err(|e| TransferError::FetchBinaryMissing(format!("probe failed: {}", e)))?;
        if !availability.available {
            return Err(TransferError::FetchBinaryMissing(availability.message));
        }

        let dir = match self.destination.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::from_io(&dir, &e))?;

        let supervisor = TorrentProcessSupervisor::new(self.fetch.program(), fetch_args(&dir, &self.source));
        let exit = supervisor
            .run(&mut ctx.stop, &ctx.progress, Progress::default())
            .await?;

        match exit {
            ProcessExit::Stopped(_) => Err(TransferError::Cancelled),
            ProcessExit::Exited {
                success: true,
                progress,
                ..
            } => self.resolve_output(progress).await,
            ProcessExit::Exited { code, diagnostics, .. } => Err(TransferError::FetchProcess {
                code,
                diagnostic: diagnostics.join("\n"),
            }),
        }
    }

    async fn resolve_output(&self, mut progress: Progress) -> Result<TransferOutcome, TransferError> {
        let meta = tokio::fs::metadata(&self.destination)
            .await
            .map_err(|_| TransferError::OutputMissing(self.destination.clone()))?;

        let size = if meta.is_file() {
            meta.len()
        } else {
            // multi-file torrents land in a directory
            let dir = self.destination.clone();
            tokio::task::spawn_blocking(move || dir_size(&dir))
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or(0)
        };
        if size == 0 {
            return Err(TransferError::OutputMissing(self.destination.clone()));
        }
        progress.bytes_done = size;
        progress.bytes_total = Some(size);
        progress.rate_bytes_per_sec = 0;
        progress.eta_secs = Some(0);

        Ok(TransferOutcome {
            path: self.destination.clone(),
            progress,
        })
    }

    /// Remove everything an interrupted attempt left behind.
    ///
    /// The fetch binary's partial state is opaque, so nothing is kept.
    pub async fn discard_partial(&self) {
        for path in [self.destination.clone(), control_file(&self.destination)] {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                }
                Ok(_) => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Err(_) => {}
            }
        }
    }
}
