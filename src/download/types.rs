// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the manager and the transfer strategies.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::error::TaskFailure;
use super::torrent::is_torrent_source;

/// Identifier assigned to a task when its request is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which transfer strategy executes a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Plain HTTP(S) streaming GET
    Http,
    /// Torrent file or magnet link, fetched by the external binary
    Torrent,
}

/// One entry of the source catalog: what to fetch and what to call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub display_name: String,
    pub source_url: String,
    pub suggested_filename: Option<String>,
}

impl CatalogEntry {
    pub fn new(display_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            source_url: source_url.into(),
            suggested_filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.suggested_filename = Some(filename.into());
        self
    }

    /// Filename the artifact should end up under.
    ///
    /// Falls back to the last URL path segment, then the magnet `dn=`
    /// parameter, then `"download"`.
    pub fn filename(&self) -> String {
        if let Some(name) = self.suggested_filename.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        filename_from_source(&self.source_url)
    }
}

/// Derive a local filename from a source URL or magnet link.
pub fn filename_from_source(source: &str) -> String {
    let parsed = Url::parse(source).ok();
    if source.to_ascii_lowercase().starts_with("magnet:") {
        return parsed
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, value)| key == "dn" && !value.is_empty())
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_else(|| "download".to_string());
    }

    let segment = match &parsed {
        Some(url) => url.path_segments().and_then(|mut s| s.next_back()).unwrap_or(""),
        None => {
            let path = source.split(['?', '#']).next().unwrap_or(source);
            path.rsplit('/').next().unwrap_or("")
        }
    };
    let segment = segment
        .strip_suffix(".torrent")
        .or_else(|| segment.strip_suffix(".TORRENT"))
        .unwrap_or(segment);
    if segment.is_empty() || segment.contains(':') {
        return "download".to_string();
    }
    // `+` is literal in a path; only %XX escapes are decoded
    let decoded = urlencoding::decode_binary(segment.as_bytes());
    String::from_utf8_lossy(&decoded).into_owned()
}

/// A request to materialize `source` at `destination`.
///
/// Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// HTTP(S) URL, `.torrent` URL or magnet link
    pub source: String,
    /// Final artifact path
    pub destination: PathBuf,
    /// Strategy used to fetch the source
    pub kind: TransferKind,
    /// Keep the partial file when the task is cancelled (HTTP only)
    pub keep_partial: bool,
    /// Expected hex digest of the downloaded file
    pub expected_checksum: Option<String>,
    /// Caller-side identifier, matched against deploy markers
    pub label: Option<String>,
}

impl TransferRequest {
    /// Create a request, picking the strategy from the source string.
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let kind = if is_torrent_source(&source) {
            TransferKind::Torrent
        } else {
            TransferKind::Http
        };
        Self {
            source,
            destination: destination.into(),
            kind,
            keep_partial: false,
            expected_checksum: None,
            label: None,
        }
    }

    /// Build a request for a catalog entry inside `download_dir`.
    pub fn from_catalog(entry: &CatalogEntry, download_dir: &Path) -> Self {
        Self::new(entry.source_url.clone(), download_dir.join(entry.filename()))
            .with_label(entry.display_name.clone())
    }

    pub fn with_kind(mut self, kind: TransferKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn keep_partial(mut self, keep: bool) -> Self {
        self.keep_partial = keep;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for a worker (also while backing off before a retry)
    Queued,
    /// Owned by a worker
    Running,
    /// Running, teardown requested
    Cancelling,
    /// Artifact is in place
    Completed,
    /// Gave up
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl TaskState {
    /// Returns true once the task can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// Returns true while a worker owns the task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Cancelling)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Cancelling => "cancelling",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Progress snapshot for one task.
///
/// Later snapshots supersede earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub rate_bytes_per_sec: u64,
    /// Open connections (torrent only)
    pub peers: Option<u32>,
    /// Connected seeders (torrent only)
    pub seeders: Option<u32>,
    /// Percentage as reported by the fetch binary
    pub percent: Option<u8>,
    pub eta_secs: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            bytes_done: 0,
            bytes_total: None,
            rate_bytes_per_sec: 0,
            peers: None,
            seeders: None,
            percent: None,
            eta_secs: None,
            timestamp: Utc::now(),
        }
    }
}

impl Progress {
    pub fn new(bytes_done: u64, bytes_total: Option<u64>) -> Self {
        Self {
            bytes_done,
            bytes_total,
            ..Self::default()
        }
    }

    /// Get progress percentage (0-100) if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(0.0),
            Some(total) => Some((self.bytes_done as f64 / total as f64) * 100.0),
            None => self.percent.map(f64::from),
        }
    }

    /// Fold a newer snapshot into this one.
    ///
    /// Fields the newer snapshot does not know keep their previous value.
    /// `bytes_done` never goes backwards and the timestamp never decreases.
    pub fn merge(&self, newer: &Progress) -> Progress {
        Progress {
            bytes_done: self.bytes_done.max(newer.bytes_done),
            bytes_total: newer.bytes_total.or(self.bytes_total),
            rate_bytes_per_sec: newer.rate_bytes_per_sec,
            peers: newer.peers.or(self.peers),
            seeders: newer.seeders.or(self.seeders),
            percent: newer.percent.or(self.percent),
            eta_secs: newer.eta_secs,
            timestamp: self.timestamp.max(newer.timestamp),
        }
    }

    /// Get formatted speed string.
    pub fn speed_string(&self) -> String {
        let bps = self.rate_bytes_per_sec;
        if bps >= 1_073_741_824 {
            format!("{:.1} GiB/s", bps as f64 / 1_073_741_824.0)
        } else if bps >= 1_048_576 {
            format!("{:.1} MiB/s", bps as f64 / 1_048_576.0)
        } else if bps >= 1024 {
            format!("{:.1} KiB/s", bps as f64 / 1024.0)
        } else {
            format!("{} B/s", bps)
        }
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        self.eta_secs.map(|secs| {
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

/// Event delivered to subscribers of a task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Progress { id: TaskId, progress: Progress },
    StateChanged { id: TaskId, state: TaskState, attempt: u32 },
    Finished { id: TaskId, report: TaskReport },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Progress { id, .. }
            | TaskEvent::StateChanged { id, .. }
            | TaskEvent::Finished { id, .. } => *id,
        }
    }
}

/// Point-in-time view of a task, published through [`TaskHandle`](super::TaskHandle).
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub attempt: u32,
    pub progress: Progress,
    pub message: String,
}

/// Final record of a task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TaskId,
    pub request: TransferRequest,
    pub state: TaskState,
    pub progress: Progress,
    pub failure: Option<TaskFailure>,
    /// Set when the download succeeded but post-processing did not
    pub warning: Option<String>,
    /// Path of the ready artifact (after decompression)
    pub artifact: Option<PathBuf>,
    /// Attempts beyond the first
    pub retries: u32,
    /// Task whose execution this one shared, if it was collapsed
    pub collapsed_into: Option<TaskId>,
}

/// Result of [`DownloadManager::wait_all`](super::DownloadManager::wait_all).
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub succeeded: Vec<TaskReport>,
    pub failed: Vec<TaskReport>,
    pub cancelled: Vec<TaskReport>,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    /// Look up the report of one task.
    pub fn report(&self, id: TaskId) -> Option<&TaskReport> {
        self.succeeded
            .iter()
            .chain(self.failed.iter())
            .chain(self.cancelled.iter())
            .find(|r| r.id == id)
    }
}
