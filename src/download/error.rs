// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the download engine.
//!
//! - [`DownloadError`]: rejected API calls (bad submission, unknown task).
//! - [`TransferError`]: one failed attempt of a strategy, classified as
//!   [`FailureKind::Transient`] or [`FailureKind::Permanent`].
//! - [`TaskFailure`]: the terminal failure attached to a task report.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::types::TaskId;

/// Errors returned by [`DownloadManager`](super::DownloadManager) operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// The request is malformed; never retried.
    #[error("invalid request #{index}: {reason}")]
    InvalidRequest { index: usize, reason: String },

    /// Another task is already writing to this destination.
    #[error("destination {} is in use by running task {owner}", .path.display())]
    DestinationBusy { path: PathBuf, owner: TaskId },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The worker pool has been shut down.
    #[error("download manager is shut down")]
    ShutDown,
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// Network blip, 5xx, idle timeout, fetch-process failure
    Transient,
    /// 4xx, disk full, permission denied, missing fetch binary, bad URL
    Permanent,
}

/// Failure of a single transfer attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server answered HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("no progress for {}s", .0.as_secs())]
    IdleTimeout(Duration),

    #[error("transfer ended early: {done} of {expected} bytes")]
    Incomplete { done: u64, expected: u64 },

    #[error("transfer produced no data")]
    Empty,

    #[error("fetch process exited with {}: {diagnostic}", exit_code_label(.code))]
    FetchProcess { code: Option<i32>, diagnostic: String },

    #[error("fetch binary unavailable: {0}")]
    FetchBinaryMissing(String),

    #[error("destination {} is not writable: {reason}", .path.display())]
    DestinationUnwritable { path: PathBuf, reason: String },

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("downloaded file not found at {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "a signal".to_string(),
    }
}

impl TransferError {
    /// Classify the failure for the retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Network(_)
            | TransferError::IdleTimeout(_)
            | TransferError::Incomplete { .. }
            | TransferError::Empty
            | TransferError::FetchProcess { .. }
            | TransferError::ChecksumMismatch { .. } => FailureKind::Transient,
            TransferError::HttpStatus { status } => classify_status(*status),
            TransferError::FetchBinaryMissing(_)
            | TransferError::DestinationUnwritable { .. }
            | TransferError::InvalidSource(_)
            | TransferError::OutputMissing(_)
            | TransferError::Cancelled => FailureKind::Permanent,
        }
    }

    /// Map a filesystem error on the destination.
    pub fn from_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        TransferError::DestinationUnwritable {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// 5xx, 408 and 429 are worth retrying; every other status is final.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

/// Why a task ended up failed, in terms the caller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// No fetch binary; the caller must fall back to another source
    FetchBinaryUnavailable,
    /// Transient failures until the attempt cap
    RetriesExhausted,
    /// Destination could not be written
    DestinationUnwritable,
    /// Any other permanent failure (4xx, bad URL, missing output)
    Rejected,
}

/// Terminal failure of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error: TransferError,
    pub kind: FailureKind,
    pub reason: FailureReason,
    /// Attempts made, including the failing one
    pub attempts: u32,
}

impl TaskFailure {
    pub fn new(error: TransferError, attempts: u32) -> Self {
        let kind = error.kind();
        let reason = match (&error, kind) {
            (TransferError::FetchBinaryMissing(_), _) => FailureReason::FetchBinaryUnavailable,
            (TransferError::DestinationUnwritable { .. }, _) => FailureReason::DestinationUnwritable,
            (_, FailureKind::Transient) => FailureReason::RetriesExhausted,
            (_, FailureKind::Permanent) => FailureReason::Rejected,
        };
        Self {
            error,
            kind,
            reason,
            attempts,
        }
    }

    /// Human-readable message; the three actionable reasons read differently.
    pub fn message(&self) -> String {
        match self.reason {
            FailureReason::FetchBinaryUnavailable => format!(
                "No torrent fetcher available, falling back to a direct download is required ({})",
                self.error
            ),
            FailureReason::RetriesExhausted => format!(
                "Transient failure, retries exhausted after {} attempt(s): {}",
                self.attempts, self.error
            ),
            FailureReason::DestinationUnwritable => {
                format!("Destination unwritable: {}", self.error)
            }
            FailureReason::Rejected => format!("Download failed: {}", self.error),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}
