// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer strategies and the context a worker hands them.
//!
//! A strategy runs one attempt: it starts the transfer, reports progress
//! through the [`ProgressSink`] and watches the stop channel. Cancellation
//! and idle timeouts arrive as a [`StopSignal`]; the strategy tears down and
//! returns [`TransferError::Cancelled`], and the worker decides what the
//! stop meant.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::error::TransferError;
use super::http::HttpTransfer;
use super::torrent::{FetchBinary, TorrentTransfer};
use super::types::{Progress, TaskId, TransferKind, TransferRequest};

/// Stop request sent from the manager to a running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Continue,
    /// Caller cancelled the task
    Cancel,
    /// No progress within the idle timeout
    Idle,
}

impl StopSignal {
    pub fn is_stop(&self) -> bool {
        !matches!(self, StopSignal::Continue)
    }
}

/// Wait until a stop is requested. A dropped sender counts as a cancel.
pub async fn stop_requested(stop: &mut watch::Receiver<StopSignal>) -> StopSignal {
    match stop.wait_for(StopSignal::is_stop).await {
        Ok(signal) => *signal,
        Err(_) => StopSignal::Cancel,
    }
}

/// Where strategies send progress snapshots.
#[derive(Clone)]
pub struct ProgressSink {
    report: Arc<dyn Fn(Progress) + Send + Sync>,
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

impl ProgressSink {
    pub fn new<F>(report: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Sink that forwards every snapshot into a channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |p| {
            let _ = tx.send(p);
        });
        (sink, rx)
    }

    pub fn report(&self, progress: Progress) {
        (self.report)(progress)
    }
}

/// Per-attempt state handed to a strategy.
#[derive(Debug)]
pub struct TransferContext {
    pub id: TaskId,
    /// 1-based attempt number
    pub attempt: u32,
    pub stop: watch::Receiver<StopSignal>,
    pub progress: ProgressSink,
}

/// Successful attempt.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Where the downloaded file is
    pub path: PathBuf,
    pub progress: Progress,
}

/// The strategy chosen for a request.
#[derive(Debug, Clone)]
pub enum Transfer {
    Http(HttpTransfer),
    Torrent(TorrentTransfer),
}

/// Builds strategies from shared resources.
#[derive(Debug, Clone)]
pub struct TransferFactory {
    client: reqwest::Client,
    fetch: Arc<FetchBinary>,
    read_timeout: Duration,
}

impl TransferFactory {
    pub fn new(client: reqwest::Client, fetch: Arc<FetchBinary>, read_timeout: Duration) -> Self {
        Self {
            client,
            fetch,
            read_timeout,
        }
    }

    pub fn fetch_binary(&self) -> &Arc<FetchBinary> {
        &self.fetch
    }

    /// Pick the strategy for `request` from its kind.
    pub fn build(&self, request: &TransferRequest) -> Transfer {
        match request.kind {
            TransferKind::Http => Transfer::Http(
                HttpTransfer::new(self.client.clone(), request.source.clone(), request.destination.clone())
                    .with_read_timeout(self.read_timeout),
            ),
            TransferKind::Torrent => Transfer::Torrent(TorrentTransfer::new(
                Arc::clone(&self.fetch),
                request.source.clone(),
                request.destination.clone(),
            )),
        }
    }
}

impl Transfer {
    /// Run one attempt to completion, failure or stop.
    pub async fn execute(&self, ctx: &mut TransferContext) -> Result<TransferOutcome, TransferError> {
        match self {
            Transfer::Http(t) => t.execute(ctx).await,
            Transfer::Torrent(t) => t.execute(ctx).await,
        }
    }

    /// Clean up after a cancelled attempt.
    ///
    /// `keep_partial` is honoured only by strategies that can resume.
    pub async fn discard_partial(&self, keep_partial: bool) {
        match self {
            Transfer::Http(t) if !keep_partial => t.discard_partial().await,
            Transfer::Http(_) => {}
            Transfer::Torrent(t) => t.discard_partial().await,
        }
    }
}
