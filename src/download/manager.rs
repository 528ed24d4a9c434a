// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: a fixed pool of workers over one FIFO queue.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::sync::resilient_lock;

use super::error::{DownloadError, TaskFailure, TransferError};
use super::http::build_client;
use super::postprocess::{post_process, Compression};
use super::retry::{RetryDecision, RetryPolicy};
use super::state::{Dispatch, TaskRegistry};
use super::strategy::{
    stop_requested, ProgressSink, StopSignal, Transfer, TransferContext, TransferFactory, TransferOutcome,
};
use super::torrent::FetchBinary;
use super::types::{Progress, Summary, TaskEvent, TaskId, TaskReport, TaskSnapshot, TransferKind, TransferRequest};
use super::verify::verify_file;

/// Immutable engine settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Worker count; at least 1
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Fail an attempt when no bytes arrive for this long
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest wait for a single HTTP body chunk
    pub read_timeout: Duration,
    /// Complete immediately if the artifact is already on disk
    pub skip_existing: bool,
    /// Decompress `.gz`, `.bz2` and `.zip` artifacts after download
    pub decompress: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            skip_existing: true,
            decompress: true,
        }
    }
}

/// Handle to a task, allowing status checks.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
    snapshot_rx: watch::Receiver<TaskSnapshot>,
}

impl TaskHandle {
    /// Get the current snapshot.
    pub fn snapshot(&self) -> TaskSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Check if the task has ended.
    pub fn is_finished(&self) -> bool {
        self.snapshot_rx.borrow().state.is_terminal()
    }

    /// Wait for the task to end.
    pub async fn wait(&mut self) -> TaskSnapshot {
        loop {
            if self.snapshot_rx.borrow().state.is_terminal() {
                return self.snapshot_rx.borrow().clone();
            }
            if self.snapshot_rx.changed().await.is_err() {
                return self.snapshot_rx.borrow().clone();
            }
        }
    }
}

struct Shared {
    registry: Mutex<TaskRegistry>,
    notify: Notify,
    options: EngineOptions,
    factory: TransferFactory,
    shut_down: AtomicBool,
}

/// Manager for concurrent downloads.
///
/// Requests are queued in submission order and executed by
/// `max_concurrency` workers. Must be created inside a tokio runtime.
pub struct DownloadManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Create a manager and start its workers.
    pub fn new(options: EngineOptions, fetch: Arc<FetchBinary>) -> Result<Self> {
        let client = build_client(options.connect_timeout).context("Failed to build HTTP client")?;
        let factory = TransferFactory::new(client, fetch, options.read_timeout);

        let workers = options.max_concurrency.max(1);
        let shared = Arc::new(Shared {
            registry: Mutex::new(TaskRegistry::new()),
            notify: Notify::new(),
            options,
            factory,
            shut_down: AtomicBool::new(false),
        });

        let handles = (0..workers)
            .map(|n| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { Self::worker_loop(shared, n).await })
            })
            .collect();

        info!(workers, "download manager started");
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    /// The fetch binary torrent tasks use.
    pub fn fetch_binary(&self) -> &Arc<FetchBinary> {
        self.shared.factory.fetch_binary()
    }

    /// Queue a batch of requests.
    ///
    /// The batch is validated as a whole: if any request is malformed or
    /// targets a destination a running task is writing to, nothing is
    /// queued.
    pub fn submit(&self, requests: Vec<TransferRequest>) -> Result<Vec<TaskId>, DownloadError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(DownloadError::ShutDown);
        }
        for (index, request) in requests.iter().enumerate() {
            validate_request(request).map_err(|reason| DownloadError::InvalidRequest { index, reason })?;
        }

        let ids = {
            let mut registry = resilient_lock(&self.shared.registry);
            for request in &requests {
                registry.check_destination(&request.destination)?;
            }
            requests
                .into_iter()
                .map(|request| {
                    debug!(source = %request.source, dest = %request.destination.display(), "queued");
                    registry.insert(request)
                })
                .collect::<Vec<_>>()
        };

        for _ in &ids {
            self.shared.notify.notify_one();
        }
        Ok(ids)
    }

    /// Convenience wrapper for a single request.
    pub fn submit_one(&self, request: TransferRequest) -> Result<TaskId, DownloadError> {
        let ids = self.submit(vec![request])?;
        ids.into_iter().next().ok_or(DownloadError::ShutDown)
    }

    /// Stream of progress, state and final events for `id`.
    ///
    /// Events are pushed without blocking the worker; the channel closes
    /// after the `Finished` event.
    pub fn subscribe(&self, id: TaskId) -> Result<mpsc::UnboundedReceiver<TaskEvent>, DownloadError> {
        resilient_lock(&self.shared.registry).subscribe(id)
    }

    pub fn handle(&self, id: TaskId) -> Result<TaskHandle, DownloadError> {
        let snapshot_rx = resilient_lock(&self.shared.registry).watch(id)?;
        Ok(TaskHandle { id, snapshot_rx })
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        resilient_lock(&self.shared.registry).snapshot(id)
    }

    pub fn report(&self, id: TaskId) -> Option<TaskReport> {
        resilient_lock(&self.shared.registry).report(id)
    }

    /// Number of tasks currently owned by a worker.
    pub fn running_count(&self) -> usize {
        resilient_lock(&self.shared.registry).running_count()
    }

    /// Get task statistics: (queued, running, completed, failed, cancelled).
    pub fn stats(&self) -> (usize, usize, usize, usize, usize) {
        resilient_lock(&self.shared.registry).status_counts()
    }

    /// Cancel a task. Cancelling a task that already ended is a no-op.
    pub fn cancel(&self, id: TaskId) -> Result<(), DownloadError> {
        info!(task = %id, "cancel requested");
        resilient_lock(&self.shared.registry).cancel(id)
    }

    pub fn cancel_all(&self) {
        info!("cancelling all tasks");
        resilient_lock(&self.shared.registry).cancel_all();
    }

    /// Wait until every submitted task has ended.
    pub async fn wait_all(&self) -> Summary {
        let mut outstanding = resilient_lock(&self.shared.registry).outstanding();
        let _ = outstanding.wait_for(|n| *n == 0).await;
        resilient_lock(&self.shared.registry).summary()
    }

    /// Cancel everything and stop the workers.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.cancel_all();
        self.shared.notify.notify_waiters();

        let handles = std::mem::take(&mut *resilient_lock(&self.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("download worker ended abnormally: {}", e);
            }
        }
        info!("download manager shut down");
    }

    async fn worker_loop(shared: Arc<Shared>, worker: usize) {
        loop {
            let notified = shared.notify.notified();
            if shared.shut_down.load(Ordering::SeqCst) {
                debug!(worker, "worker exiting");
                return;
            }
            let next = resilient_lock(&shared.registry).next_dispatch();
            match next {
                Some(dispatch) => Self::run_task(&shared, dispatch).await,
                None => notified.await,
            }
        }
    }

    async fn run_task(shared: &Arc<Shared>, dispatch: Dispatch) {
        let Dispatch {
            id,
            request,
            attempt,
            stop,
        } = dispatch;
        let options = &shared.options;
        info!(task = %id, attempt, source = %request.source, dest = %request.destination.display(), "transfer started");

        if attempt == 1 && options.skip_existing {
            if let Some((artifact, size)) = existing_artifact(&request, options.decompress).await {
                info!(task = %id, path = %artifact.display(), "already downloaded, skipping");
                resilient_lock(&shared.registry).complete(id, Progress::new(size, Some(size)), artifact, None);
                return;
            }
        }

        let transfer = shared.factory.build(&request);
        let activity = Arc::new(Mutex::new((Instant::now(), 0u64)));
        let sink = {
            let shared = Arc::clone(shared);
            let activity = Arc::clone(&activity);
            ProgressSink::new(move |progress: Progress| {
                {
                    let mut last = resilient_lock(&activity);
                    if progress.bytes_done > last.1 {
                        *last = (Instant::now(), progress.bytes_done);
                    }
                }
                resilient_lock(&shared.registry).report_progress(id, attempt, progress);
            })
        };
        let mut ctx = TransferContext {
            id,
            attempt,
            stop: stop.subscribe(),
            progress: sink,
        };

        let result = run_with_watchdog(&transfer, &mut ctx, &stop, &activity, options.idle_timeout).await;
        let result = match result {
            Ok(outcome) => finalize(&request, outcome, options.decompress).await,
            Err(e) => Err(e),
        };

        let cancelling = resilient_lock(&shared.registry).is_cancelling(id);
        let signal = *stop.borrow();

        match result {
            Ok(done) => {
                info!(task = %id, artifact = %done.artifact.display(), bytes = done.progress.bytes_done, "transfer completed");
                if let Some(warning) = &done.warning {
                    warn!(task = %id, "{}", warning);
                }
                resilient_lock(&shared.registry).complete(id, done.progress, done.artifact, done.warning);
            }
            Err(_) if cancelling || signal == StopSignal::Cancel => {
                transfer.discard_partial(request.keep_partial).await;
                info!(task = %id, "transfer cancelled");
                resilient_lock(&shared.registry).finish_cancelled(id);
            }
            Err(e) => {
                let e = match e {
                    TransferError::Cancelled if signal == StopSignal::Idle => {
                        TransferError::IdleTimeout(options.idle_timeout)
                    }
                    other => other,
                };
                Self::handle_failure(shared, id, &request, &transfer, attempt, e).await;
            }
        }
    }

    async fn handle_failure(
        shared: &Arc<Shared>,
        id: TaskId,
        request: &TransferRequest,
        transfer: &Transfer,
        attempt: u32,
        error: TransferError,
    ) {
        match shared.options.retry.decide(attempt, error.kind()) {
            RetryDecision::Retry { delay } => {
                warn!(task = %id, attempt, delay_ms = delay.as_millis() as u64, error = %error, "transfer failed, retrying");
                let Some(mut backoff) = resilient_lock(&shared.registry).schedule_retry(id, &error, delay) else {
                    return;
                };

                let shared = Arc::clone(shared);
                let transfer = transfer.clone();
                let keep_partial = request.keep_partial;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_requested(&mut backoff) => {}
                    }
                    if resilient_lock(&shared.registry).requeue(id) {
                        shared.notify.notify_one();
                        return;
                    }
                    transfer.discard_partial(keep_partial).await;
                    info!(task = %id, "transfer cancelled during backoff");
                    resilient_lock(&shared.registry).finish_cancelled(id);
                });
            }
            RetryDecision::GiveUp => {
                transfer.discard_partial(request.keep_partial).await;
                let failure = TaskFailure::new(error, attempt);
                error!(task = %id, attempts = attempt, kind = ?failure.kind, "{}", failure);
                resilient_lock(&shared.registry).fail(id, failure);
            }
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        resilient_lock(&self.shared.registry).cancel_all();
        self.shared.notify.notify_waiters();
    }
}

/// Run one attempt while watching for stalls.
///
/// When no new bytes arrive within `idle`, the attempt is stopped with
/// [`StopSignal::Idle`].
async fn run_with_watchdog(
    transfer: &Transfer,
    ctx: &mut TransferContext,
    stop: &watch::Sender<StopSignal>,
    activity: &Mutex<(Instant, u64)>,
    idle: Duration,
) -> Result<TransferOutcome, TransferError> {
    let period = (idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let execution = transfer.execute(ctx);
    tokio::pin!(execution);

    loop {
        tokio::select! {
            result = &mut execution => return result,
            _ = ticker.tick() => {
                let stalled = resilient_lock(activity).0.elapsed() >= idle;
                if stalled {
                    stop.send_if_modified(|s| {
                        if *s == StopSignal::Continue {
                            *s = StopSignal::Idle;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
    }
}

struct Finished {
    progress: Progress,
    artifact: PathBuf,
    warning: Option<String>,
}

/// Checksum, then decompression.
async fn finalize(
    request: &TransferRequest,
    outcome: TransferOutcome,
    decompress: bool,
) -> Result<Finished, TransferError> {
    let TransferOutcome { path, progress } = outcome;

    if let Some(expected) = request.expected_checksum.clone() {
        let target = path.clone();
        let verified = tokio::task::spawn_blocking(move || verify_file(&target, &expected))
            .await
            .map_err(|e| TransferError::Network(format!("checksum task failed: {}", e)))?;
        if let Err(e) = verified {
            if matches!(e, TransferError::ChecksumMismatch { .. }) {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return Err(e);
        }
        debug!(path = %path.display(), "checksum verified");
    }

    if !decompress {
        return Ok(Finished {
            progress,
            artifact: path,
            warning: None,
        });
    }
    let processed = post_process(path).await;
    Ok(Finished {
        progress,
        artifact: processed.artifact,
        warning: processed.warning,
    })
}

/// The artifact for `request` if it is already on disk, with its size.
async fn existing_artifact(request: &TransferRequest, decompress: bool) -> Option<(PathBuf, u64)> {
    let mut candidates = vec![request.destination.clone()];
    if decompress && matches!(Compression::detect(&request.destination), Some(Compression::Gzip | Compression::Bzip2)) {
        candidates.push(request.destination.with_extension(""));
    }

    for path in candidates {
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => continue,
        };
        if path == request.destination {
            if let Some(expected) = request.expected_checksum.clone() {
                let target = path.clone();
                let ok = tokio::task::spawn_blocking(move || verify_file(&target, &expected).is_ok())
                    .await
                    .unwrap_or(false);
                if !ok {
                    continue;
                }
            }
        }
        return Some((path, size));
    }
    None
}

/// Reason a request is malformed, if it is.
fn validate_request(request: &TransferRequest) -> Result<(), String> {
    let source = request.source.trim();
    if source.is_empty() {
        return Err("source is empty".to_string());
    }
    if source.starts_with('-') {
        return Err("source must not start with '-'".to_string());
    }
    if request.destination.as_os_str().is_empty() {
        return Err("destination is empty".to_string());
    }
    if request.destination.file_name().is_none() {
        return Err(format!("destination {} has no file name", request.destination.display()));
    }

    let lower = source.to_ascii_lowercase();
    if lower.starts_with("magnet:") {
        if request.kind != TransferKind::Torrent {
            return Err("magnet links need the torrent strategy".to_string());
        }
        if !lower.contains("xt=") {
            return Err("magnet link has no xt= parameter".to_string());
        }
        return Ok(());
    }

    let url = reqwest::Url::parse(source).map_err(|e| format!("malformed URL '{}': {}", source, e))?;
    match url.scheme() {
        "http" | "https" => {}
        "ftp" if request.kind == TransferKind::Torrent => {}
        other => return Err(format!("unsupported URL scheme '{}'", other)),
    }
    if url.host_str().is_none() {
        return Err(format!("URL '{}' has no host", source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request() {
        let ok = TransferRequest::new("https://example.com/a.iso", "/tmp/a.iso");
        assert!(validate_request(&ok).is_ok());

        let magnet = TransferRequest::new("magnet:?xt=urn:btih:ABC", "/tmp/a.iso");
        assert!(validate_request(&magnet).is_ok());

        for bad in ["", "   ", "not a url", "file:///etc/passwd", "-oProxyCommand=x", "magnet:?dn=x"] {
            let req = TransferRequest::new(bad, "/tmp/a.iso");
            assert!(validate_request(&req).is_err(), "accepted {:?}", bad);
        }

        let no_dest = TransferRequest::new("https://example.com/a.iso", "");
        assert!(validate_request(&no_dest).is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_whole_batch() {
        let manager = DownloadManager::new(EngineOptions::default(), Arc::new(FetchBinary::unavailable("missing")))
            .expect("manager");
        let batch = vec![
            TransferRequest::new("https://example.com/a.iso", "/tmp/a.iso"),
            TransferRequest::new("", "/tmp/b.iso"),
        ];
        match manager.submit(batch) {
            Err(DownloadError::InvalidRequest { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(manager.stats(), (0, 0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let manager = DownloadManager::new(EngineOptions::default(), Arc::new(FetchBinary::unavailable("missing")))
            .expect("manager");
        manager.shutdown().await;
        let err = manager
            .submit(vec![TransferRequest::new("https://example.com/a.iso", "/tmp/a.iso")])
            .expect_err("shut down");
        assert_eq!(err, DownloadError::ShutDown);
    }

    #[tokio::test]
    async fn test_existing_artifact_is_skipped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let dest = dir.path().join("present.iso");
        std::fs::write(&dest, b"already here").expect("write");

        let manager = DownloadManager::new(EngineOptions::default(), Arc::new(FetchBinary::unavailable("missing")))
            .expect("manager");
        // unroutable source: the task must not touch the network
        let id = manager
            .submit_one(TransferRequest::new("http://127.0.0.1:9/present.iso", &dest))
            .expect("submit");
        let summary = manager.wait_all().await;
        let report = summary.report(id).expect("report");
        assert_eq!(report.state, crate::download::TaskState::Completed);
        assert_eq!(report.progress.bytes_done, 12);
        assert_eq!(report.progress.bytes_total, Some(12));
    }
}
