//! End-to-end tests for the download manager.
//!
//! HTTP origins are simulated with a local axum server bound to an
//! ephemeral port. Torrent tests (Unix only) replace the fetch binary with
//! small shell scripts that mimic its console output and exit codes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use distroget::download::{
    Availability, DownloadManager, EngineOptions, FailureKind, FailureReason, FetchBinary, RetryPolicy,
    TaskEvent, TaskState, TransferError, TransferRequest,
};

const TEN_MIB: usize = 10 * 1024 * 1024;

// =============================================================================
// Helpers
// =============================================================================

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

fn options(max_concurrency: usize) -> EngineOptions {
    EngineOptions {
        max_concurrency,
        retry: RetryPolicy::new(3, Duration::from_millis(20), Duration::from_millis(100)),
        idle_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(10),
        skip_existing: true,
        decompress: true,
    }
}

fn no_fetcher() -> Arc<FetchBinary> {
    Arc::new(FetchBinary::unavailable("aria2c is not installed"))
}

/// Decrements the active counter when the response body is finished.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn slow_body(chunks: usize, chunk_size: usize, delay: Duration, guard: Option<ActiveGuard>) -> Body {
    let stream = futures_util::stream::unfold((0usize, guard), move |(i, guard)| async move {
        if i >= chunks {
            return None;
        }
        tokio::time::sleep(delay).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; chunk_size])), (i + 1, guard)))
    });
    Body::from_stream(stream)
}

async fn drain(mut events: tokio::sync::mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

// =============================================================================
// HTTP
// =============================================================================

#[tokio::test]
async fn test_transient_status_is_retried_then_completes() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/flaky.iso",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    Response::builder()
                        .status(StatusCode::SERVICE_UNAVAILABLE)
                        .body(Body::empty())
                        .expect("response")
                } else {
                    Response::builder()
                        .status(StatusCode::OK)
                        .body(Body::from(vec![7u8; TEN_MIB]))
                        .expect("response")
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("flaky.iso");

    let manager = DownloadManager::new(options(3), no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/flaky.iso", base), &dest))
        .expect("submit");
    let summary = manager.wait_all().await;

    let report = summary.report(id).expect("report");
    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(report.retries, 1);
    assert_eq!(report.progress.bytes_done, TEN_MIB as u64);
    assert_eq!(report.progress.bytes_total, Some(TEN_MIB as u64));
    assert_eq!(std::fs::metadata(&dest).expect("artifact").len(), TEN_MIB as u64);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(!dir.path().join("flaky.iso.part").exists());
}

#[tokio::test]
async fn test_not_found_fails_without_retry() {
    let base = serve(Router::new()).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("gone.iso");

    let manager = DownloadManager::new(options(2), no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/gone.iso", base), &dest))
        .expect("submit");
    let summary = manager.wait_all().await;

    let report = summary.report(id).expect("report");
    assert_eq!(report.state, TaskState::Failed);
    assert_eq!(report.retries, 0);
    let failure = report.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.reason, FailureReason::Rejected);
    assert_eq!(failure.error, TransferError::HttpStatus { status: 404 });
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_duplicate_destination_collapses_into_one_transfer() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/shared.iso",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                slow_body(5, 1024, Duration::from_millis(20), None)
            }),
        )
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("shared.iso");
    let url = format!("{}/shared.iso", base);

    let manager = DownloadManager::new(options(3), no_fetcher()).expect("manager");
    let ids = manager
        .submit(vec![TransferRequest::new(&url, &dest), TransferRequest::new(&url, &dest)])
        .expect("submit");
    let summary = manager.wait_all().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(summary.succeeded.len(), 2);
    let follower = summary.report(ids[1]).expect("report");
    assert_eq!(follower.collapsed_into, Some(ids[0]));
    assert_eq!(follower.progress.bytes_done, 5 * 1024);
}

#[tokio::test]
async fn test_cancel_while_queued_never_runs() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/blocker.iso",
            get(|| async { slow_body(50, 1024, Duration::from_millis(20), None) }),
        )
        .route(
            "/queued.iso",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "should not be fetched"
            }),
        )
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");

    let manager = DownloadManager::new(options(1), no_fetcher()).expect("manager");
    let ids = manager
        .submit(vec![
            TransferRequest::new(format!("{}/blocker.iso", base), dir.path().join("blocker.iso")),
            TransferRequest::new(format!("{}/queued.iso", base), dir.path().join("queued.iso")),
        ])
        .expect("submit");
    let events = manager.subscribe(ids[1]).expect("subscribe");

    manager.cancel(ids[1]).expect("cancel");
    manager.cancel(ids[0]).expect("cancel");
    let summary = manager.wait_all().await;
    let seen = drain(events).await;

    assert!(!seen
        .iter()
        .any(|e| matches!(e, TaskEvent::StateChanged { state: TaskState::Running, .. })));
    assert!(matches!(seen.last(), Some(TaskEvent::Finished { .. })));
    assert_eq!(summary.report(ids[1]).expect("report").state, TaskState::Cancelled);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("queued.iso").exists());
}

#[tokio::test]
async fn test_running_tasks_never_exceed_concurrency() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let state = (Arc::clone(&active), Arc::clone(&peak));
    let router = Router::new()
        .route(
            "/slow.iso",
            get(
                |State((active, peak)): State<(Arc<AtomicUsize>, Arc<AtomicUsize>)>| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    slow_body(5, 512, Duration::from_millis(30), Some(ActiveGuard(active)))
                },
            ),
        )
        .with_state(state);
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");

    let manager = Arc::new(DownloadManager::new(options(3), no_fetcher()).expect("manager"));
    let requests = (0..10)
        .map(|i| TransferRequest::new(format!("{}/slow.iso?n={}", base, i), dir.path().join(format!("{}.iso", i))))
        .collect();
    manager.submit(requests).expect("submit");

    let sampler = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut max_seen = 0;
            loop {
                let (queued, running, ..) = manager.stats();
                max_seen = max_seen.max(running);
                if queued == 0 && running == 0 {
                    return max_seen;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let summary = manager.wait_all().await;
    let max_running = sampler.await.expect("sampler");

    assert_eq!(summary.succeeded.len(), 10);
    assert!(max_running <= 3, "saw {} running tasks", max_running);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2);
}

struct RangeOrigin {
    body: Vec<u8>,
    offsets: Mutex<Vec<u64>>,
}

const ORIGIN_ETAG: &str = "\"v1\"";

async fn ranged(State(origin): State<Arc<RangeOrigin>>, headers: HeaderMap) -> Response {
    let len = origin.body.len();
    let offset = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());
    let validator_ok = headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) == Some(ORIGIN_ETAG);

    match offset {
        Some(start) if validator_ok && start < len => {
            origin.offsets.lock().expect("offsets").push(start as u64);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::ETAG, ORIGIN_ETAG)
                .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, len - 1, len))
                .body(Body::from(origin.body[start..].to_vec()))
                .expect("response")
        }
        _ => Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, ORIGIN_ETAG)
            .header(header::CONTENT_LENGTH, len)
            .body(slow_body(len / 1024, 1024, Duration::from_millis(40), None))
            .expect("response"),
    }
}

#[tokio::test]
async fn test_cancelled_partial_is_kept_and_resumed() {
    let origin = Arc::new(RangeOrigin {
        body: vec![b'x'; 64 * 1024],
        offsets: Mutex::new(Vec::new()),
    });
    let router = Router::new()
        .route("/big.iso", get(ranged))
        .with_state(Arc::clone(&origin));
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("big.iso");
    let part = dir.path().join("big.iso.part");
    let request = TransferRequest::new(format!("{}/big.iso", base), &dest).keep_partial(true);

    let manager = DownloadManager::new(options(1), no_fetcher()).expect("manager");
    let first = manager.submit_one(request.clone()).expect("submit");
    let mut events = manager.subscribe(first).expect("subscribe");
    while let Some(event) = events.recv().await {
        if let TaskEvent::Progress { progress, .. } = event {
            if progress.bytes_done > 0 {
                break;
            }
        }
    }
    manager.cancel(first).expect("cancel");
    let snapshot = manager.handle(first).expect("handle").wait().await;
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert!(!dest.exists());
    let kept = std::fs::metadata(&part).expect("partial kept").len();
    assert!(kept > 0 && kept < 64 * 1024);

    let second = manager.submit_one(request).expect("resubmit");
    let summary = manager.wait_all().await;

    assert_eq!(summary.report(second).expect("report").state, TaskState::Completed);
    assert_eq!(*origin.offsets.lock().expect("offsets"), vec![kept]);
    assert_eq!(std::fs::read(&dest).expect("artifact"), origin.body);
    assert!(!part.exists());
}

#[tokio::test]
async fn test_cancelled_partial_is_removed_by_default() {
    let origin = Arc::new(RangeOrigin {
        body: vec![b'x'; 64 * 1024],
        offsets: Mutex::new(Vec::new()),
    });
    let router = Router::new()
        .route("/big.iso", get(ranged))
        .with_state(origin);
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("big.iso");

    let manager = DownloadManager::new(options(1), no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/big.iso", base), &dest))
        .expect("submit");
    let mut handle = manager.handle(id).expect("handle");
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.cancel(id).expect("cancel");

    assert_eq!(handle.wait().await.state, TaskState::Cancelled);
    assert!(!dir.path().join("big.iso.part").exists());
    assert!(!dest.exists());
}

/// Sends `head` bytes with a strong ETag, then breaks the connection.
async fn broken_after(State(head): State<usize>) -> Response {
    let stream = futures_util::stream::iter(vec![
        Ok(Bytes::from(vec![b'x'; head])),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "origin went away")),
    ]);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, ORIGIN_ETAG)
        .header(header::CONTENT_LENGTH, head * 8)
        .body(Body::from_stream(stream))
        .expect("response")
}

#[tokio::test]
async fn test_cancel_during_backoff_removes_partial() {
    let router = Router::new()
        .route("/broken.iso", get(broken_after))
        .with_state(8 * 1024);
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("broken.iso");
    let part = dir.path().join("broken.iso.part");
    let sidecar = dir.path().join("broken.iso.part.json");

    let mut opts = options(1);
    opts.retry = RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(60));
    let manager = DownloadManager::new(opts, no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/broken.iso", base), &dest))
        .expect("submit");

    // first attempt fails and the task waits out its retry delay
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = manager.snapshot(id).expect("snapshot");
            if snapshot.state == TaskState::Queued && snapshot.attempt == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task entered backoff");
    assert!(part.exists());

    manager.cancel(id).expect("cancel");
    let snapshot = tokio::time::timeout(Duration::from_secs(5), manager.handle(id).expect("handle").wait())
        .await
        .expect("cancel finishes without waiting out the delay");

    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert!(!part.exists());
    assert!(!sidecar.exists());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_shutdown_during_backoff_removes_partial() {
    let router = Router::new()
        .route("/broken.iso", get(broken_after))
        .with_state(4 * 1024);
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("broken.iso");

    let mut opts = options(1);
    opts.retry = RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(60));
    let manager = DownloadManager::new(opts, no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/broken.iso", base), &dest))
        .expect("submit");
    let mut handle = manager.handle(id).expect("handle");

    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.snapshot(id).map(|s| s.attempt) != Some(1)
            || manager.snapshot(id).map(|s| s.state) != Some(TaskState::Queued)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task entered backoff");

    manager.shutdown().await;
    let snapshot = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("task ends after shutdown");
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert!(!dir.path().join("broken.iso.part").exists());
    assert!(!dir.path().join("broken.iso.part.json").exists());
}

#[tokio::test]
async fn test_stalled_transfer_times_out_and_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/stalled.iso",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let head = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; 1024]))]);
                let stalled = futures_util::StreamExt::chain(head, futures_util::stream::pending());
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_LENGTH, 64 * 1024)
                    .body(Body::from_stream(stalled))
                    .expect("response")
            }),
        )
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    let dest = dir.path().join("stalled.iso");

    let mut opts = options(1);
    opts.retry = RetryPolicy::new(2, Duration::from_millis(20), Duration::from_millis(50));
    opts.idle_timeout = Duration::from_millis(200);
    let manager = DownloadManager::new(opts, no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/stalled.iso", base), &dest))
        .expect("submit");
    let summary = tokio::time::timeout(Duration::from_secs(10), manager.wait_all())
        .await
        .expect("idle watchdog fires");

    let report = summary.report(id).expect("report");
    assert_eq!(report.state, TaskState::Failed);
    assert_eq!(report.retries, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let failure = report.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Transient);
    assert_eq!(failure.reason, FailureReason::RetriesExhausted);
    assert!(matches!(failure.error, TransferError::IdleTimeout(_)));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_unwritable_destination_fails_without_retry() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/debian.iso",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                vec![1u8; 1024]
            }),
        )
        .with_state(Arc::clone(&hits));
    let base = serve(router).await;
    let dir = tempfile::tempdir().expect("temp dir");
    // a regular file where the destination directory should be; fails even as root
    let blocker = dir.path().join("iso");
    std::fs::write(&blocker, b"not a directory").expect("write");
    let dest = blocker.join("debian.iso");

    let manager = DownloadManager::new(options(1), no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(format!("{}/debian.iso", base), &dest))
        .expect("submit");
    let summary = manager.wait_all().await;

    let report = summary.report(id).expect("report");
    assert_eq!(report.state, TaskState::Failed);
    assert_eq!(report.retries, 0);
    let failure = report.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.reason, FailureReason::DestinationUnwritable);
    assert!(failure.message().contains("Destination unwritable"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Torrent
// =============================================================================

#[tokio::test]
async fn test_torrent_without_fetch_binary_fails_permanently() {
    let dir = tempfile::tempdir().expect("temp dir");
    let manager = DownloadManager::new(options(2), no_fetcher()).expect("manager");
    let id = manager
        .submit_one(TransferRequest::new(
            "magnet:?xt=urn:btih:0123456789abcdef&dn=mint.iso",
            dir.path().join("mint.iso"),
        ))
        .expect("submit");
    let summary = manager.wait_all().await;

    let report = summary.report(id).expect("report");
    assert_eq!(report.state, TaskState::Failed);
    assert_eq!(report.retries, 0);
    let failure = report.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.reason, FailureReason::FetchBinaryUnavailable);
}

#[cfg(unix)]
mod fake_fetcher {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef&dn=fake.iso";

    /// Write an executable script; `$2` is the download directory.
    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-aria2c");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn fetcher(program: PathBuf) -> Arc<FetchBinary> {
        Arc::new(FetchBinary::with_availability(
            program,
            Availability::available("aria2 version 1.37.0"),
        ))
    }

    #[tokio::test]
    async fn test_successful_exit_completes_with_file_size() {
        let bin = tempfile::tempdir().expect("temp dir");
        let out = tempfile::tempdir().expect("temp dir");
        let program = script(
            bin.path(),
            r#"echo "[#a1b2c3 512KiB/1.0MiB(50%) CN:4 SD:2 DL:1.2MiB ETA:1s]"
printf 'torrent payload' > "$2/fake.iso"
echo "Download complete: $2/fake.iso"
exit 0"#,
        );

        let manager = DownloadManager::new(options(1), fetcher(program)).expect("manager");
        let id = manager
            .submit_one(TransferRequest::new(MAGNET, out.path().join("fake.iso")))
            .expect("submit");
        let summary = manager.wait_all().await;

        let report = summary.report(id).expect("report");
        assert_eq!(report.state, TaskState::Completed, "{:?}", report.failure);
        assert_eq!(report.progress.bytes_done, 15);
        assert_eq!(report.progress.bytes_total, Some(15));
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_is_permanent() {
        let bin = tempfile::tempdir().expect("temp dir");
        let out = tempfile::tempdir().expect("temp dir");
        let program = script(bin.path(), "exit 0");

        let manager = DownloadManager::new(options(1), fetcher(program)).expect("manager");
        let id = manager
            .submit_one(TransferRequest::new(MAGNET, out.path().join("fake.iso")))
            .expect("submit");
        let summary = manager.wait_all().await;

        let report = summary.report(id).expect("report");
        assert_eq!(report.state, TaskState::Failed);
        assert_eq!(report.retries, 0);
        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(matches!(failure.error, TransferError::OutputMissing(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transient_with_diagnostics() {
        let bin = tempfile::tempdir().expect("temp dir");
        let out = tempfile::tempdir().expect("temp dir");
        let program = script(
            bin.path(),
            r#"echo "[ERROR] tracker announce failed" >&2
echo "errorCode=1 Network problem" >&2
exit 1"#,
        );

        let mut opts = options(1);
        opts.retry = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10));
        let manager = DownloadManager::new(opts, fetcher(program)).expect("manager");
        let id = manager
            .submit_one(TransferRequest::new(MAGNET, out.path().join("fake.iso")))
            .expect("submit");
        let summary = manager.wait_all().await;

        let report = summary.report(id).expect("report");
        assert_eq!(report.state, TaskState::Failed);
        assert_eq!(report.retries, 1);
        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.reason, FailureReason::RetriesExhausted);
        match &failure.error {
            TransferError::FetchProcess { code, diagnostic } => {
                assert_eq!(*code, Some(1));
                assert!(diagnostic.contains("errorCode=1 Network problem"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_process_group() {
        let bin = tempfile::tempdir().expect("temp dir");
        let out = tempfile::tempdir().expect("temp dir");
        let pid_file = bin.path().join("child.pid");
        let program = script(
            bin.path(),
            &format!(
                r#"sleep 30 &
echo $! > "{}"
touch "$2/fake.iso" "$2/fake.iso.aria2"
echo "[#a1b2c3 1MiB/100MiB(1%) CN:1 SD:0 DL:1MiB ETA:1m39s]"
wait"#,
                pid_file.display()
            ),
        );

        let manager = DownloadManager::new(options(1), fetcher(program)).expect("manager");
        let dest = out.path().join("fake.iso");
        let id = manager.submit_one(TransferRequest::new(MAGNET, &dest)).expect("submit");
        let mut events = manager.subscribe(id).expect("subscribe");
        while let Some(event) = events.recv().await {
            if matches!(event, TaskEvent::Progress { .. }) {
                break;
            }
        }

        manager.cancel(id).expect("cancel");
        let snapshot = manager.handle(id).expect("handle").wait().await;
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(!dest.exists());
        assert!(!out.path().join("fake.iso.aria2").exists());

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        let mut gone = false;
        for _ in 0..50 {
            if process_gone(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "background child {} survived cancellation", pid);
    }

    /// Dead, or a zombie nobody has reaped yet.
    fn process_gone(pid: i32) -> bool {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return true;
        }
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
            .unwrap_or(false)
    }
}
