// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming HTTP(S) transfer.
//!
//! Bytes go to `<destination>.part`; the file is renamed onto the
//! destination only after the body has been read in full. A small JSON
//! sidecar remembers the validator (ETag or Last-Modified) of the partial
//! body so a later attempt can resume with `Range` + `If-Range`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{HeaderName, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::error::TransferError;
use super::strategy::{stop_requested, TransferContext, TransferOutcome};
use super::types::Progress;

/// Minimum time between two progress reports.
const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(200);
/// Report at least this often while data flows.
const MAX_EMIT_INTERVAL: Duration = Duration::from_secs(1);
/// Report after this many bytes even inside the max interval.
const EMIT_EVERY_BYTES: u64 = 1024 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the shared HTTP client.
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("distroget/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Path of the in-progress body for `destination`.
pub fn partial_path(destination: &Path) -> PathBuf {
    with_suffix(destination, ".part")
}

fn sidecar_path(destination: &Path) -> PathBuf {
    with_suffix(destination, ".part.json")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// What we know about the body stored in the `.part` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PartialMeta {
    url: String,
    etag: Option<String>,
    last_modified: Option<String>,
    total: Option<u64>,
}

impl PartialMeta {
    /// Strong ETag preferred; weak ETags may not be used with If-Range.
    fn validator(&self) -> Option<&str> {
        self.etag
            .as_deref()
            .filter(|e| !e.starts_with("W/"))
            .or(self.last_modified.as_deref())
    }

    fn from_response(url: &str, response: &reqwest::Response, total: Option<u64>) -> Self {
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            url: url.to_string(),
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
            total,
        }
    }
}

/// Parse `bytes <start>-<end>/<total>`; returns `(start, total)`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some((start, total))
}

fn classify(err: reqwest::Error) -> TransferError {
    if err.is_builder() {
        TransferError::InvalidSource(err.to_string())
    } else if let Some(status) = err.status() {
        TransferError::HttpStatus {
            status: status.as_u16(),
        }
    } else {
        TransferError::Network(err.to_string())
    }
}

/// HTTP strategy for one request.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
    url: String,
    destination: PathBuf,
    read_timeout: Duration,
}

impl HttpTransfer {
    pub fn new(client: reqwest::Client, url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            client,
            url: url.into(),
            destination: destination.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Longest wait for a single body chunk.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    async fn load_meta(&self) -> Option<PartialMeta> {
        let raw = fs::read(sidecar_path(&self.destination)).await.ok()?;
        let meta: PartialMeta = serde_json::from_slice(&raw).ok()?;
        (meta.url == self.url).then_some(meta)
    }

    async fn store_meta(&self, meta: &PartialMeta) -> Result<(), TransferError> {
        let path = sidecar_path(&self.destination);
        let raw = serde_json::to_vec(meta).map_err(|e| TransferError::DestinationUnwritable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, raw).await.map_err(|e| TransferError::from_io(&path, &e))
    }

    async fn clear_partial(&self) {
        let _ = fs::remove_file(partial_path(&self.destination)).await;
        let _ = fs::remove_file(sidecar_path(&self.destination)).await;
    }

    /// Bytes of a resumable partial body, 0 if there is none.
    async fn resume_offset(&self, meta: Option<&PartialMeta>) -> u64 {
        let Some(meta) = meta else { return 0 };
        if meta.validator().is_none() {
            return 0;
        }
        match fs::metadata(partial_path(&self.destination)).await {
            Ok(m) if m.is_file() => m.len(),
            _ => 0,
        }
    }

    /// Send the request, resuming when possible.
    ///
    /// Returns the response, the offset its body starts at and the total
    /// size when known.
    async fn open(&self, ctx: &mut TransferContext) -> Result<(reqwest::Response, u64, Option<u64>), TransferError> {
        let meta = self.load_meta().await;
        let mut offset = self.resume_offset(meta.as_ref()).await;

        loop {
            let mut request = self.client.get(&self.url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", offset));
                if let Some(validator) = meta.as_ref().and_then(PartialMeta::validator) {
                    request = request.header(IF_RANGE, validator);
                }
            }

            let response = tokio::select! {
                response = request.send() => response.map_err(classify)?,
                _ = stop_requested(&mut ctx.stop) => return Err(TransferError::Cancelled),
            };
            let status = response.status();

            if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
                debug!(url = %self.url, offset, "partial body rejected, restarting");
                self.clear_partial().await;
                offset = 0;
                continue;
            }
            if !status.is_success() {
                return Err(TransferError::HttpStatus {
                    status: status.as_u16(),
                });
            }

            if offset > 0 && status == StatusCode::PARTIAL_CONTENT {
                let range = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                match range {
                    Some((start, total)) if start == offset => {
                        info!(url = %self.url, offset, "resuming partial download");
                        let total = total.or_else(|| response.content_length().map(|len| offset + len));
                        return Ok((response, offset, total));
                    }
                    _ => {
                        debug!(url = %self.url, "unusable Content-Range, restarting");
                        self.clear_partial().await;
                        offset = 0;
                        continue;
                    }
                }
            }

            // 200: validator changed or range unsupported, start over
            let total = response.content_length();
            return Ok((response, 0, total));
        }
    }

    pub async fn execute(&self, ctx: &mut TransferContext) -> Result<TransferOutcome, TransferError> {
        if let Some(parent) = self.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::from_io(parent, &e))?;
        }

        let (response, offset, total) = self.open(ctx).await?;
        let part = partial_path(&self.destination);
        self.store_meta(&PartialMeta::from_response(&self.url, &response, total))
            .await?;

        let mut options = OpenOptions::new();
        if offset > 0 {
            options.append(true);
        } else {
            options.create(true).write(true).truncate(true);
        }
        let mut file = options
            .open(&part)
            .await
            .map_err(|e| TransferError::from_io(&part, &e))?;

        let mut done = offset;
        let mut meter = RateMeter::new(done);
        ctx.progress.report(meter.snapshot(done, total));

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut ctx.stop) => {
                    let _ = file.flush().await;
                    return Err(TransferError::Cancelled);
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(TransferError::Network(format!(
                        "no data for {}s",
                        self.read_timeout.as_secs()
                    )))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(classify(e)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::from_io(&part, &e))?;
            done += chunk.len() as u64;

            if meter.due(done) {
                ctx.progress.report(meter.snapshot(done, total));
            }
        }

        file.flush().await.map_err(|e| TransferError::from_io(&part, &e))?;
        file.sync_all().await.map_err(|e| TransferError::from_io(&part, &e))?;
        drop(file);

        match total {
            Some(expected) if done != expected => return Err(TransferError::Incomplete { done, expected }),
            None if done == 0 => return Err(TransferError::Empty),
            _ => {}
        }

        fs::rename(&part, &self.destination)
            .await
            .map_err(|e| TransferError::from_io(&self.destination, &e))?;
        let _ = fs::remove_file(sidecar_path(&self.destination)).await;

        let mut progress = Progress::new(done, total);
        progress.rate_bytes_per_sec = meter.average(done);
        progress.eta_secs = Some(0);
        progress.timestamp = Utc::now();
        Ok(TransferOutcome {
            path: self.destination.clone(),
            progress,
        })
    }

    /// Drop the partial body and its sidecar.
    pub async fn discard_partial(&self) {
        self.clear_partial().await;
    }
}

/// Throttles progress reports and computes the transfer rate.
struct RateMeter {
    started: Instant,
    start_bytes: u64,
    last_emit: Instant,
    last_bytes: u64,
    rate: u64,
}

impl RateMeter {
    fn new(bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            start_bytes: bytes,
            last_emit: now,
            last_bytes: bytes,
            rate: 0,
        }
    }

    fn due(&self, bytes: u64) -> bool {
        let elapsed = self.last_emit.elapsed();
        elapsed >= MIN_EMIT_INTERVAL
            && (elapsed >= MAX_EMIT_INTERVAL || bytes - self.last_bytes >= EMIT_EVERY_BYTES)
    }

    fn snapshot(&mut self, bytes: u64, total: Option<u64>) -> Progress {
        let elapsed = self.last_emit.elapsed().as_secs_f64();
        if elapsed > 0.0 && bytes > self.last_bytes {
            self.rate = ((bytes - self.last_bytes) as f64 / elapsed) as u64;
        }
        self.last_emit = Instant::now();
        self.last_bytes = bytes;

        let mut progress = Progress::new(bytes, total);
        progress.rate_bytes_per_sec = self.rate;
        progress.eta_secs = match (total, self.rate) {
            (Some(total), rate) if rate > 0 => Some(total.saturating_sub(bytes) / rate),
            _ => None,
        };
        progress
    }

    fn average(&self, bytes: u64) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            ((bytes - self.start_bytes) as f64 / elapsed) as u64
        } else {
            0
        }
    }
}
