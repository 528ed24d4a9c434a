// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download Orchestration Engine for distroget
//!
//! This module fetches large images concurrently with:
//! - Plain HTTP(S) streaming with range resume
//! - Torrent and magnet sources through a supervised aria2c process
//! - Bounded retries with exponential backoff
//! - Collapse of duplicate destinations into one execution
//! - Checksum verification and decompression of finished artifacts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ Worker pool     │
//! │ submit / cancel │     │ (tokio tasks)   │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ TaskRegistry    │     │ Transfer        │────▶│ TorrentProcess-  │
//! │ (queue, events) │     │ Http | Torrent  │     │ Supervisor       │
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use distroget::download::{DownloadManager, EngineOptions, FetchBinary, TransferRequest};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::new(EngineOptions::default(), Arc::new(FetchBinary::default()))?;
//!
//! let ids = manager.submit(vec![
//!     TransferRequest::new("https://cdimage.debian.org/debian-12.iso", "/srv/iso/debian-12.iso"),
//!     TransferRequest::new("magnet:?xt=urn:btih:ABC&dn=mint.iso", "/srv/iso/mint.iso"),
//! ])?;
//!
//! let mut events = manager.subscribe(ids[0])?;
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let summary = manager.wait_all().await;
//! println!("{} succeeded, {} failed", summary.succeeded.len(), summary.failed.len());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;
pub mod manager;
pub mod postprocess;
pub mod progress;
pub mod retry;
pub mod state;
pub mod strategy;
pub mod supervisor;
pub mod torrent;
pub mod types;
pub mod verify;

// Re-export commonly used items
pub use error::{DownloadError, FailureKind, FailureReason, TaskFailure, TransferError};
pub use manager::{DownloadManager, EngineOptions, TaskHandle};
pub use progress::parse_line;
pub use retry::{RetryDecision, RetryPolicy};
pub use strategy::StopSignal;
pub use torrent::{is_torrent_source, Availability, FetchBinary};
pub use types::{
    filename_from_source, CatalogEntry, Progress, Summary, TaskEvent, TaskId, TaskReport, TaskSnapshot, TaskState,
    TransferKind, TransferRequest,
};
