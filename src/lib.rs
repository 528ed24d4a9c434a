// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! distroget - concurrent fetcher for Linux distribution images
//!
//! Queues many large downloads at once and runs them with a bounded worker
//! pool. Plain HTTP(S) links are streamed with range resume; torrent and
//! magnet links are handed to a supervised `aria2c` process.
//!
//! # Core Modules
//!
//! - [`download`] - Download manager, transfer strategies, retries, post-processing
//! - [`config`] - Persistent JSON configuration
//! - [`deploy`] - Hand-off of finished images to a remote host
//! - [`logging`] - Tracing setup (log file plus terminal warnings)
//! - [`error`] - Consistent error formatting utilities
//! - [`sync`] - Poison-tolerant lock helpers

pub mod colors;
pub mod config;
pub mod deploy;
pub mod download;
pub mod error;
pub mod logging;
pub mod sync;

// Re-export the engine surface
pub use download::{
    DownloadError, DownloadManager, EngineOptions, FailureKind, FetchBinary, Progress, RetryPolicy,
    Summary, TaskEvent, TaskFailure, TaskHandle, TaskId, TaskReport, TaskState, TransferError,
    TransferKind, TransferRequest,
};

// Re-export from other modules
pub use config::Config;
pub use deploy::{DeployOutcome, DeployTransport, RsyncTransport};
