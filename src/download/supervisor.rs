// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervision of one fetch-binary process.
//!
//! The child runs in its own process group so that cancellation reaches any
//! helpers it forks. stdout and stderr are drained concurrently into one
//! channel; summary lines become progress, the rest is kept as a short tail
//! for diagnostics.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::error::TransferError;
use super::progress::parse_line;
use super::strategy::{ProgressSink, StopSignal};
use super::types::Progress;

/// Lines of output kept for failure diagnostics.
const DIAGNOSTIC_LINES: usize = 20;
/// Time between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// How long to keep reading output after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// How a supervised process ended.
#[derive(Debug)]
pub enum ProcessExit {
    /// The process ran to completion on its own.
    Exited {
        success: bool,
        code: Option<i32>,
        /// Last lines of stderr, or stdout when stderr was silent
        diagnostics: Vec<String>,
        progress: Progress,
    },
    /// A stop was requested and the process group was torn down.
    Stopped(StopSignal),
}

/// Spawns the fetch binary and relays its output until it exits or a stop
/// is requested.
#[derive(Debug)]
pub struct TorrentProcessSupervisor {
    program: PathBuf,
    args: Vec<OsString>,
    grace: Duration,
}

impl TorrentProcessSupervisor {
    pub fn new(program: &Path, args: Vec<OsString>) -> Self {
        Self {
            program: program.to_path_buf(),
            args,
            grace: TERMINATE_GRACE,
        }
    }

    /// Override the SIGTERM grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub async fn run(
        self,
        stop: &mut watch::Receiver<StopSignal>,
        sink: &ProgressSink,
        initial: Progress,
    ) -> Result<ProcessExit, TransferError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::FetchBinaryMissing(format!("{} not found", self.program.display()))
            } else {
                TransferError::FetchProcess {
                    code: None,
                    diagnostic: format!("failed to spawn {}: {}", self.program.display(), e),
                }
            }
        })?;
        debug!(program = %self.program.display(), pid = ?child.id(), "fetch process started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let mut relay = OutputRelay::new(initial);

        enum Step {
            Exited(std::io::Result<std::process::ExitStatus>),
            Stop(StopSignal),
        }

        let step = loop {
            tokio::select! {
                Some((stream, line)) = rx.recv() => relay.handle(stream, &line, sink),
                status = child.wait() => break Step::Exited(status),
                changed = stop.changed() => {
                    let signal = match changed {
                        Ok(()) => *stop.borrow_and_update(),
                        Err(_) => StopSignal::Cancel,
                    };
                    if signal.is_stop() {
                        break Step::Stop(signal);
                    }
                }
            }
        };

        match step {
            Step::Stop(signal) => {
                debug!(pid = ?child.id(), ?signal, "stopping fetch process");
                terminate_group(&mut child, self.grace).await;
                Ok(ProcessExit::Stopped(signal))
            }
            Step::Exited(Err(e)) => Err(TransferError::FetchProcess {
                code: None,
                diagnostic: format!("failed to wait for fetch process: {}", e),
            }),
            Step::Exited(Ok(status)) => {
                // readers finish at EOF; a forked helper holding the pipe must not stall us
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                    while let Some((stream, line)) = rx.recv().await {
                        relay.handle(stream, &line, sink);
                    }
                })
                .await;

                debug!(code = ?status.code(), "fetch process exited");
                Ok(ProcessExit::Exited {
                    success: status.success(),
                    code: status.code(),
                    diagnostics: relay.diagnostics(),
                    progress: relay.progress,
                })
            }
        }
    }
}

fn spawn_reader<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    });
}

struct OutputRelay {
    progress: Progress,
    stdout_tail: VecDeque<String>,
    stderr_tail: VecDeque<String>,
}

impl OutputRelay {
    fn new(initial: Progress) -> Self {
        Self {
            progress: initial,
            stdout_tail: VecDeque::with_capacity(DIAGNOSTIC_LINES),
            stderr_tail: VecDeque::with_capacity(DIAGNOSTIC_LINES),
        }
    }

    fn handle(&mut self, stream: Stream, line: &str, sink: &ProgressSink) {
        // summaries may be redrawn in place with carriage returns
        for segment in line.split('\r') {
            let segment = segment.trim_end();
            if segment.is_empty() {
                continue;
            }
            if let Some(next) = parse_line(segment, &self.progress) {
                self.progress = next.clone();
                sink.report(next);
                continue;
            }
            if segment.contains("[ERROR]") || segment.contains("errorCode=") {
                warn!("fetch: {}", segment);
            } else {
                debug!("fetch: {}", segment);
            }
            let tail = match stream {
                Stream::Stdout => &mut self.stdout_tail,
                Stream::Stderr => &mut self.stderr_tail,
            };
            if tail.len() == DIAGNOSTIC_LINES {
                tail.pop_front();
            }
            tail.push_back(segment.to_string());
        }
    }

    fn diagnostics(&self) -> Vec<String> {
        let tail = if self.stderr_tail.is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        tail.iter().cloned().collect()
    }
}

/// SIGTERM the whole process group, then SIGKILL after `grace`.
async fn terminate_group(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM to fetch process group failed");
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                // stragglers that ignored SIGTERM or were forked late; an
                // empty group's id may already belong to another process
                if group_alive(group) {
                    let _ = killpg(group, Signal::SIGKILL);
                }
                return;
            }
            warn!(pid, "fetch process ignored SIGTERM, killing");
            let _ = killpg(group, Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
}

/// True while any process is left in `group`.
#[cfg(unix)]
fn group_alive(group: nix::unistd::Pid) -> bool {
    nix::sys::signal::killpg(group, None).is_ok()
}
