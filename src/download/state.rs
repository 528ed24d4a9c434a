// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory task registry.
//!
//! Holds every task, the FIFO queue and the in-flight destination table.
//! All state transitions happen here under the manager's mutex; methods
//! never block or perform I/O, they only update entries and push events
//! into unbounded channels.
//!
//! Duplicate destinations collapse on dequeue: the first queued task for a
//! path becomes the leader and later queued tasks for the same path become
//! its followers. Followers stay `Queued` until the leader ends, receive the
//! leader's progress, and then take over its terminal state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::error::{DownloadError, TaskFailure, TransferError};
use super::strategy::StopSignal;
use super::types::{Progress, Summary, TaskEvent, TaskId, TaskReport, TaskSnapshot, TaskState, TransferRequest};

/// A task handed to a worker.
#[derive(Debug)]
pub struct Dispatch {
    pub id: TaskId,
    pub request: TransferRequest,
    /// 1-based attempt number
    pub attempt: u32,
    pub stop: Arc<watch::Sender<StopSignal>>,
}

#[derive(Debug)]
struct TaskEntry {
    request: TransferRequest,
    state: TaskState,
    /// Attempts started so far
    attempt: u32,
    progress: Progress,
    failure: Option<TaskFailure>,
    warning: Option<String>,
    artifact: Option<PathBuf>,
    message: String,
    /// Leader this task was collapsed into
    leader: Option<TaskId>,
    followers: Vec<TaskId>,
    /// Queued, waiting out a retry delay
    backing_off: bool,
    stop: Option<Arc<watch::Sender<StopSignal>>>,
    subscribers: Vec<mpsc::UnboundedSender<TaskEvent>>,
    snapshot: watch::Sender<TaskSnapshot>,
}

impl TaskEntry {
    fn new(id: TaskId, request: TransferRequest) -> Self {
        let progress = Progress::default();
        let (snapshot, _) = watch::channel(TaskSnapshot {
            id,
            state: TaskState::Queued,
            attempt: 0,
            progress: progress.clone(),
            message: "Queued".to_string(),
        });
        Self {
            request,
            state: TaskState::Queued,
            attempt: 0,
            progress,
            failure: None,
            warning: None,
            artifact: None,
            message: "Queued".to_string(),
            leader: None,
            followers: Vec::new(),
            backing_off: false,
            stop: None,
            subscribers: Vec::new(),
            snapshot,
        }
    }

    fn stop_signalled(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| stop.borrow().is_stop())
    }

    fn publish(&mut self, event: TaskEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn refresh_snapshot(&self, id: TaskId) {
        self.snapshot.send_replace(TaskSnapshot {
            id,
            state: self.state,
            attempt: self.attempt,
            progress: self.progress.clone(),
            message: self.message.clone(),
        });
    }

    fn report(&self, id: TaskId) -> TaskReport {
        TaskReport {
            id,
            request: self.request.clone(),
            state: self.state,
            progress: self.progress.clone(),
            failure: self.failure.clone(),
            warning: self.warning.clone(),
            artifact: self.artifact.clone(),
            retries: self.attempt.saturating_sub(1),
            collapsed_into: self.leader,
        }
    }
}

/// How a task ended, applied to the task and its followers.
#[derive(Debug, Clone)]
enum Ending {
    Completed {
        progress: Progress,
        artifact: PathBuf,
        warning: Option<String>,
    },
    Failed(TaskFailure),
    Cancelled,
}

/// The shared task table.
#[derive(Debug)]
pub struct TaskRegistry {
    next_id: u64,
    tasks: BTreeMap<TaskId, TaskEntry>,
    queue: VecDeque<TaskId>,
    /// Destination owned by a running or backing-off task
    in_flight: HashMap<PathBuf, TaskId>,
    outstanding: watch::Sender<usize>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            next_id: 1,
            tasks: BTreeMap::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            outstanding,
        }
    }

    /// Fails if a running (or retrying) task is writing to `destination`.
    pub fn check_destination(&self, destination: &Path) -> Result<(), DownloadError> {
        match self.in_flight.get(destination) {
            Some(owner) => Err(DownloadError::DestinationBusy {
                path: destination.to_path_buf(),
                owner: *owner,
            }),
            None => Ok(()),
        }
    }

    /// Append a validated request to the queue.
    pub fn insert(&mut self, request: TransferRequest) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, TaskEntry::new(id, request));
        self.queue.push_back(id);
        self.outstanding.send_modify(|n| *n += 1);
        id
    }

    /// Pop the next runnable task, collapsing queued duplicates into it.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        while let Some(id) = self.queue.pop_front() {
            let Some(entry) = self.tasks.get(&id) else { continue };
            if entry.state != TaskState::Queued || entry.leader.is_some() || entry.backing_off {
                continue;
            }
            let destination = entry.request.destination.clone();

            if let Some(&owner) = self.in_flight.get(&destination) {
                if owner != id {
                    self.attach_follower(owner, id);
                    continue;
                }
            }

            let duplicates: Vec<TaskId> = self
                .queue
                .iter()
                .copied()
                .filter(|other| {
                    self.tasks.get(other).is_some_and(|t| {
                        t.state == TaskState::Queued
                            && t.leader.is_none()
                            && !t.backing_off
                            && t.request.destination == destination
                    })
                })
                .collect();
            self.queue.retain(|other| !duplicates.contains(other));
            for follower in duplicates {
                self.attach_follower(id, follower);
            }

            self.in_flight.insert(destination, id);
            let (stop, _) = watch::channel(StopSignal::Continue);
            let stop = Arc::new(stop);

            let entry = self.tasks.get_mut(&id)?;
            entry.attempt += 1;
            entry.state = TaskState::Running;
            entry.progress = Progress::default();
            entry.stop = Some(Arc::clone(&stop));
            entry.message = if entry.attempt > 1 {
                format!("Downloading (attempt {})", entry.attempt)
            } else {
                "Downloading".to_string()
            };
            let attempt = entry.attempt;
            entry.publish(TaskEvent::StateChanged {
                id,
                state: TaskState::Running,
                attempt,
            });
            entry.refresh_snapshot(id);

            return Some(Dispatch {
                id,
                request: entry.request.clone(),
                attempt,
                stop,
            });
        }
        None
    }

    fn attach_follower(&mut self, leader: TaskId, follower: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&follower) {
            entry.leader = Some(leader);
            entry.message = format!("Waiting on {} (same destination)", leader);
            entry.refresh_snapshot(follower);
        }
        if let Some(entry) = self.tasks.get_mut(&leader) {
            entry.followers.push(follower);
        }
    }

    /// Record a progress snapshot from attempt `attempt` of task `id`.
    ///
    /// Stale attempts are ignored. Within an attempt `bytes_done` never
    /// decreases and timestamps never go backwards.
    pub fn report_progress(&mut self, id: TaskId, attempt: u32, progress: Progress) {
        let Some(entry) = self.tasks.get_mut(&id) else { return };
        if !entry.state.is_active() || entry.attempt != attempt {
            return;
        }
        let merged = entry.progress.merge(&progress);
        entry.progress = merged.clone();
        entry.publish(TaskEvent::Progress {
            id,
            progress: merged.clone(),
        });
        entry.refresh_snapshot(id);

        let followers = entry.followers.clone();
        for follower in followers {
            if let Some(f) = self.tasks.get_mut(&follower) {
                f.progress = merged.clone();
                f.publish(TaskEvent::Progress {
                    id: follower,
                    progress: merged.clone(),
                });
                f.refresh_snapshot(follower);
            }
        }
    }

    /// True once the caller asked to cancel a running task.
    pub fn is_cancelling(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .is_some_and(|t| t.state == TaskState::Cancelling)
    }

    pub fn complete(&mut self, id: TaskId, progress: Progress, artifact: PathBuf, warning: Option<String>) {
        self.finish(
            id,
            Ending::Completed {
                progress,
                artifact,
                warning,
            },
        );
    }

    pub fn fail(&mut self, id: TaskId, failure: TaskFailure) {
        self.finish(id, Ending::Failed(failure));
    }

    /// Acknowledge a cancellation after the worker tore the attempt down.
    pub fn finish_cancelled(&mut self, id: TaskId) {
        self.finish(id, Ending::Cancelled);
    }

    /// Put a failed attempt into backoff. The destination stays reserved.
    ///
    /// Returns the stop channel for the backoff period; a cancel arrives
    /// on it as [`StopSignal::Cancel`].
    pub fn schedule_retry(
        &mut self,
        id: TaskId,
        error: &TransferError,
        delay: Duration,
    ) -> Option<watch::Receiver<StopSignal>> {
        let entry = self.tasks.get_mut(&id)?;
        let (stop, signal) = watch::channel(StopSignal::Continue);
        entry.state = TaskState::Queued;
        entry.backing_off = true;
        entry.stop = Some(Arc::new(stop));
        entry.message = format!("Retrying in {:.1}s: {}", delay.as_secs_f64(), error);
        let attempt = entry.attempt;
        entry.publish(TaskEvent::StateChanged {
            id,
            state: TaskState::Queued,
            attempt,
        });
        entry.refresh_snapshot(id);
        Some(signal)
    }

    /// Move a task out of backoff to the back of the queue.
    ///
    /// Returns false if it was cancelled in the meantime.
    pub fn requeue(&mut self, id: TaskId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(entry) if entry.state == TaskState::Queued && entry.backing_off && !entry.stop_signalled() => {
                entry.backing_off = false;
                entry.stop = None;
                self.queue.push_back(id);
                true
            }
            _ => false,
        }
    }

    /// Cancel a task.
    ///
    /// Queued tasks end immediately. Running tasks move to `Cancelling` and
    /// their worker is signalled. A task in backoff is signalled on its
    /// backoff channel and ends once its partial output is cleaned up
    /// (see [`TaskRegistry::finish_cancelled`]). A follower
    /// is detached from its leader; cancelling a leader cancels its
    /// followers with it.
    pub fn cancel(&mut self, id: TaskId) -> Result<(), DownloadError> {
        let entry = self.tasks.get_mut(&id).ok_or(DownloadError::UnknownTask(id))?;
        match entry.state {
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Cancelling => Ok(()),
            TaskState::Running => {
                entry.state = TaskState::Cancelling;
                entry.message = "Cancelling".to_string();
                if let Some(stop) = &entry.stop {
                    stop.send_if_modified(|s| {
                        if *s == StopSignal::Continue {
                            *s = StopSignal::Cancel;
                            true
                        } else {
                            false
                        }
                    });
                }
                let attempt = entry.attempt;
                entry.publish(TaskEvent::StateChanged {
                    id,
                    state: TaskState::Cancelling,
                    attempt,
                });
                entry.refresh_snapshot(id);
                Ok(())
            }
            TaskState::Queued => {
                if let Some(leader) = entry.leader {
                    if let Some(l) = self.tasks.get_mut(&leader) {
                        l.followers.retain(|f| *f != id);
                    }
                    self.end_one(id, &Ending::Cancelled, None);
                } else if entry.backing_off {
                    if let Some(stop) = &entry.stop {
                        stop.send_if_modified(|s| {
                            if *s == StopSignal::Continue {
                                *s = StopSignal::Cancel;
                                true
                            } else {
                                false
                            }
                        });
                    }
                    entry.message = "Cancelling".to_string();
                    entry.refresh_snapshot(id);
                } else {
                    self.finish(id, Ending::Cancelled);
                }
                Ok(())
            }
        }
    }

    /// Cancel every task that has not ended.
    pub fn cancel_all(&mut self) {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| !t.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let _ = self.cancel(id);
        }
    }

    fn finish(&mut self, id: TaskId, ending: Ending) {
        let Some(entry) = self.tasks.get_mut(&id) else { return };
        if entry.state.is_terminal() {
            return;
        }
        let followers = std::mem::take(&mut entry.followers);
        let destination = entry.request.destination.clone();
        if self.in_flight.get(&destination) == Some(&id) {
            self.in_flight.remove(&destination);
        }

        self.end_one(id, &ending, None);
        let retries = self.tasks.get(&id).map(|t| t.attempt).unwrap_or(0);
        for follower in followers {
            self.end_one(follower, &ending, Some(retries));
        }
    }

    fn end_one(&mut self, id: TaskId, ending: &Ending, leader_attempts: Option<u32>) {
        let Some(entry) = self.tasks.get_mut(&id) else { return };
        if entry.state.is_terminal() {
            return;
        }
        match ending {
            Ending::Completed {
                progress,
                artifact,
                warning,
            } => {
                entry.state = TaskState::Completed;
                // the final measurement wins over fetcher estimates
                let mut last = progress.clone();
                last.timestamp = last.timestamp.max(entry.progress.timestamp);
                entry.progress = last;
                entry.artifact = Some(artifact.clone());
                entry.warning = warning.clone();
                entry.message = match warning {
                    Some(w) => format!("Completed with warning: {}", w),
                    None => "Completed".to_string(),
                };
            }
            Ending::Failed(failure) => {
                entry.state = TaskState::Failed;
                entry.message = failure.message();
                entry.failure = Some(failure.clone());
            }
            Ending::Cancelled => {
                entry.state = TaskState::Cancelled;
                entry.message = "Cancelled".to_string();
            }
        }
        if let Some(attempts) = leader_attempts {
            entry.attempt = attempts;
        }
        entry.backing_off = false;
        entry.stop = None;

        let state = entry.state;
        let attempt = entry.attempt;
        entry.publish(TaskEvent::StateChanged { id, state, attempt });
        let report = entry.report(id);
        entry.publish(TaskEvent::Finished { id, report });
        // closing the channels ends subscriber streams
        entry.subscribers.clear();
        entry.refresh_snapshot(id);

        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Channel of events for `id`. A task that already ended yields its
    /// `Finished` event and then closes.
    pub fn subscribe(&mut self, id: TaskId) -> Result<mpsc::UnboundedReceiver<TaskEvent>, DownloadError> {
        let entry = self.tasks.get_mut(&id).ok_or(DownloadError::UnknownTask(id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        if entry.state.is_terminal() {
            let _ = tx.send(TaskEvent::Finished {
                id,
                report: entry.report(id),
            });
        } else {
            entry.subscribers.push(tx);
        }
        Ok(rx)
    }

    pub fn watch(&self, id: TaskId) -> Result<watch::Receiver<TaskSnapshot>, DownloadError> {
        self.tasks
            .get(&id)
            .map(|t| t.snapshot.subscribe())
            .ok_or(DownloadError::UnknownTask(id))
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(&id).map(|t| t.snapshot.borrow().clone())
    }

    pub fn report(&self, id: TaskId) -> Option<TaskReport> {
        self.tasks.get(&id).map(|t| t.report(id))
    }

    /// Tasks currently owned by a worker.
    pub fn running_count(&self) -> usize {
        self.tasks.values().filter(|t| t.state.is_active()).count()
    }

    /// Receiver of the number of tasks that have not ended yet.
    pub fn outstanding(&self) -> watch::Receiver<usize> {
        self.outstanding.subscribe()
    }

    /// Reports of every ended task, in submission order.
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for (id, entry) in &self.tasks {
            match entry.state {
                TaskState::Completed => summary.succeeded.push(entry.report(*id)),
                TaskState::Failed => summary.failed.push(entry.report(*id)),
                TaskState::Cancelled => summary.cancelled.push(entry.report(*id)),
                _ => {}
            }
        }
        summary
    }

    /// Counts by state: (queued, running, completed, failed, cancelled).
    pub fn status_counts(&self) -> (usize, usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0, 0);
        for task in self.tasks.values() {
            match task.state {
                TaskState::Queued => counts.0 += 1,
                TaskState::Running | TaskState::Cancelling => counts.1 += 1,
                TaskState::Completed => counts.2 += 1,
                TaskState::Failed => counts.3 += 1,
                TaskState::Cancelled => counts.4 += 1,
            }
        }
        counts
    }
}
