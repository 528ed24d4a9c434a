// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hand-off of finished artifacts to a remote host.
//!
//! The engine never deploys on its own; the CLI picks completed items from
//! the [`Summary`] and passes them to a [`DeployTransport`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::config::DeployTarget;
use crate::download::Summary;

/// Result of deploying one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub success: bool,
    pub message: String,
}

impl DeployOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Something that can copy an artifact to its final home.
pub trait DeployTransport: Send + Sync {
    fn deploy(&self, artifact: &Path) -> DeployOutcome;
}

/// Copies artifacts with `rsync`.
///
/// Arguments are passed to the process individually, never through a shell.
#[derive(Debug, Clone)]
pub struct RsyncTransport {
    program: PathBuf,
    target: DeployTarget,
}

impl RsyncTransport {
    pub fn new(target: DeployTarget) -> Self {
        Self::with_program("rsync", target)
    }

    pub fn with_program(program: impl Into<PathBuf>, target: DeployTarget) -> Self {
        Self {
            program: program.into(),
            target,
        }
    }

    /// Full argument list for one artifact.
    pub fn args(&self, artifact: &Path) -> Vec<String> {
        let mut args = vec!["-a".to_string(), "--partial".to_string()];
        args.extend(self.target.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(artifact.display().to_string());
        args.push(self.target.destination.clone());
        args
    }
}

impl DeployTransport for RsyncTransport {
    fn deploy(&self, artifact: &Path) -> DeployOutcome {
        if !artifact.exists() {
            return DeployOutcome::failed(format!("{} does not exist", artifact.display()));
        }

        info!(
            target: "deploy",
            artifact = %artifact.display(),
            destination = %self.target.destination,
            "deploying"
        );
        let output = Command::new(&self.program)
            .args(self.args(artifact))
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(out) if out.status.success() => {
                DeployOutcome::ok(format!("copied to {}", self.target.destination))
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let detail = stderr.lines().last().unwrap_or("").trim().to_string();
                warn!(target: "deploy", status = ?out.status.code(), detail = %detail, "rsync failed");
                DeployOutcome::failed(format!("rsync exited with {}: {}", out.status, detail))
            }
            Err(e) => {
                warn!(target: "deploy", error = %e, "could not start rsync");
                DeployOutcome::failed(format!("could not start {}: {}", self.program.display(), e))
            }
        }
    }
}

/// Completed artifacts whose request label is one of `markers`.
pub fn select_for_deploy(summary: &Summary, markers: &BTreeSet<String>) -> Vec<PathBuf> {
    summary
        .succeeded
        .iter()
        .filter(|r| r.request.label.as_ref().is_some_and(|l| markers.contains(l)))
        .map(|r| r.artifact.clone().unwrap_or_else(|| r.request.destination.clone()))
        .collect()
}
