// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! User-facing error rendering for the distroget CLI.
//!
//! Terminal failures and API errors are printed with possible causes,
//! suggested fixes and a pointer to the log.

use std::fmt;

use crate::download::{DownloadError, FailureReason, TaskFailure, TransferError};

/// Closing line of every rendered error.
pub const HELP_FOOTER: &str = "For details, run again with --log-level debug and read the log file.";

/// Formats an error message with title, causes, fixes, and help footer.
///
/// # Arguments
///
/// * `title` - The error title (e.g., "Download of debian-12.iso failed")
/// * `causes` - List of possible causes
/// * `fixes` - List of suggested fixes (should be actionable commands or steps)
///
/// # Example
///
/// ```
/// use distroget::error::format_error;
///
/// let error = format_error(
///     "Download of debian-12.iso failed",
///     &[
///         "Mirror returned 404",
///         "Release was moved to the archive",
///     ],
///     &[
///         "Check the URL in a browser",
///         "Pick another mirror",
///     ],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    // Error title
    output.push_str(&format!("[✗] {}\n\n", title));

    // Possible causes
    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    // Suggested fixes
    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(HELP_FOOTER);

    output
}

/// Formats a simple error with just a title and help footer.
pub fn format_simple_error(title: &str) -> String {
    format!("[✗] {}\n\n{}", title, HELP_FOOTER)
}

/// Builder for constructing formatted error messages.
///
/// # Example
///
/// ```
/// use distroget::error::ErrorBuilder;
///
/// let error = ErrorBuilder::new("Torrent fetcher not found")
///     .cause("aria2c is not installed")
///     .fix("Install it: sudo apt install aria2")
///     .fix("Check again: distroget check")
///     .build();
/// println!("{}", error);
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}

/// Macro to quickly create formatted errors.
///
/// # Examples
///
/// ```
/// use distroget::error_msg;
///
/// let error = error_msg!(
///     "Invalid configuration",
///     causes: [
///         "max_concurrency is 0",
///     ],
///     fixes: [
///         "Inspect it: distroget config show",
///         "Reset it: distroget config set-concurrency 3",
///     ]
/// );
/// ```
#[macro_export]
macro_rules! error_msg {
    ($title:expr, causes: [$($cause:expr),* $(,)?], fixes: [$($fix:expr),* $(,)?]) => {
        $crate::error::format_error(
            $title,
            &[$($cause),*],
            &[$($fix),*]
        )
    };
    ($title:expr, causes: [$($cause:expr),* $(,)?]) => {
        {
            let causes = vec![$($cause),*];
            let mut output = format!("[✗] {}\n\n", $title);
            if !causes.is_empty() {
                output.push_str("Possible causes:\n");
                for cause in &causes {
                    output.push_str(&format!("  - {}\n", cause));
                }
                output.push('\n');
            }
            output.push_str($crate::error::HELP_FOOTER);
            output
        }
    };
    ($title:expr, fixes: [$($fix:expr),* $(,)?]) => {
        {
            let fixes = vec![$($fix),*];
            let mut output = format!("[✗] {}\n\n", $title);
            if !fixes.is_empty() {
                output.push_str("Try these fixes:\n");
                for (i, fix) in fixes.iter().enumerate() {
                    output.push_str(&format!("  {}. {}\n", i + 1, fix));
                }
                output.push('\n');
            }
            output.push_str($crate::error::HELP_FOOTER);
            output
        }
    };
    ($title:expr) => {
        $crate::error::format_simple_error($title)
    };
}

/// Render a terminal task failure with causes and fixes for its reason.
pub fn explain_failure(name: &str, failure: &TaskFailure) -> String {
    let title = format!("Download of {} failed: {}", name, failure.message());
    let builder = ErrorBuilder::new(title);
    let builder = match failure.reason {
        FailureReason::FetchBinaryUnavailable => builder
            .cause("Torrent and magnet sources need aria2c")
            .fix("Install aria2c with your package manager")
            .fix("Or use a direct HTTP(S) link for this image")
            .fix("Verify: distroget check"),
        FailureReason::RetriesExhausted => builder
            .cause("The mirror is overloaded or unreachable")
            .cause("The connection stalled for longer than the idle timeout")
            .fix("Run the same command again; completed bytes are resumed")
            .fix("Try a different mirror"),
        FailureReason::DestinationUnwritable => builder
            .cause("The download directory is read-only or full")
            .fix("Pick another directory: distroget config set-dir <DIR>"),
        FailureReason::Rejected => match failure.error {
            TransferError::HttpStatus { status } if status == 404 || status == 410 => builder
                .cause("The release is no longer on this mirror")
                .fix("Check the catalog for a newer release"),
            TransferError::OutputMissing(_) => builder
                .cause("The torrent names a different file than expected")
                .fix("Look in the download directory for the fetched file"),
            _ => builder.fix("Check the URL in a browser"),
        },
    };
    builder.build()
}

/// Render an error returned by the download manager API.
pub fn explain_download_error(error: &DownloadError) -> String {
    match error {
        DownloadError::InvalidRequest { .. } => error_msg!(
            &error.to_string(),
            causes: ["Sources must be http(s) URLs, .torrent URLs or magnet links"],
            fixes: ["Quote URLs that contain '&' in your shell"]
        ),
        DownloadError::DestinationBusy { .. } => error_msg!(
            &error.to_string(),
            fixes: ["Wait for the running download to finish, then retry"]
        ),
        _ => format_simple_error(&error.to_string()),
    }
}
