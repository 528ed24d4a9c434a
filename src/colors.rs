// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! ANSI color codes for CLI output
//!
//! Color usage conventions:
//! - RED = Failed tasks, fatal errors
//! - GREEN = Completed tasks
//! - YELLOW = Warnings, cancelled tasks, retries
//! - CYAN = Info messages, branding
//! - GRAY = Paths and secondary details

/// Reset all formatting
pub const RESET: &str = "\x1b[0m";

/// Bold text
pub const BOLD: &str = "\x1b[1m";

/// Dimmed/faint text
pub const DIM: &str = "\x1b[2m";

/// Red text (failures)
pub const RED: &str = "\x1b[31m";

/// Green text (success)
pub const GREEN: &str = "\x1b[32m";

/// Yellow text (warnings, cancellations)
pub const YELLOW: &str = "\x1b[33m";

/// Cyan text (info, branding)
pub const CYAN: &str = "\x1b[36m";

/// Bright black (gray) for subtle secondary text
pub const GRAY: &str = "\x1b[90m";

/// Symbols for status and feedback (no emoji)
pub mod symbols {
    pub const SUCCESS: &str = "[OK]";
    pub const ERROR: &str = "[X]";
    pub const WARNING: &str = "[!]";
    pub const INFO: &str = "[i]";
    pub const ARROW: &str = "->";
}

/// Render a separator line
pub fn separator(width: usize) -> String {
    format!("{}{}{}", DIM, "─".repeat(width), RESET)
}
