// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parser for the fetch binary's console summary lines.
//!
//! aria2c prints one bracketed summary per interval:
//!
//! ```text
//! [#2089b0 7.5MiB/100MiB(7%) CN:5 SD:3 DL:2.5MiB ETA:30s]
//! ```
//!
//! [`parse_line`] turns such a line into an updated [`Progress`]. Anything
//! else (notices, the download-results table, blank lines) yields `None`.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;

use super::types::Progress;

static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[#[0-9A-Za-z]+\s+(?P<body>.*)\]").expect("summary pattern is valid")
});

static SIZES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<done>\d+(?:\.\d+)?)(?P<done_unit>[KMGT]iB|B)/(?P<total>\d+(?:\.\d+)?)(?P<total_unit>[KMGT]iB|B)")
        .expect("size pattern is valid")
});

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((?P<pct>\d{1,3})%\)").expect("percent pattern is valid"));

static CONNECTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bCN:(?P<n>\d+)").expect("connection pattern is valid"));

static SEEDERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSD:(?P<n>\d+)").expect("seeder pattern is valid"));

static SPEED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bDL:(?P<v>\d+(?:\.\d+)?)(?P<unit>[KMGT]iB|B)").expect("speed pattern is valid")
});

static ETA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bETA:(?:(?P<h>\d+)h)?(?:(?P<m>\d+)m)?(?:(?P<s>\d+)s)?").expect("eta pattern is valid")
});

/// Convert a value with a binary unit suffix to bytes.
pub fn to_bytes(value: f64, unit: &str) -> u64 {
    let multiplier: u64 = match unit {
        "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        _ => 1,
    };
    (value * multiplier as f64) as u64
}

/// Parse one line of fetch-process output against the previous snapshot.
///
/// Returns `None` when the line is not a progress summary. Fields missing
/// from the line keep their previous value.
pub fn parse_line(line: &str, prior: &Progress) -> Option<Progress> {
    let body = SUMMARY.captures(line)?.name("body")?.as_str();

    let mut next = prior.clone();
    let mut matched = false;

    if let Some(caps) = SIZES.captures(body) {
        let done: f64 = caps["done"].parse().ok()?;
        let total: f64 = caps["total"].parse().ok()?;
        next.bytes_done = to_bytes(done, &caps["done_unit"]);
        let total = to_bytes(total, &caps["total_unit"]);
        // 0B totals are printed before the metadata has been fetched
        next.bytes_total = if total > 0 { Some(total) } else { prior.bytes_total };
        matched = true;
    }

    if let Some(caps) = PERCENT.captures(body) {
        if let Ok(pct) = caps["pct"].parse::<u8>() {
            next.percent = Some(pct.min(100));
            matched = true;
        }
    }

    if let Some(caps) = CONNECTIONS.captures(body) {
        next.peers = caps["n"].parse().ok();
        matched = true;
    }

    if let Some(caps) = SEEDERS.captures(body) {
        next.seeders = caps["n"].parse().ok();
        matched = true;
    }

    if let Some(caps) = SPEED.captures(body) {
        if let Ok(v) = caps["v"].parse::<f64>() {
            next.rate_bytes_per_sec = to_bytes(v, &caps["unit"]);
            matched = true;
        }
    } else if matched {
        next.rate_bytes_per_sec = 0;
    }

    next.eta_secs = ETA.captures(body).and_then(|caps| {
        let part = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<u64>().ok());
        let (h, m, s) = (part("h"), part("m"), part("s"));
        if h.is_none() && m.is_none() && s.is_none() {
            None
        } else {
            Some(h.unwrap_or(0) * 3600 + m.unwrap_or(0) * 60 + s.unwrap_or(0))
        }
    });

    if !matched {
        return None;
    }

    next.timestamp = Utc::now().max(prior.timestamp);
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_torrent_line() {
        let prior = Progress::default();
        let line = "[#2089b0 7.5MiB/100MiB(7%) CN:5 SD:3 DL:2.5MiB ETA:30s]";
        let p = parse_line(line, &prior).expect("summary line parses");

        assert_eq!(p.bytes_done, (7.5 * 1048576.0) as u64);
        assert_eq!(p.bytes_total, Some(100 * 1048576));
        assert_eq!(p.percent, Some(7));
        assert_eq!(p.peers, Some(5));
        assert_eq!(p.seeders, Some(3));
        assert_eq!(p.rate_bytes_per_sec, (2.5 * 1048576.0) as u64);
        assert_eq!(p.eta_secs, Some(30));
    }

    #[test]
    fn test_parse_http_style_line_without_seeders() {
        let line = " *** Download Progress Summary ***\n[#a1b2c3 400KiB/1.0GiB(0%) CN:1 DL:115KiB ETA:2h3m4s]";
        let p = parse_line(line, &Progress::default()).expect("parses");
        assert_eq!(p.bytes_done, 400 * 1024);
        assert_eq!(p.bytes_total, Some(1 << 30));
        assert_eq!(p.seeders, None);
        assert_eq!(p.eta_secs, Some(2 * 3600 + 3 * 60 + 4));
    }

    #[test]
    fn test_zero_total_keeps_prior_total() {
        let prior = Progress::new(10, Some(4096));
        let p = parse_line("[#abc 0B/0B CN:1 DL:0B]", &prior).expect("parses");
        assert_eq!(p.bytes_total, Some(4096));
        assert_eq!(p.bytes_done, 0);
        assert_eq!(p.rate_bytes_per_sec, 0);
        assert_eq!(p.eta_secs, None);
    }

    #[test]
    fn test_unparseable_lines_are_ignored() {
        let prior = Progress::default();
        assert!(parse_line("", &prior).is_none());
        assert!(parse_line("10/17 12:00:01 [NOTICE] Downloading 1 item(s)", &prior).is_none());
        assert!(parse_line("2089b0|OK  |   115KiB/s|/tmp/file.iso", &prior).is_none());
        assert!(parse_line("[#abc]", &prior).is_none());
        assert!(parse_line("[#abc garbage]", &prior).is_none());
    }

    #[test]
    fn test_metadata_phase_line() {
        let line = "[#f00d [METADATA]0B/0B CN:12 SD:0 DL:0B]";
        let p = parse_line(line, &Progress::default()).expect("parses");
        assert_eq!(p.peers, Some(12));
        assert_eq!(p.seeders, Some(0));
        assert_eq!(p.bytes_total, None);
    }

    #[test]
    fn test_timestamp_never_decreases() {
        let mut prior = Progress::default();
        prior.timestamp = Utc::now() + chrono::Duration::seconds(60);
        let p = parse_line("[#abc 1MiB/2MiB(50%) CN:1 DL:1MiB]", &prior).expect("parses");
        assert_eq!(p.timestamp, prior.timestamp);
    }

    #[test]
    fn test_to_bytes_units() {
        assert_eq!(to_bytes(1.0, "B"), 1);
        assert_eq!(to_bytes(1.0, "KiB"), 1024);
        assert_eq!(to_bytes(1.5, "MiB"), 1_572_864);
        assert_eq!(to_bytes(2.0, "GiB"), 2_147_483_648);
        assert_eq!(to_bytes(1.0, "TiB"), 1_099_511_627_776);
    }
}
