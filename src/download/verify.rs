// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Checksum verification of downloaded artifacts.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::LazyLock;

use md5::Md5;
use regex::Regex;
use sha2::{Digest, Sha256, Sha512};

use super::error::TransferError;

const CHUNK: usize = 8 * 1024 * 1024;

/// Digest algorithm, inferred from the hex length of an expected digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(HashAlgorithm::Md5),
            64 => Some(HashAlgorithm::Sha256),
            128 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Hex digest of the file at `path`.
pub fn compute_hash(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    match algorithm {
        HashAlgorithm::Md5 => digest_file::<Md5>(path),
        HashAlgorithm::Sha256 => digest_file::<Sha256>(path),
        HashAlgorithm::Sha512 => digest_file::<Sha512>(path),
    }
}

fn digest_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check `path` against `expected`. Blocking; run it off the async runtime.
///
/// A mismatch is reported as [`TransferError::ChecksumMismatch`]; a digest
/// of unknown length as [`TransferError::InvalidSource`].
pub fn verify_file(path: &Path, expected: &str) -> Result<(), TransferError> {
    let expected = expected.trim().to_ascii_lowercase();
    let algorithm = HashAlgorithm::from_hex_len(expected.len())
        .filter(|_| expected.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| TransferError::InvalidSource(format!("unrecognized checksum '{}'", expected)))?;

    let actual = compute_hash(path, algorithm).map_err(|e| TransferError::from_io(path, &e))?;
    if actual == expected {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch { expected, actual })
    }
}

static PLAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<hash>[a-fA-F0-9]{128}|[a-fA-F0-9]{64}|[a-fA-F0-9]{32})\s+\*?(?P<name>.+)$")
        .expect("plain checksum pattern is valid")
});

static BSD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:SHA256|SHA512|MD5)\s*\((?P<name>.+)\)\s*=\s*(?P<hash>[a-fA-F0-9]+)$")
        .expect("bsd checksum pattern is valid")
});

/// Parse a published checksum list (`SHA256SUMS`, `CHECKSUM`, `*.sha256`...).
///
/// Returns filename to lowercase digest. Comments and unknown lines are
/// skipped.
pub fn parse_checksum_file(content: &str) -> HashMap<String, String> {
    let mut hashes = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let caps = match BSD.captures(line).or_else(|| PLAIN.captures(line)) {
            Some(caps) => caps,
            None => continue,
        };
        let mut name = caps["name"].trim();
        if let Some(inner) = name.strip_prefix('(').and_then(|n| n.strip_suffix(')')) {
            name = inner.trim();
        }
        let name = name.trim_start_matches("./");
        hashes.insert(name.to_string(), caps["hash"].to_ascii_lowercase());
    }
    hashes
}

/// Look up the digest for `filename`: exact name, then basename, then
/// case-insensitive basename.
pub fn lookup_checksum<'a>(hashes: &'a HashMap<String, String>, filename: &str) -> Option<&'a str> {
    if let Some(hash) = hashes.get(filename) {
        return Some(hash);
    }
    let basename = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);
    if let Some(hash) = hashes.get(basename) {
        return Some(hash);
    }
    hashes
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(basename))
        .map(|(_, hash)| hash.as_str())
}
