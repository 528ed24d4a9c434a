// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Decompression of finished downloads into raw images.
//!
//! Runs after a task completes. A failure here never fails the task: the
//! compressed original stays in place and the report carries a warning.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use tracing::{info, warn};

/// Archive formats that are kept as downloaded.
const TEMPLATE_SUFFIXES: &[&str] = &[".tar.gz", ".tar.bz2", ".tgz"];

/// Supported compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Zip,
}

impl Compression {
    /// Detect the format from the file name.
    ///
    /// Container archives like `.tar.gz` are left alone and yield `None`.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if TEMPLATE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return None;
        }
        if name.ends_with(".gz") {
            Some(Compression::Gzip)
        } else if name.ends_with(".bz2") {
            Some(Compression::Bzip2)
        } else if name.ends_with(".zip") {
            Some(Compression::Zip)
        } else {
            None
        }
    }
}

/// Result of post-processing one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessOutcome {
    /// The ready artifact: decompressed output, or the original
    pub artifact: PathBuf,
    /// Set when decompression was attempted and failed
    pub warning: Option<String>,
}

impl PostProcessOutcome {
    fn unchanged(path: &Path) -> Self {
        Self {
            artifact: path.to_path_buf(),
            warning: None,
        }
    }
}

/// Decompress `path` if its name says it is compressed.
pub async fn post_process(path: PathBuf) -> PostProcessOutcome {
    let fallback = path.clone();
    match tokio::task::spawn_blocking(move || decompress(&path)).await {
        Ok(outcome) => outcome,
        Err(e) => PostProcessOutcome {
            artifact: fallback,
            warning: Some(format!("decompression task failed: {}", e)),
        },
    }
}

/// Blocking variant of [`post_process`].
pub fn decompress(path: &Path) -> PostProcessOutcome {
    let Some(format) = Compression::detect(path) else {
        return PostProcessOutcome::unchanged(path);
    };

    let result = match format {
        Compression::Gzip => stream_to(path, &strip_extension(path), |f| Box::new(MultiGzDecoder::new(f))),
        Compression::Bzip2 => stream_to(path, &strip_extension(path), |f| Box::new(MultiBzDecoder::new(f))),
        Compression::Zip => extract_largest(path),
    };

    match result {
        Ok(output) => {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "could not remove compressed original");
            }
            info!(from = %path.display(), to = %output.display(), "decompressed");
            PostProcessOutcome {
                artifact: output,
                warning: None,
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "decompression failed, keeping original");
            PostProcessOutcome {
                artifact: path.to_path_buf(),
                warning: Some(format!("decompression of {} failed: {}", path.display(), e)),
            }
        }
    }
}

fn strip_extension(path: &Path) -> PathBuf {
    path.with_extension("")
}

fn temp_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `reader` to `output` through a temp file; the temp file is renamed
/// only when it is non-empty.
fn write_verified(reader: &mut dyn io::Read, output: &Path) -> io::Result<()> {
    let tmp = temp_path(output);
    let result = (|| {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let written = io::copy(reader, &mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "decompressed output is empty"));
        }
        fs::rename(&tmp, output)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn stream_to<F>(path: &Path, output: &Path, decoder: F) -> io::Result<PathBuf>
where
    F: FnOnce(BufReader<File>) -> Box<dyn io::Read>,
{
    let file = BufReader::new(File::open(path)?);
    let mut reader = decoder(file);
    write_verified(&mut reader, output)?;
    Ok(output.to_path_buf())
}

/// Extract the largest file entry next to the archive.
fn extract_largest(path: &Path) -> io::Result<PathBuf> {
    let mut archive = zip::ZipArchive::new(BufReader::new(File::open(path)?)).map_err(zip_error)?;

    let mut largest: Option<(usize, u64)> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }
        if largest.map_or(true, |(_, size)| entry.size() > size) {
            largest = Some((i, entry.size()));
        }
    }
    let (index, _) =
        largest.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "archive has no files"))?;

    let mut entry = archive.by_index(index).map_err(zip_error)?;
    let name = entry
        .enclosed_name()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsafe entry name in archive"))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let output = dir.join(name);

    write_verified(&mut entry, &output)?;
    Ok(output)
}

fn zip_error(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
