//! Flattening log bundler with two interchangeable container formats.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ArchiveError;

pub const ARCHIVE_PREFIX: &str = "logs-";
pub const ARCHIVE_TIMESTAMP: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Zip where that is the platform's everyday container, tar.gz elsewhere.
    pub fn native() -> Self {
        if cfg!(windows) {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    /// Writes `files` into `out`, each member named by its base name only.
    pub fn write(self, out: File, files: &[PathBuf]) -> Result<(), ArchiveError> {
        match self {
            ArchiveFormat::Zip => write_zip(out, files),
            ArchiveFormat::TarGz => write_tar_gz(out, files),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub members: Vec<String>,
    /// Sources archived but not removed afterwards, with the reason.
    pub delete_failures: Vec<(PathBuf, String)>,
}

pub fn archive_file_name(created: &DateTime<Local>, format: ArchiveFormat) -> String {
    format!(
        "{}{}.{}",
        ARCHIVE_PREFIX,
        created.format(ARCHIVE_TIMESTAMP),
        format.extension()
    )
}

/// Creates a fresh archive file in `dir`, never reusing an existing name.
pub fn create_archive_file(
    dir: &Path,
    created: &DateTime<Local>,
    format: ArchiveFormat,
) -> Result<(PathBuf, File), ArchiveError> {
    let base = archive_file_name(created, format);
    let stem = base.trim_end_matches(&format!(".{}", format.extension()));
    let mut suffix = 1;
    loop {
        let name = if suffix == 1 {
            base.clone()
        } else {
            format!("{}-{}.{}", stem, suffix, format.extension())
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => return Err(ArchiveError::Create { path, source }),
        }
    }
}

pub fn member_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn write_zip(out: File, files: &[PathBuf]) -> Result<(), ArchiveError> {
    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in files {
        zip.start_file(member_name(path), options)?;
        let mut src = File::open(path).map_err(|source| ArchiveError::Write {
            path: path.clone(),
            source,
        })?;
        io::copy(&mut src, &mut zip).map_err(|source| ArchiveError::Write {
            path: path.clone(),
            source,
        })?;
    }
    zip.finish()?;
    Ok(())
}

fn write_tar_gz(out: File, files: &[PathBuf]) -> Result<(), ArchiveError> {
    let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    for path in files {
        builder
            .append_path_with_name(path, member_name(path))
            .map_err(|source| ArchiveError::Write {
                path: path.clone(),
                source,
            })?;
    }
    let finish = |source: io::Error| ArchiveError::Write {
        path: PathBuf::from("<archive trailer>"),
        source,
    };
    let encoder = builder.into_inner().map_err(finish)?;
    encoder.finish().map_err(finish)?;
    Ok(())
}

/// Removes archived sources; a failure is recorded and the rest still go.
pub fn remove_sources(files: &[PathBuf]) -> Vec<(PathBuf, String)> {
    let mut failures = Vec::new();
    for path in files {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(
                file = %path.display(),
                error = %e,
                "failed to delete original log file"
            );
            failures.push((path.clone(), e.to_string()));
        }
    }
    failures
}
