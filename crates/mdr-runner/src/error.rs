use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A single command attempt that did not succeed.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command has no program to run")]
    EmptyArgv,
    #[error("failed to launch process: {0}")]
    Launch(#[source] io::Error),
    #[error("{}", describe_exit(.code))]
    Exit { code: Option<i32> },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit status: {}", c),
        None => "terminated by signal".to_string(),
    }
}

/// The job's working directory could not be used; no command runs.
#[derive(Debug, Error)]
#[error("failed to access directory: {} ({reason})", .path.display())]
pub struct AccessError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no log files found to archive")]
    NothingToArchive,
    #[error("failed to read log directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create archive {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to add {} to archive: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("directory path cannot be empty")]
    EmptyRoot,
    #[error("commands cannot be empty")]
    NoCommands,
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
}
