use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_LOG_FILE_NAME: &str = "script.log";
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the engine needs to fan a command list out over a root directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub root_dir: PathBuf,
    /// Each entry is one argv; commands run in this order inside every job.
    pub commands: Vec<Vec<String>>,
    pub concurrency: usize,
    pub retries: u32,
    /// Candidate child directories to descend into; the first one present wins.
    pub subdir_entry_points: Vec<String>,
    pub log_file: PathBuf,
    /// One backoff unit. Attempt `n` failing waits `n` units before the next try.
    #[serde(with = "duration_millis")]
    pub backoff_unit: Duration,
}

impl RunConfig {
    pub fn new(root_dir: impl Into<PathBuf>, commands: Vec<Vec<String>>) -> Self {
        let root_dir = root_dir.into();
        let log_file = root_dir.join(DEFAULT_LOG_FILE_NAME);
        Self {
            root_dir,
            commands,
            concurrency: DEFAULT_CONCURRENCY,
            retries: 0,
            subdir_entry_points: Vec::new(),
            log_file,
            backoff_unit: DEFAULT_BACKOFF,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_entry_points(mut self, entry_points: Vec<String>) -> Self {
        self.subdir_entry_points = entry_points;
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = log_file.into();
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root_dir.join(job_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }
        if self.commands.is_empty() {
            return Err(ConfigError::NoCommands);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// Splits `cmd one; cmd two` (or one command per line) into argv lists.
///
/// Quoting is not interpreted: every argv is a plain whitespace split.
pub fn parse_commands(input: &str) -> Vec<Vec<String>> {
    input
        .split(|c| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.split_whitespace().map(str::to_string).collect())
        .collect()
}

pub fn parse_entry_points(input: &str) -> Vec<String> {
    input
        .split(';')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn command_line(argv: &[String]) -> String {
    argv.join(" ")
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
