//! Fan a fixed command pipeline out over the child directories of a root.
//!
//! Jobs run concurrently behind a semaphore, commands within a job run
//! in order with bounded retries, progress is published to a shared
//! [`ProgressRegistry`], and every run ends with its logs bundled into one
//! timestamped archive.

pub mod archive;
pub mod command;
pub mod config;
pub mod discover;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod logs;
pub mod progress;

pub use archive::{ArchiveFormat, ArchiveReport};
pub use command::{run_command, CommandAttempt, CommandOutcome, RetryPolicy};
pub use config::{parse_commands, parse_entry_points, RunConfig};
pub use discover::list_subdirectories;
pub use dispatch::{run_all, run_with_logs, Dispatcher, RunOutcome};
pub use error::{AccessError, ArchiveError, CommandError, ConfigError};
pub use job::{resolve_working_dir, run_job, Job, JobReport};
pub use logs::LogArchiver;
pub use progress::{
    render_record, render_snapshot, Attempts, JobStatus, ProgressObserver, ProgressRecord,
    ProgressRegistry, RunSummary,
};
