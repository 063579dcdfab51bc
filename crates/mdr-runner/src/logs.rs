//! Run logs: the shared main log, one transcript per job, and the final bundle.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{error, info};

use crate::archive::{self, ArchiveFormat, ArchiveReport};
use crate::error::ArchiveError;

pub const DISPLAY_TIMESTAMP: &str = "%d/%m/%Y %H:%M:%S";
pub const SUCCESS_SUFFIX: &str = "_success.txt";
pub const ERROR_SUFFIX: &str = "_error.txt";

/// Error transcripts without this marker get an empty-output explanation.
pub const OUTPUT_MARKER: &str = "Output";

const EMPTY_OUTPUT_NOTE: &str = "\n\nNOTE: Command output was empty. This might indicate:\n\
- Command did not produce any output before failing\n\
- Command may have written output to a file instead of stdout/stderr\n\
- There might be an environment or permission issue\n\
- The process might have been terminated by the operating system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Success,
    Error,
}

impl ArtifactKind {
    fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Success => SUCCESS_SUFFIX,
            ArtifactKind::Error => ERROR_SUFFIX,
        }
    }

    fn title(self) -> &'static str {
        match self {
            ArtifactKind::Success => "Success",
            ArtifactKind::Error => "Error",
        }
    }
}

pub fn format_main_log_line(status: &str, elapsed_secs: f64, job_id: &str) -> String {
    format!(
        "STATUS: {:<10} | TIME: {:5.0} sec | DIR: {:<30}",
        status, elapsed_secs, job_id
    )
}

/// `3m 5s` style; sub-second remainders are dropped.
pub fn format_elapsed(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    format!("{}m {}s", total_secs / 60, total_secs % 60)
}

pub fn artifact_path(log_dir: &Path, job_id: &str, kind: ArtifactKind) -> PathBuf {
    let base = Path::new(job_id)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| job_id.to_string());
    log_dir.join(format!("{}{}", base, kind.suffix()))
}

/// Owner of every log file of one run.
///
/// The main log is appended to by all jobs, so each append happens under
/// `write_lock`; per-job artifacts are written by their job alone.
#[derive(Debug)]
pub struct LogArchiver {
    main_log: PathBuf,
    format: ArchiveFormat,
    write_lock: Mutex<()>,
}

impl LogArchiver {
    /// Creates (or truncates) the main log and writes the run header.
    pub fn initialize(main_log: &Path) -> Result<Self> {
        Self::initialize_with_format(main_log, ArchiveFormat::native())
    }

    pub fn initialize_with_format(main_log: &Path, format: ArchiveFormat) -> Result<Self> {
        if let Some(parent) = main_log.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create log directory {}", parent.display())
            })?;
        }
        let header = format!(
            "Script execution log on {}\n",
            Local::now().format(DISPLAY_TIMESTAMP)
        );
        fs::write(main_log, header)
            .with_context(|| format!("failed to create log file {}", main_log.display()))?;
        Ok(Self {
            main_log: main_log.to_path_buf(),
            format,
            write_lock: Mutex::new(()),
        })
    }

    pub fn main_log(&self) -> &Path {
        &self.main_log
    }

    pub fn log_dir(&self) -> &Path {
        self.main_log
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `line` plus a newline to the main log in a single write.
    pub fn append_line(&self, line: &str) -> Result<()> {
        let _guard = self.lock();
        self.append_unlocked(&format!("{}\n", line))
    }

    fn append_unlocked(&self, text: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.main_log)
            .with_context(|| format!("failed to open log file {}", self.main_log.display()))?;
        f.write_all(text.as_bytes())
            .with_context(|| format!("failed to write to log file {}", self.main_log.display()))?;
        Ok(())
    }

    /// Main log line for a finished job; failures go to the diagnostic channel.
    pub fn record_job(&self, status: &str, elapsed_secs: f64, job_id: &str) {
        let line = format_main_log_line(status, elapsed_secs, job_id);
        if let Err(e) = self.append_line(&line) {
            error!(job = job_id, error = %format!("{:#}", e), "failed to write main log line");
        }
    }

    pub fn write_error_artifact(&self, job_id: &str, details: &str) -> Result<PathBuf> {
        let mut body = details.to_string();
        if body.trim().is_empty() || !body.contains(OUTPUT_MARKER) {
            body.push_str(EMPTY_OUTPUT_NOTE);
        }
        self.write_artifact(job_id, ArtifactKind::Error, &body)
    }

    pub fn write_success_artifact(&self, job_id: &str, details: &str) -> Result<PathBuf> {
        self.write_artifact(job_id, ArtifactKind::Success, details)
    }

    fn write_artifact(&self, job_id: &str, kind: ArtifactKind, body: &str) -> Result<PathBuf> {
        let path = artifact_path(self.log_dir(), job_id, kind);
        let content = format!(
            "{} log for directory '{}' created on {}\n\n{}",
            kind.title(),
            job_id,
            Local::now().format(DISPLAY_TIMESTAMP),
            body
        );
        fs::write(&path, content).with_context(|| {
            format!(
                "failed to write {} log file {}",
                kind.title().to_lowercase(),
                path.display()
            )
        })?;
        Ok(path)
    }

    /// Appends the completion footer with the run's total duration.
    pub fn write_summary(&self, started: DateTime<Local>) -> Result<()> {
        let finished = Local::now();
        let elapsed = finished.signed_duration_since(started).num_seconds();
        let footer = format!(
            "\nExecution completed on {} | Total execution time: {}\n",
            finished.format(DISPLAY_TIMESTAMP),
            format_elapsed(elapsed)
        );
        let _guard = self.lock();
        self.append_unlocked(&footer)
    }

    /// Main log plus every success/error transcript next to it, sorted by name.
    pub fn collect_artifacts(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        let dir = self.log_dir();
        let mut files = Vec::new();
        if self.main_log.is_file() {
            files.push(self.main_log.clone());
        }
        let entries = fs::read_dir(dir).map_err(|source| ArchiveError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut transcripts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArchiveError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(SUCCESS_SUFFIX) || name.ends_with(ERROR_SUFFIX) {
                transcripts.push(entry.path());
            }
        }
        transcripts.sort();
        files.extend(transcripts);
        Ok(files)
    }

    /// Bundles all present log files into one archive and deletes the originals.
    pub fn archive(&self) -> Result<ArchiveReport, ArchiveError> {
        let _guard = self.lock();
        let files = self.collect_artifacts()?;
        if files.is_empty() {
            return Err(ArchiveError::NothingToArchive);
        }
        let (path, out) = archive::create_archive_file(self.log_dir(), &Local::now(), self.format)?;
        if let Err(e) = self.format.write(out, &files) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        let delete_failures = archive::remove_sources(&files);
        info!(archive = %path.display(), members = files.len(), "log files archived");
        Ok(ArchiveReport {
            members: files.iter().map(|f| archive::member_name(f)).collect(),
            path,
            delete_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::thread;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mdr_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn main_log_line_matches_fixed_layout() {
        assert_eq!(
            format_main_log_line("SUCCESS(1/1)", 3.4, "a"),
            format!("STATUS: SUCCESS(1/1) | TIME:     3 sec | DIR: a{}", " ".repeat(29))
        );
        assert_eq!(
            format_main_log_line("FAIL", 0.0, "repo"),
            format!("STATUS: FAIL       | TIME:     0 sec | DIR: repo{}", " ".repeat(26))
        );
    }

    #[test]
    fn elapsed_is_minutes_and_seconds() {
        assert_eq!(format_elapsed(185), "3m 5s");
        assert_eq!(format_elapsed(59), "0m 59s");
        assert_eq!(format_elapsed(-2), "0m 0s");
    }

    #[test]
    fn initialize_creates_parent_and_header() {
        let dir = scratch_dir("logs_init").join("deep").join("er");
        let main_log = dir.join("script.log");
        let logs = LogArchiver::initialize(&main_log).expect("init");
        let content = fs::read_to_string(logs.main_log()).expect("read");
        assert!(content.starts_with("Script execution log on "));
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn concurrent_appends_never_tear_lines() {
        let dir = scratch_dir("logs_append");
        let logs = LogArchiver::initialize(&dir.join("script.log")).expect("init");
        thread::scope(|scope| {
            for t in 0..8 {
                let logs = &logs;
                scope.spawn(move || {
                    for i in 0..50 {
                        logs.record_job("SUCCESS(1/1)", 1.0, &format!("job_{}_{}", t, i));
                    }
                });
            }
        });
        let content = fs::read_to_string(logs.main_log()).expect("read");
        let lines: Vec<&str> = content.lines().skip(1).collect();
        assert_eq!(lines.len(), 400);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("STATUS: SUCCESS(1/1) | TIME:") && l.contains("| DIR: job_")));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn error_artifact_without_output_gets_diagnostic_note() {
        let dir = scratch_dir("logs_error");
        let logs = LogArchiver::initialize(&dir.join("script.log")).expect("init");
        let path = logs
            .write_error_artifact("repo-a", "Command: make\nError: exit status: 2\n")
            .expect("write");
        assert_eq!(path, dir.join("repo-a_error.txt"));
        let content = fs::read_to_string(&path).expect("read");
        assert!(content.starts_with("Error log for directory 'repo-a' created on "));
        assert!(content.contains("NOTE: Command output was empty."));

        let with_output = logs
            .write_error_artifact("repo-b", "Output (stderr):\nboom\n")
            .expect("write");
        let content = fs::read_to_string(with_output).expect("read");
        assert!(!content.contains("NOTE:"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn summary_footer_is_appended() {
        let dir = scratch_dir("logs_summary");
        let logs = LogArchiver::initialize(&dir.join("script.log")).expect("init");
        let started = Local::now() - chrono::Duration::seconds(65);
        logs.write_summary(started).expect("summary");
        let content = fs::read_to_string(logs.main_log()).expect("read");
        let footer = content.lines().last().expect("footer");
        assert!(footer.starts_with("Execution completed on "));
        assert!(
            footer.ends_with("| Total execution time: 1m 5s")
                || footer.ends_with("| Total execution time: 1m 6s"),
            "unexpected footer: {}",
            footer
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn archive_bundles_and_removes_artifacts() {
        let dir = scratch_dir("logs_archive");
        let logs =
            LogArchiver::initialize_with_format(&dir.join("script.log"), ArchiveFormat::TarGz)
                .expect("init");
        logs.write_success_artifact("a", "ok").expect("a");
        logs.write_error_artifact("b", "Output: x").expect("b");
        fs::write(dir.join("unrelated.txt"), "keep").expect("unrelated");

        let report = logs.archive().expect("archive");
        assert_eq!(
            report.members,
            vec!["script.log", "a_success.txt", "b_error.txt"]
        );
        assert!(report.delete_failures.is_empty());
        assert!(report.path.exists());
        assert!(report
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("logs-") && n.ends_with(".tar.gz"))
            .unwrap_or(false));
        assert!(!dir.join("script.log").exists());
        assert!(!dir.join("a_success.txt").exists());
        assert!(dir.join("unrelated.txt").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zip_archive_holds_every_log_and_removes_originals() {
        use std::io::Read;

        let dir = scratch_dir("logs_zip");
        let logs = LogArchiver::initialize_with_format(&dir.join("script.log"), ArchiveFormat::Zip)
            .expect("init");
        logs.record_job("FAIL(2/2)", 4.0, "b");
        logs.write_success_artifact("a", "ok").expect("a");
        logs.write_error_artifact("b", "Output (stderr):\nboom\n").expect("b");

        let report = logs.archive().expect("archive");
        assert!(report
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("logs-") && n.ends_with(".zip"))
            .unwrap_or(false));
        assert_eq!(
            report.members,
            vec!["script.log", "a_success.txt", "b_error.txt"]
        );

        let mut zip =
            zip::ZipArchive::new(fs::File::open(&report.path).expect("open")).expect("zip");
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["a_success.txt", "b_error.txt", "script.log"]);
        let mut main_log = String::new();
        zip.by_name("script.log")
            .expect("member")
            .read_to_string(&mut main_log)
            .expect("read");
        assert!(main_log.contains("STATUS: FAIL(2/2)"));

        assert!(!dir.join("script.log").exists());
        assert!(!dir.join("a_success.txt").exists());
        assert!(!dir.join("b_error.txt").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn archive_with_nothing_present_fails() {
        let dir = scratch_dir("logs_empty");
        let logs = LogArchiver::initialize(&dir.join("script.log")).expect("init");
        fs::remove_file(logs.main_log()).expect("remove main log");
        let err = logs.archive().expect_err("nothing to archive");
        assert!(matches!(err, ArchiveError::NothingToArchive));
        assert_eq!(err.to_string(), "no log files found to archive");
        let _ = fs::remove_dir_all(dir);
    }
}
