use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::command::{run_command_with_sleep, CommandAttempt, CommandOutcome, RetryPolicy};
use crate::config::{command_line, RunConfig};
use crate::error::AccessError;
use crate::logs::LogArchiver;
use crate::progress::{JobStatus, ProgressRecord, ProgressRegistry};

/// One target directory and its command pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub dir: PathBuf,
    pub commands: Vec<Vec<String>>,
    pub step: usize,
    pub total: usize,
}

impl Job {
    pub fn new(id: &str, config: &RunConfig) -> Self {
        Self {
            id: id.to_string(),
            dir: config.job_dir(id),
            commands: config.commands.clone(),
            step: 0,
            total: config.commands.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub working_dir: Option<PathBuf>,
    pub elapsed: Duration,
    pub artifact: Option<PathBuf>,
}

/// Checks the job directory and applies the first matching entry point.
pub fn resolve_working_dir(dir: &Path, entry_points: &[String]) -> Result<PathBuf, AccessError> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(AccessError {
                path: dir.to_path_buf(),
                reason: "not a directory".to_string(),
            })
        }
        Err(e) => {
            return Err(AccessError {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })
        }
    }
    for name in entry_points {
        let candidate = dir.join(name);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    Ok(dir.to_path_buf())
}

/// Runs one job to a terminal status.
pub fn run_job(
    job_id: &str,
    config: &RunConfig,
    registry: &ProgressRegistry,
    logs: &LogArchiver,
) -> JobReport {
    run_job_with_sleep(job_id, config, registry, logs, std::thread::sleep)
}

pub fn run_job_with_sleep(
    job_id: &str,
    config: &RunConfig,
    registry: &ProgressRegistry,
    logs: &LogArchiver,
    mut sleep: impl FnMut(Duration),
) -> JobReport {
    let started = Instant::now();
    let mut job = Job::new(job_id, config);
    let mut record = registry
        .get(job_id)
        .unwrap_or_else(|| ProgressRecord::waiting(job_id));

    let working_dir = match resolve_working_dir(&job.dir, &config.subdir_entry_points) {
        Ok(dir) => dir,
        Err(access) => {
            record.status = JobStatus::Fail { attempts: None };
            record.command = format!("Failed to access directory: {}", job.dir.display());
            record.output = access.to_string();
            let artifact = write_artifact(logs, job_id, &access_details(&access), false);
            return finish(job_id, record, None, started, artifact, registry, logs);
        }
    };

    let policy = RetryPolicy::new(config.retries, config.backoff_unit);
    let max_attempts = policy.max_attempts();
    let mut transcript = String::new();
    let mut last_attempts = None;
    record.total = job.total;

    for (index, argv) in job.commands.iter().enumerate() {
        job.step = index + 1;
        let command = command_line(argv);
        record.step = job.step;
        record.command = command.clone();
        record.status = JobStatus::Processing;
        registry.update(job_id, record.clone());

        let outcome = run_command_with_sleep(argv, &working_dir, &policy, &mut sleep);
        if !outcome.succeeded() {
            record.status = JobStatus::fail(outcome.attempts_used, max_attempts);
            record.output = outcome.stderr.clone();
            record.command = format!("Failed to execute {}", command);
            let details = failure_details(&command, &outcome, max_attempts, &working_dir);
            let artifact = write_artifact(logs, job_id, &details, false);
            return finish(
                job_id,
                record,
                Some(working_dir),
                started,
                artifact,
                registry,
                logs,
            );
        }
        append_success_section(&mut transcript, job.step, job.total, &command, &outcome, max_attempts);
        last_attempts = Some(outcome.attempts_used);
    }

    record.status = match last_attempts {
        Some(used) => JobStatus::success(used, max_attempts),
        None => JobStatus::Success { attempts: None },
    };
    record.output.clear();
    let _ = writeln!(
        transcript,
        "Total execution time: {:.2}s",
        started.elapsed().as_secs_f64()
    );
    let artifact = write_artifact(logs, job_id, &transcript, true);
    finish(
        job_id,
        record,
        Some(working_dir),
        started,
        artifact,
        registry,
        logs,
    )
}

fn finish(
    job_id: &str,
    record: ProgressRecord,
    working_dir: Option<PathBuf>,
    started: Instant,
    artifact: Option<PathBuf>,
    registry: &ProgressRegistry,
    logs: &LogArchiver,
) -> JobReport {
    let elapsed = started.elapsed();
    let status = record.status;
    registry.update(job_id, record);
    logs.record_job(&status.to_string(), elapsed.as_secs_f64(), job_id);
    info!(job = job_id, status = %status, elapsed_ms = elapsed.as_millis() as u64, "job finished");
    JobReport {
        job_id: job_id.to_string(),
        status,
        working_dir,
        elapsed,
        artifact,
    }
}

fn write_artifact(logs: &LogArchiver, job_id: &str, details: &str, success: bool) -> Option<PathBuf> {
    let written = if success {
        logs.write_success_artifact(job_id, details)
    } else {
        logs.write_error_artifact(job_id, details)
    };
    match written {
        Ok(path) => Some(path),
        Err(e) => {
            error!(job = job_id, error = %format!("{:#}", e), "failed to write job log");
            None
        }
    }
}

fn access_details(access: &AccessError) -> String {
    format!(
        "Failed to access directory: {}\nReason: {}\nOutput: none, no command was executed.\n",
        access.path.display(),
        access.reason
    )
}

fn push_stream(out: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        let _ = writeln!(out, "{}: <no output>", label);
    } else {
        let _ = writeln!(out, "Output ({}):", label);
        out.push_str(text);
        if !text.ends_with('\n') {
            out.push('\n');
        }
    }
}

fn push_attempt(out: &mut String, attempt: &CommandAttempt, max_attempts: u32) {
    let _ = writeln!(out, "--- Attempt {}/{} ---", attempt.number, max_attempts);
    if let Some(err) = &attempt.error {
        let _ = writeln!(out, "Error: {}", err);
    }
    push_stream(out, "stdout", &attempt.stdout);
    push_stream(out, "stderr", &attempt.stderr);
}

fn failure_details(
    command: &str,
    outcome: &CommandOutcome,
    max_attempts: u32,
    working_dir: &Path,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Command: {}", command);
    let _ = writeln!(out, "Working directory: {}", working_dir.display());
    if let Some(err) = &outcome.error {
        let _ = writeln!(out, "Error: {}", err);
    }
    let _ = writeln!(out, "Attempts: {}/{}", outcome.attempts_used, max_attempts);
    for attempt in &outcome.history {
        out.push('\n');
        push_attempt(&mut out, attempt, max_attempts);
    }
    out
}

fn append_success_section(
    out: &mut String,
    step: usize,
    total: usize,
    command: &str,
    outcome: &CommandOutcome,
    max_attempts: u32,
) {
    let _ = writeln!(out, "=== Step {}/{}: {} ===", step, total, command);
    let _ = writeln!(out, "Attempts: {}/{}", outcome.attempts_used, max_attempts);
    push_stream(out, "stdout", &outcome.stdout);
    push_stream(out, "stderr", &outcome.stderr);
    out.push('\n');
}
