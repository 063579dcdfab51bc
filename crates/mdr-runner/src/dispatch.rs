use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::archive::ArchiveReport;
use crate::config::RunConfig;
use crate::error::ArchiveError;
use crate::job::{run_job, JobReport};
use crate::logs::LogArchiver;
use crate::progress::{ProgressRegistry, RunSummary};

/// Runs every job on the blocking pool, `concurrency` at a time.
///
/// A job's task is spawned only after it holds a semaphore permit, so at most
/// `concurrency` job threads exist at once.
pub struct Dispatcher {
    config: Arc<RunConfig>,
    limit: usize,
}

impl Dispatcher {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            limit: config.concurrency.max(1),
            config: Arc::new(config.clone()),
        }
    }

    /// Returns once every job is terminal; reports follow `job_ids` order.
    pub fn dispatch(
        &self,
        job_ids: &[String],
        registry: &Arc<ProgressRegistry>,
        logs: &Arc<LogArchiver>,
    ) -> Result<Vec<JobReport>> {
        registry.register(job_ids);
        let rt = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(self.limit)
            .build()
            .context("failed to create job runtime")?;
        Ok(rt.block_on(self.run_jobs(job_ids, registry, logs)))
    }

    async fn run_jobs(
        &self,
        job_ids: &[String],
        registry: &Arc<ProgressRegistry>,
        logs: &Arc<LogArchiver>,
    ) -> Vec<JobReport> {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut join_set = JoinSet::new();

        for (index, id) in job_ids.iter().enumerate() {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(job = %id, error = %e, "job admission closed");
                    break;
                }
            };
            let id = id.clone();
            let config = Arc::clone(&self.config);
            let registry = Arc::clone(registry);
            let logs = Arc::clone(logs);
            join_set.spawn_blocking(move || {
                let _permit = permit;
                (index, run_job(&id, &config, &registry, &logs))
            });
        }

        let mut slots: Vec<Option<JobReport>> = vec![None; job_ids.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => error!(error = %e, "job task panicked"),
            }
        }
        slots.into_iter().flatten().collect()
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub reports: Vec<JobReport>,
    pub summary: RunSummary,
    pub archive: Result<ArchiveReport, ArchiveError>,
}

/// Full run: log setup, dispatch, summary footer, archive.
///
/// Jobs are registered in `registry` before any runs, so a display loop may
/// poll it from another thread for the whole call. Archive failures are
/// returned inside the outcome; only config, main-log and runtime setup
/// errors fail the call.
pub fn run_all(
    config: &RunConfig,
    job_ids: &[String],
    registry: &Arc<ProgressRegistry>,
) -> Result<RunOutcome> {
    config.validate()?;
    let started = Local::now();
    let logs = LogArchiver::initialize(&config.log_file)
        .context("failed to initialize log file")?;
    run_with_logs(config, job_ids, registry, &Arc::new(logs), started)
}

pub fn run_with_logs(
    config: &RunConfig,
    job_ids: &[String],
    registry: &Arc<ProgressRegistry>,
    logs: &Arc<LogArchiver>,
    started: chrono::DateTime<Local>,
) -> Result<RunOutcome> {
    info!(
        root = %config.root_dir.display(),
        jobs = job_ids.len(),
        concurrency = config.concurrency,
        retries = config.retries,
        "run started"
    );
    let reports = Dispatcher::new(config).dispatch(job_ids, registry, logs)?;
    let summary = RunSummary::from_records(&registry.snapshot_all());

    if let Err(e) = logs.write_summary(started) {
        error!(error = %format!("{:#}", e), "failed to write summary to log file");
    }
    let archive = logs.archive();
    match &archive {
        Ok(report) => registry.annotate_archive(&report.path),
        Err(e) => warn!(error = %e, "failed to archive log files"),
    }
    info!(%summary, "run finished");
    Ok(RunOutcome {
        reports,
        summary,
        archive,
    })
}
