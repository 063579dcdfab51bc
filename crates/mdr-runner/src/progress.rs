//! Shared per-job progress state.
//!
//! Every job owns exactly one [`ProgressRecord`]. Jobs publish full
//! replacements through [`ProgressRegistry::update`]; display consumers read
//! copy-out snapshots through [`ProgressRegistry::snapshot_all`] and may
//! subscribe to every accepted update with a [`ProgressObserver`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Attempts {
    pub used: u32,
    pub max: u32,
}

/// Lifecycle of a job: `Waiting -> Processing* -> Success | Fail`.
///
/// Terminal variants carry `None` when no command ever executed (directory
/// access failure, empty command list) and render as plain `FAIL` /
/// `SUCCESS`; otherwise they render with attempt counters, e.g. `FAIL(3/3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Processing,
    Success { attempts: Option<Attempts> },
    Fail { attempts: Option<Attempts> },
}

impl JobStatus {
    pub fn success(used: u32, max: u32) -> Self {
        JobStatus::Success {
            attempts: Some(Attempts { used, max }),
        }
    }

    pub fn fail(used: u32, max: u32) -> Self {
        JobStatus::Fail {
            attempts: Some(Attempts { used, max }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success { .. } | JobStatus::Fail { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Fail { .. })
    }

    /// `(used, max)`; `(0, 0)` for non-terminal and unannotated statuses.
    pub fn attempts(&self) -> (u32, u32) {
        match self {
            JobStatus::Success {
                attempts: Some(a),
            }
            | JobStatus::Fail {
                attempts: Some(a),
            } => (a.used, a.max),
            _ => (0, 0),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waiting => f.write_str("Waiting"),
            JobStatus::Processing => f.write_str("Processing"),
            JobStatus::Success { attempts: None } => f.write_str("SUCCESS"),
            JobStatus::Success { attempts: Some(a) } => {
                write!(f, "SUCCESS({}/{})", a.used, a.max)
            }
            JobStatus::Fail { attempts: None } => f.write_str("FAIL"),
            JobStatus::Fail { attempts: Some(a) } => write!(f, "FAIL({}/{})", a.used, a.max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressRecord {
    pub job_id: String,
    /// 1-indexed step currently (or last) executed; 0 before the first command.
    pub step: usize,
    pub total: usize,
    pub command: String,
    pub status: JobStatus,
    /// Last captured error output.
    pub output: String,
    pub archive_path: Option<PathBuf>,
}

impl ProgressRecord {
    pub fn waiting(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            step: 0,
            total: 0,
            command: "Initializing".to_string(),
            status: JobStatus::Waiting,
            output: String::new(),
            archive_path: None,
        }
    }
}

/// Receives every accepted registry update, after the registry lock is released.
pub trait ProgressObserver: Send + Sync {
    fn on_update(&self, record: &ProgressRecord);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressRecord) + Send + Sync,
{
    fn on_update(&self, record: &ProgressRecord) {
        self(record)
    }
}

#[derive(Default)]
struct RegistryState {
    order: Vec<String>,
    records: HashMap<String, ProgressRecord>,
}

#[derive(Default)]
pub struct ProgressRegistry {
    state: Mutex<RegistryState>,
    observers: RwLock<Vec<Arc<dyn ProgressObserver>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs<I, S>(job_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        registry.register(job_ids);
        registry
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        // A panicking display consumer must not wedge every job.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a `Waiting` record per id; ids already registered are left untouched.
    pub fn register<I, S>(&self, job_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.lock_state();
        for id in job_ids {
            let id = id.as_ref();
            if state.records.contains_key(id) {
                continue;
            }
            state.order.push(id.to_string());
            state
                .records
                .insert(id.to_string(), ProgressRecord::waiting(id));
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Replaces the stored record for `job_id`.
    ///
    /// Returns `false` without storing anything if the job is unknown or its
    /// current record is already terminal.
    pub fn update(&self, job_id: &str, record: ProgressRecord) -> bool {
        {
            let mut state = self.lock_state();
            let Some(current) = state.records.get_mut(job_id) else {
                warn!(job = job_id, "progress update for unregistered job ignored");
                return false;
            };
            if current.status.is_terminal() {
                warn!(
                    job = job_id,
                    current = %current.status,
                    rejected = %record.status,
                    "progress update for a finished job ignored"
                );
                return false;
            }
            *current = record.clone();
        }
        self.notify(&record);
        true
    }

    pub fn get(&self, job_id: &str) -> Option<ProgressRecord> {
        self.lock_state().records.get(job_id).cloned()
    }

    /// Point-in-time copy of every record, in registration order.
    pub fn snapshot_all(&self) -> Vec<ProgressRecord> {
        let state = self.lock_state();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.lock_state()
            .records
            .values()
            .all(|record| record.status.is_terminal())
    }

    /// Records where the run's logs ended up. Allowed on terminal records.
    pub fn annotate_archive(&self, archive_path: &Path) {
        let updated: Vec<ProgressRecord> = {
            let mut state = self.lock_state();
            state
                .records
                .values_mut()
                .map(|record| {
                    record.archive_path = Some(archive_path.to_path_buf());
                    record.clone()
                })
                .collect()
        };
        for record in &updated {
            self.notify(record);
        }
    }

    fn notify(&self, record: &ProgressRecord) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            observer.on_update(record);
        }
    }
}

/// One display line (plus captured output on failure) for a record.
pub fn render_record(record: &ProgressRecord) -> String {
    match record.status {
        JobStatus::Waiting => format!("{} | Waiting...", record.job_id),
        JobStatus::Processing if record.total > 0 => format!(
            "{} | step: {}/{} | command: {}",
            record.job_id, record.step, record.total, record.command
        ),
        JobStatus::Processing => format!("{} | {}", record.job_id, record.command),
        JobStatus::Fail { .. } => {
            let mut line = format!("{} | {}: {}", record.job_id, record.status, record.command);
            let output = record.output.trim_end();
            if !output.is_empty() {
                line.push('\n');
                line.push_str(output);
            }
            line
        }
        JobStatus::Success { .. } => format!("{} | {}", record.job_id, record.status),
    }
}

pub fn render_snapshot(records: &[ProgressRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&render_record(record));
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_records(records: &[ProgressRecord]) -> Self {
        Self {
            total: records.len(),
            succeeded: records.iter().filter(|r| r.status.is_success()).count(),
            failed: records.iter().filter(|r| r.status.is_failure()).count(),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.total
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Success: {}/{} | Failure: {}/{}",
            self.succeeded, self.total, self.failed, self.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn processing(job_id: &str, step: usize, total: usize, command: &str) -> ProgressRecord {
        ProgressRecord {
            step,
            total,
            command: command.to_string(),
            status: JobStatus::Processing,
            ..ProgressRecord::waiting(job_id)
        }
    }

    #[test]
    fn status_strings_distinguish_plain_and_annotated_forms() {
        assert_eq!(JobStatus::Fail { attempts: None }.to_string(), "FAIL");
        assert_eq!(JobStatus::fail(3, 3).to_string(), "FAIL(3/3)");
        assert_eq!(JobStatus::Success { attempts: None }.to_string(), "SUCCESS");
        assert_eq!(JobStatus::success(1, 2).to_string(), "SUCCESS(1/2)");
        assert_eq!(JobStatus::Fail { attempts: None }.attempts(), (0, 0));
        assert!(JobStatus::fail(1, 1).is_failure());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn snapshot_follows_registration_order_not_completion_order() {
        let registry = ProgressRegistry::with_jobs(["c", "a", "b"]);
        assert!(registry.update("b", ProgressRecord {
            status: JobStatus::success(1, 1),
            ..ProgressRecord::waiting("b")
        }));
        assert!(registry.update("c", processing("c", 1, 2, "make")));

        let ids: Vec<String> = registry
            .snapshot_all()
            .into_iter()
            .map(|r| r.job_id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn update_replaces_whole_record() {
        let registry = ProgressRegistry::with_jobs(["a"]);
        let mut first = processing("a", 1, 2, "make");
        first.output = "warning".to_string();
        registry.update("a", first);
        registry.update("a", processing("a", 2, 2, "make test"));

        let record = registry.get("a").expect("registered");
        assert_eq!(record.step, 2);
        assert_eq!(record.output, "");
    }

    #[test]
    fn terminal_records_do_not_regress() {
        let registry = ProgressRegistry::with_jobs(["a"]);
        registry.update("a", ProgressRecord {
            status: JobStatus::fail(1, 1),
            ..ProgressRecord::waiting("a")
        });
        assert!(!registry.update("a", processing("a", 2, 2, "make")));
        assert_eq!(registry.get("a").expect("a").status, JobStatus::fail(1, 1));
        assert!(!registry.update("unknown", processing("unknown", 1, 1, "x")));
    }

    #[test]
    fn terminal_records_are_not_overwritten_by_other_terminal_statuses() {
        let registry = ProgressRegistry::with_jobs(["a"]);
        assert!(registry.update("a", ProgressRecord {
            status: JobStatus::fail(3, 3),
            ..ProgressRecord::waiting("a")
        }));
        assert!(!registry.update("a", ProgressRecord {
            status: JobStatus::success(1, 3),
            ..ProgressRecord::waiting("a")
        }));
        assert!(!registry.update("a", ProgressRecord {
            status: JobStatus::fail(3, 3),
            command: "Failed to execute make".to_string(),
            ..ProgressRecord::waiting("a")
        }));
        let record = registry.get("a").expect("a");
        assert_eq!(record.status, JobStatus::fail(3, 3));
        assert_eq!(record.command, "Initializing");

        registry.annotate_archive(Path::new("/tmp/logs.tar.gz"));
        assert_eq!(
            registry.get("a").expect("a").archive_path.as_deref(),
            Some(Path::new("/tmp/logs.tar.gz"))
        );
    }

    #[test]
    fn archive_annotation_reaches_terminal_records_and_observers() {
        let registry = ProgressRegistry::with_jobs(["a", "b"]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        registry.subscribe(Arc::new(move |record: &ProgressRecord| {
            if record.archive_path.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        registry.update("a", ProgressRecord {
            status: JobStatus::success(1, 1),
            ..ProgressRecord::waiting("a")
        });
        registry.annotate_archive(Path::new("/tmp/logs-20240101-000000.tar.gz"));

        let a = registry.get("a").expect("a");
        assert_eq!(a.status, JobStatus::success(1, 1));
        assert_eq!(
            a.archive_path.as_deref(),
            Some(Path::new("/tmp/logs-20240101-000000.tar.gz"))
        );
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_writers_and_readers_see_consistent_snapshots() {
        let ids: Vec<String> = (0..16).map(|i| format!("job{}", i)).collect();
        let registry = ProgressRegistry::with_jobs(&ids);
        thread::scope(|scope| {
            for id in &ids {
                let registry = &registry;
                scope.spawn(move || {
                    for step in 1..=50 {
                        registry.update(id, processing(id, step, 50, "step"));
                    }
                    registry.update(id, ProgressRecord {
                        step: 50,
                        total: 50,
                        status: JobStatus::success(1, 1),
                        ..ProgressRecord::waiting(id)
                    });
                });
            }
            scope.spawn(|| {
                for _ in 0..100 {
                    let snapshot = registry.snapshot_all();
                    assert_eq!(snapshot.len(), 16);
                }
            });
        });
        assert!(registry.all_terminal());
        let summary = RunSummary::from_records(&registry.snapshot_all());
        assert_eq!(summary.succeeded, 16);
        assert!(summary.all_succeeded());
    }

    #[test]
    fn render_matches_display_forms() {
        assert_eq!(render_record(&ProgressRecord::waiting("a")), "a | Waiting...");
        assert_eq!(
            render_record(&processing("a", 1, 3, "npm install")),
            "a | step: 1/3 | command: npm install"
        );
        let failed = ProgressRecord {
            command: "Failed to execute npm test".to_string(),
            status: JobStatus::fail(2, 2),
            output: "boom\n".to_string(),
            ..ProgressRecord::waiting("a")
        };
        assert_eq!(
            render_record(&failed),
            "a | FAIL(2/2): Failed to execute npm test\nboom"
        );
        let summary = RunSummary {
            total: 3,
            succeeded: 2,
            failed: 1,
        };
        assert_eq!(summary.to_string(), "Success: 2/3 | Failure: 1/3");
    }
}
