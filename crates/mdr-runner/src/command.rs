use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CommandError;

/// Bounded retry with linear backoff: the wait after failed attempt `n` is
/// `n * unit`, and the final attempt is never followed by a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        Self {
            max_retries,
            backoff_unit,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

/// Captured result of one try. Buffers belong to this attempt only.
#[derive(Debug, Clone)]
pub struct CommandAttempt {
    pub number: u32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl CommandAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct CommandOutcome {
    /// Attempt that succeeded, or `max_retries + 1` on failure.
    pub attempts_used: u32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<CommandError>,
    pub history: Vec<CommandAttempt>,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs `argv` in `working_dir` until it succeeds or the policy is exhausted.
pub fn run_command(argv: &[String], working_dir: &Path, policy: &RetryPolicy) -> CommandOutcome {
    run_command_with_sleep(argv, working_dir, policy, thread::sleep)
}

/// Same as [`run_command`], with the backoff wait supplied by the caller.
pub fn run_command_with_sleep(
    argv: &[String],
    working_dir: &Path,
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration),
) -> CommandOutcome {
    let max_attempts = policy.max_attempts();
    let mut history = Vec::new();
    let mut attempt = 1;
    loop {
        let (stdout, stderr, result) = execute_once(argv, working_dir);
        debug!(
            program = argv.first().map(String::as_str).unwrap_or(""),
            dir = %working_dir.display(),
            attempt,
            max_attempts,
            ok = result.is_ok(),
            "command attempt finished"
        );
        history.push(CommandAttempt {
            number: attempt,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        match result {
            Ok(()) => {
                return CommandOutcome {
                    attempts_used: attempt,
                    stdout,
                    stderr,
                    error: None,
                    history,
                };
            }
            Err(err) if attempt >= max_attempts || matches!(err, CommandError::EmptyArgv) => {
                return CommandOutcome {
                    attempts_used: max_attempts,
                    stdout,
                    stderr,
                    error: Some(err),
                    history,
                };
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    dir = %working_dir.display(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "command failed; retrying"
                );
                sleep(delay);
                attempt += 1;
            }
        }
    }
}

fn execute_once(argv: &[String], working_dir: &Path) -> (String, String, Result<(), CommandError>) {
    let Some((program, args)) = argv.split_first() else {
        return (String::new(), String::new(), Err(CommandError::EmptyArgv));
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(working_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = match cmd.spawn().and_then(|child| child.wait_with_output()) {
        Ok(output) => output,
        Err(e) => return (String::new(), String::new(), Err(CommandError::Launch(e))),
    };
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        (stdout, stderr, Ok(()))
    } else {
        (
            stdout,
            stderr,
            Err(CommandError::Exit {
                code: output.status.code(),
            }),
        )
    }
}
