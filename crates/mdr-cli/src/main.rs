use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mdr_runner::{
    list_subdirectories, parse_commands, parse_entry_points, render_snapshot, run_all,
    ProgressRegistry, RunConfig, RunOutcome,
};

mod live;

#[derive(Parser)]
#[command(
    name = "mdr",
    version = "0.3.0",
    about = "Run the same commands in every subdirectory of a folder"
)]
struct Cli {
    /// Directory whose immediate subdirectories are processed
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Commands to execute, separated by semicolons
    #[arg(long)]
    commands: Option<String>,
    /// Number of directories processed at once
    #[arg(long, default_value_t = mdr_runner::config::DEFAULT_CONCURRENCY)]
    concurrency: usize,
    /// Subdirectory entry points to run commands in, separated by semicolons
    #[arg(long)]
    subdirs: Option<String>,
    /// Number of retries for failed commands
    #[arg(long, default_value_t = 0)]
    retries: u32,
    /// Main log path (default: <dir>/script.log)
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Backoff unit between retries, in milliseconds
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,
    /// Print a single JSON document instead of the live view
    #[arg(long)]
    json: bool,
    /// Disable the live progress view
    #[arg(long)]
    no_live: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = cli.json;
    match run(cli) {
        Ok(all_ok) => {
            if !all_ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": { "code": "run_failed", "message": format!("{:#}", err) }
                }));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let config = build_config(&cli)?;
    config.validate()?;
    let dirs = list_subdirectories(&config.root_dir)?;
    let registry = Arc::new(ProgressRegistry::with_jobs(&dirs));

    let live_view = !cli.json && !cli.no_live;
    let done = AtomicBool::new(false);
    let outcome = thread::scope(|scope| {
        let display = live_view.then(|| {
            scope.spawn(|| live::run_live_view(&registry, &done, Duration::from_millis(100)))
        });
        let outcome = run_all(&config, &dirs, &registry);
        done.store(true, Ordering::SeqCst);
        if let Some(handle) = display {
            if let Ok(Err(e)) = handle.join() {
                tracing::warn!(error = %e, "live view stopped");
            }
        }
        outcome
    })?;

    if cli.json {
        emit_json(&outcome_to_json(&config, &outcome));
    } else {
        if !live_view {
            print!("{}", render_snapshot(&registry.snapshot_all()));
        }
        print_outcome(&outcome);
    }
    Ok(outcome.summary.failed == 0)
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let stdin = io::stdin();
    build_config_from(cli, &mut stdin.lock(), &mut io::stdout(), &mut io::stderr())
}

/// Prompts go to `stderr` in --json mode so stdout carries only the JSON document.
fn build_config_from(
    cli: &Cli,
    input: &mut impl BufRead,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<RunConfig> {
    let out: &mut dyn Write = if cli.json { &mut *stderr } else { &mut *stdout };
    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => PathBuf::from(prompt(
            "Enter the directory in which to execute: ",
            input,
            out,
        )?),
    };
    let commands = match &cli.commands {
        Some(commands) => commands.clone(),
        None => prompt(
            "Enter the commands to execute, separated by semicolons: ",
            input,
            out,
        )?,
    };
    let dir = if dir.is_relative() && !dir.as_os_str().is_empty() {
        std::env::current_dir()?.join(dir)
    } else {
        dir
    };

    let mut config = RunConfig::new(dir, parse_commands(&commands))
        .with_concurrency(cli.concurrency)
        .with_retries(cli.retries)
        .with_backoff_unit(Duration::from_millis(cli.backoff_ms));
    if let Some(subdirs) = &cli.subdirs {
        config = config.with_entry_points(parse_entry_points(subdirs));
    }
    if let Some(log_file) = &cli.log_file {
        config = config.with_log_file(log_file.clone());
    }
    Ok(config)
}

fn prompt(message: &str, input: &mut impl BufRead, out: &mut dyn Write) -> Result<String> {
    write!(out, "{}", message)?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(anyhow!("no input provided for: {}", message.trim_end()));
    }
    Ok(line.trim().to_string())
}

fn print_outcome(outcome: &RunOutcome) {
    println!("--- Execution completed ---");
    if outcome.summary.total > 0 {
        println!("{}", outcome.summary);
    }
    match &outcome.archive {
        Ok(report) => {
            println!("Log files archived to {}", report.path.display());
            for (path, reason) in &report.delete_failures {
                println!(
                    "WARNING: Failed to delete original log file {}: {}",
                    path.display(),
                    reason
                );
            }
        }
        Err(e) => println!("WARNING: Failed to archive log files: {}", e),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn outcome_to_json(config: &RunConfig, outcome: &RunOutcome) -> Value {
    let jobs: Vec<Value> = outcome
        .reports
        .iter()
        .map(|r| {
            json!({
                "dir": r.job_id,
                "status": r.status.to_string(),
                "working_dir": r.working_dir.as_ref().map(|p| p.display().to_string()),
                "elapsed_secs": r.elapsed.as_secs_f64(),
            })
        })
        .collect();
    let archive = match &outcome.archive {
        Ok(report) => json!({
            "path": report.path.display().to_string(),
            "members": report.members,
            "delete_failures": report.delete_failures.len(),
        }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    json!({
        "ok": outcome.summary.failed == 0,
        "command": "run",
        "root": config.root_dir.display().to_string(),
        "summary": {
            "total": outcome.summary.total,
            "succeeded": outcome.summary.succeeded,
            "failed": outcome.summary.failed,
        },
        "jobs": jobs,
        "archive": archive,
    })
}
