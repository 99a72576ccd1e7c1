use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Args;
use tracing::{info, warn};

use super::{OutputFormat, ProjectArgs, engine, print_json};
use crate::coord::coordinator::TimedOut;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Seconds between timeout sweeps (defaults to recovery.watch_interval_secs)
    #[arg(long)]
    pub interval: Option<u64>,
    /// Sweep once and exit
    #[arg(long)]
    pub once: bool,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl WatchArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let mut coordinator = project.coordinator()?;
        let format = self.project.format();

        if self.once {
            let closed = engine(coordinator.sweep_timeouts(Utc::now()))?;
            return emit(format, &closed);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            warn!(error = %e, "could not install Ctrl-C handler");
        }

        let interval = Duration::from_secs(
            self.interval
                .unwrap_or(project.config.recovery.watch_interval_secs)
                .max(1),
        );
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = project.config.recovery.attempt_timeout_secs,
            "watching for stale attempts"
        );
        eprintln!("Watching for stale attempts every {}s (Ctrl-C to stop)", interval.as_secs());

        let mut sweeps = 0u64;
        while !stop.load(Ordering::SeqCst) {
            match coordinator.sweep_timeouts(Utc::now()) {
                Ok(closed) => emit(format, &closed)?,
                Err(e) => warn!(error = %e, "timeout sweep failed"),
            }
            sweeps += 1;
            let deadline = Instant::now() + interval;
            while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
        info!(sweeps, "watch stopped");
        Ok(())
    }
}

fn emit(format: OutputFormat, closed: &[TimedOut]) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            for t in closed {
                println!("{}", serde_json::to_string(t)?);
            }
        }
        OutputFormat::Text | OutputFormat::Pretty => {
            for t in closed {
                println!(
                    "timed-out  task={}  attempt={}  status={}  phase={}",
                    t.task_id, t.report.attempt.attempt_id, t.report.status, t.report.phase
                );
            }
        }
    }
    Ok(())
}

