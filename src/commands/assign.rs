use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Args;

use super::plan::{plan_line, plan_markdown};
use super::{
    ESCALATED_EXIT, OutputFormat, ProjectArgs, engine, print_json, print_markdown, read_json,
};
use crate::coord::coordinator::{AssignOutcome, AssignRequest};
use crate::coord::memory::FullContext;
use crate::error::ExitError;

/// Exit code when the handoff was blocked and the task re-planned.
const BLOCKED_EXIT: u8 = 9;

#[derive(Debug, Args)]
pub struct AssignArgs {
    /// Task id
    pub task: String,
    /// Worker identity taking the attempt
    #[arg(long)]
    pub worker: String,
    /// Plan for this worker type instead of the default or the best fit
    #[arg(long)]
    pub worker_type: Option<String>,
    /// The previous holder's full context as JSON, compressed before handoff (`-` for stdin)
    #[arg(long)]
    pub context: Option<PathBuf>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl AssignArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let mut coordinator = project.coordinator()?;
        let context = match &self.context {
            Some(path) => Some(read_json::<FullContext>(path)?),
            None => None,
        };
        let request = AssignRequest {
            worker: self.worker.clone(),
            worker_type: self.worker_type.clone(),
            context,
        };
        let outcome = engine(coordinator.assign(&self.task, request))?;

        match self.project.format() {
            OutputFormat::Json => print_json(&outcome)?,
            OutputFormat::Text => print_text(&outcome),
            OutputFormat::Pretty => print_markdown(&markdown(&outcome)),
        }

        match outcome {
            AssignOutcome::Escalated { reason } => Err(ExitError::new(
                ESCALATED_EXIT,
                format!("task {} escalated: {reason}; needs operator decision", self.task),
            )
            .into()),
            AssignOutcome::Blocked { reason, .. } => Err(ExitError::new(
                BLOCKED_EXIT,
                format!("handoff of {} blocked: {reason}", self.task),
            )
            .into()),
            AssignOutcome::Assigned { .. } | AssignOutcome::Decomposed { .. } => Ok(()),
        }
    }
}

fn print_text(outcome: &AssignOutcome) {
    match outcome {
        AssignOutcome::Assigned {
            handle,
            plan,
            brief,
            pid,
        } => {
            println!(
                "assigned  task={}  attempt={}  worker={}  worker-type={}  tier={}  snapshot={}  brief={}",
                handle.task_id,
                handle.attempt_id,
                handle.worker,
                handle.worker_type,
                handle.tier,
                handle.snapshot.as_deref().unwrap_or("-"),
                brief.display()
            );
            if let Some(pid) = pid {
                println!("dispatched  pid={pid}");
            }
            println!("{}", plan_line(plan));
        }
        AssignOutcome::Decomposed { plan, children } => {
            println!("decomposed  task={}  children={}", plan.task_id, children.join(","));
        }
        AssignOutcome::Blocked {
            reason,
            report,
            plan,
        } => {
            println!("blocked  reason={reason:?}");
            if let Some(report) = report {
                for gap in &report.gaps {
                    println!("gap  key={}  kind={:?}  detail={:?}", gap.key, gap.kind, gap.detail);
                }
            }
            println!("{}", plan_line(plan));
        }
        AssignOutcome::Escalated { reason } => println!("escalated  reason={reason:?}"),
    }
}

fn markdown(outcome: &AssignOutcome) -> String {
    match outcome {
        AssignOutcome::Assigned {
            handle,
            plan,
            brief,
            pid,
        } => {
            let mut md = format!(
                "# Assigned `{}` to {}\n\nAttempt `{}` at tier **{}**. Brief: `{}`\n",
                handle.task_id,
                handle.worker,
                handle.attempt_id,
                handle.tier,
                brief.display()
            );
            if let Some(snapshot) = &handle.snapshot {
                let _ = writeln!(md, "\nExternal memory snapshot `{snapshot}` claimed.");
            }
            if let Some(pid) = pid {
                let _ = writeln!(md, "\nWorker dispatched (pid {pid}).");
            }
            md.push('\n');
            md.push_str(&plan_markdown(plan));
            md
        }
        AssignOutcome::Decomposed { plan, children } => {
            let mut md = plan_markdown(plan);
            md.push_str("\nCreated subtasks:\n");
            for child in children {
                let _ = writeln!(md, "* `{child}`");
            }
            md
        }
        AssignOutcome::Blocked {
            reason,
            report,
            plan,
        } => {
            let mut md = format!("# Handoff blocked\n\n{reason}\n");
            if let Some(report) = report {
                md.push_str("\n|key|gap|detail|\n|-|-|-|\n");
                for gap in &report.gaps {
                    let _ = writeln!(md, "|{}|{:?}|{}|", gap.key, gap.kind, gap.detail);
                }
            }
            md.push_str("\nRe-planned:\n\n");
            md.push_str(&plan_markdown(plan));
            md
        }
        AssignOutcome::Escalated { reason } => {
            format!("# Escalated\n\n{reason}\n\nNeeds operator decision.\n")
        }
    }
}
