use std::fmt::Write as _;

use clap::Args;

use super::{OutputFormat, ProjectArgs, engine, escalation_exit, print_json, print_markdown};
use crate::coord::planner::{Decision, PlanDecision};

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Task id
    pub task: String,
    /// Evaluate this worker type instead of the default or the best fit
    #[arg(long)]
    pub worker_type: Option<String>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl PlanArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let mut coordinator = project.coordinator()?;
        let plan = engine(coordinator.plan(&self.task, self.worker_type.as_deref()))?;
        let state = engine(coordinator.state(&self.task))?;

        match self.project.format() {
            OutputFormat::Json => print_json(&plan)?,
            OutputFormat::Text => println!("{}", plan_line(&plan)),
            OutputFormat::Pretty => print_markdown(&plan_markdown(&plan)),
        }
        match state.status() {
            Some(status) => escalation_exit(&self.task, status, state.escalation.as_deref()),
            None => Ok(()),
        }
    }
}

/// One-line summary of a plan for text output.
pub fn plan_line(plan: &PlanDecision) -> String {
    let mut line = format!(
        "plan  task={}  worker-type={}  decision={}  complexity={}  capacity={:.2}  gap={:.2}  expected={}",
        plan.task_id,
        plan.worker_type,
        plan.decision.kind(),
        plan.complexity,
        plan.capacity.adjusted,
        plan.gap,
        plan.expected_success
    );
    match &plan.decision {
        Decision::AssignWithMemorySupport { memory_bonus } => {
            let _ = write!(line, "  memory-bonus={memory_bonus:.2}");
        }
        Decision::Decompose { subtasks } => {
            let _ = write!(line, "  subtasks={}", subtasks.len());
        }
        Decision::Escalate { reason } => {
            let _ = write!(line, "  reason={reason:?}");
        }
        Decision::DirectAssign => {}
    }
    line
}

pub fn plan_markdown(plan: &PlanDecision) -> String {
    let mut md = format!(
        "## Plan for `{}`: **{}**\n\n|worker type|complexity|capacity|gap|expected success|\n|-|-|-|-|-|\n|{}|{}|{:.2}|{:.2}|{}|\n",
        plan.task_id,
        plan.decision.kind(),
        plan.worker_type,
        plan.complexity,
        plan.capacity.adjusted,
        plan.gap,
        plan.expected_success
    );
    if !plan.capacity.applied.is_empty() {
        let _ = write!(md, "\nCapacity: baseline {:.2}", plan.capacity.baseline);
        for m in &plan.capacity.applied {
            let _ = write!(md, ", {} {:+.2}", m.name, m.delta);
        }
        md.push('\n');
    }
    match &plan.decision {
        Decision::DirectAssign => {}
        Decision::AssignWithMemorySupport { memory_bonus } => {
            let _ = writeln!(
                md,
                "\nAssign with an external memory snapshot (bonus {memory_bonus:.2})."
            );
        }
        Decision::Decompose { subtasks } => {
            md.push_str("\nSubtasks:\n");
            for sub in subtasks {
                let _ = writeln!(md, "* band {} - {}", sub.score.band, sub.description);
            }
        }
        Decision::Escalate { reason } => {
            let _ = writeln!(md, "\n**Escalated:** {reason}. Needs operator decision.");
        }
    }
    md
}
