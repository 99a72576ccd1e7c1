use std::fmt::Write as _;

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, ProjectArgs, engine, print_json, print_markdown};
use crate::coord::coordinator::TaskSummary;
use crate::coord::ledger::{LedgerEntry, TaskState};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Show one task in detail instead of the task list
    pub task: Option<String>,
    /// Include the task's ledger entries
    #[arg(long, requires = "task")]
    pub log: bool,
    #[command(flatten)]
    pub project: ProjectArgs,
}

#[derive(Debug, Serialize)]
struct TaskDetail<'a> {
    #[serde(flatten)]
    state: &'a TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<&'a [LedgerEntry]>,
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let coordinator = project.coordinator()?;
        match &self.task {
            Some(task) => {
                let state = engine(coordinator.state(task))?;
                let log = if self.log {
                    Some(engine(coordinator.ledger().entries(task))?)
                } else {
                    None
                };
                match self.project.format() {
                    OutputFormat::Json => print_json(&TaskDetail {
                        state: &state,
                        log: log.as_deref(),
                    })?,
                    OutputFormat::Text => print_detail_text(&state, log.as_deref()),
                    OutputFormat::Pretty => print_markdown(&detail_markdown(&state, log.as_deref())),
                }
            }
            None => {
                let tasks = engine(coordinator.list())?;
                match self.project.format() {
                    OutputFormat::Json => print_json(&tasks)?,
                    OutputFormat::Text => print_list_text(&tasks),
                    OutputFormat::Pretty => print_markdown(&list_markdown(
                        &project.config.project.name,
                        coordinator.ledger().tracker_name(),
                        &tasks,
                    )),
                }
            }
        }
        Ok(())
    }
}

fn print_list_text(tasks: &[TaskSummary]) {
    println!("relay-status  tasks={}", tasks.len());
    for t in tasks {
        println!(
            "task  id={}  status={}  band={}  attempts={}  failures={}  phase={}  open={}",
            t.id,
            t.status,
            t.band,
            t.attempts,
            t.failures,
            t.phase,
            t.open_attempt.as_deref().unwrap_or("-")
        );
    }
}

fn list_markdown(project: &str, tracker: &str, tasks: &[TaskSummary]) -> String {
    let mut md = format!("# {project}\n\nLedger: *{tracker}* tracker, {} tasks\n", tasks.len());
    if tasks.is_empty() {
        md.push_str("\nNo tasks yet. Submit one with `relay submit`.\n");
        return md;
    }
    md.push_str("\n|task|status|band|attempts|phase|worker|description|\n|-|-|-|-|-|-|-|\n");
    for t in tasks {
        let _ = writeln!(
            md,
            "|{}|{}|{}|{}|{}|{}|{}|",
            t.id,
            t.status,
            t.band,
            t.attempts,
            t.phase,
            t.worker.as_deref().unwrap_or("-"),
            t.description.replace('|', "/")
        );
    }
    let escalated: Vec<&TaskSummary> = tasks.iter().filter(|t| t.escalation.is_some()).collect();
    if !escalated.is_empty() {
        md.push_str("\n## Needs operator decision\n");
        for t in escalated {
            let _ = writeln!(md, "* `{}`: {}", t.id, t.escalation.as_deref().unwrap_or_default());
        }
    }
    md
}

fn print_detail_text(state: &TaskState, log: Option<&[LedgerEntry]>) {
    let Some(task) = &state.task else {
        return;
    };
    println!(
        "task  id={}  status={}  band={}  raw={:.2}  failures={}  loop-bumps={}  phase={}  cycles={}",
        task.id,
        task.status,
        task.score.band,
        task.score.raw,
        state.failures,
        state.loop_bumps,
        state.recovery.phase,
        state.recovery.cycles
    );
    if let Some(plan) = &state.plan {
        println!("{}", super::plan::plan_line(plan));
    }
    if let Some(open) = &state.open_attempt {
        println!(
            "open-attempt  id={}  worker={}  key={}",
            open.attempt_id,
            open.worker,
            open.key()
        );
    }
    if let Some(waiting) = &state.awaiting_validation {
        println!("awaiting-validation  attempt={waiting}");
    }
    for a in &task.attempts {
        println!(
            "attempt  id={}  worker={}  key={}  outcome={}",
            a.attempt_id,
            a.worker,
            a.key(),
            a.outcome
        );
    }
    if let Some(reason) = &state.escalation {
        println!("escalation  reason={reason:?}");
    }
    for entry in log.unwrap_or_default() {
        println!(
            "entry  seq={}  type={}  at={}",
            entry.seq,
            entry.event_type,
            entry.timestamp.to_rfc3339()
        );
    }
}

fn detail_markdown(state: &TaskState, log: Option<&[LedgerEntry]>) -> String {
    let Some(task) = &state.task else {
        return String::new();
    };
    let mut md = format!(
        "# `{}`: {}\n\n{}\n\n**{}**, band {} (raw {:.2}), recovery *{}* after {} cycles, {} failures\n",
        task.id,
        task.status,
        task.description,
        task.status,
        task.score.band,
        task.score.raw,
        state.recovery.phase,
        state.recovery.cycles,
        state.failures
    );
    if let Some(parent) = &task.parent {
        let _ = writeln!(md, "\nSubtask of `{parent}`.");
    }
    if !task.children.is_empty() {
        let _ = writeln!(md, "\nSubtasks: {}", task.children.join(", "));
    }
    if !task.criteria.is_empty() {
        md.push_str("\n## Acceptance criteria\n");
        for c in &task.criteria {
            let _ = writeln!(md, "* **{}** ({}) {}", c.id, c.category, c.text);
        }
    }
    if let Some(plan) = &state.plan {
        md.push('\n');
        md.push_str(&super::plan::plan_markdown(plan));
    }
    if let Some(open) = &state.open_attempt {
        let _ = writeln!(
            md,
            "\nOpen attempt `{}` held by {} ({}).",
            open.attempt_id,
            open.worker,
            open.key()
        );
    }
    if let Some(waiting) = &state.awaiting_validation {
        let _ = writeln!(md, "\nAttempt `{waiting}` is awaiting validation.");
    }
    if !task.attempts.is_empty() {
        md.push_str("\n## Attempts\n\n|attempt|worker|tier|outcome|signals|\n|-|-|-|-|-|\n");
        for a in &task.attempts {
            let signals: Vec<&str> = a.signals.iter().map(|s| s.as_str()).collect();
            let _ = writeln!(
                md,
                "|{}|{}|{}|{}|{}|",
                a.attempt_id,
                a.worker,
                a.key(),
                a.outcome,
                signals.join(", ")
            );
        }
    }
    if let Some(reason) = &state.escalation {
        let _ = writeln!(md, "\n**Escalated:** {reason}. Needs operator decision.");
    }
    if let Some(log) = log {
        md.push_str("\n## Ledger\n\n|seq|event|at|\n|-|-|-|\n");
        for entry in log {
            let _ = writeln!(
                md,
                "|{}|{}|{}|",
                entry.seq,
                entry.event_type,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::recovery::RecoveryPhase;
    use crate::coord::task::TaskStatus;

    fn summary(id: &str, escalation: Option<&str>) -> TaskSummary {
        TaskSummary {
            id: id.into(),
            description: "a | b".into(),
            status: if escalation.is_some() {
                TaskStatus::Escalated
            } else {
                TaskStatus::Pending
            },
            band: 2,
            attempts: 0,
            failures: 0,
            phase: RecoveryPhase::Monitoring,
            open_attempt: None,
            worker: None,
            awaiting_validation: None,
            escalation: escalation.map(str::to_string),
            parent: None,
            children: 0,
            last_activity: None,
        }
    }

    #[test]
    fn list_markdown_surfaces_escalations() {
        let md = list_markdown("demo", "file", &[summary("tk-1", None), summary("tk-2", Some("gap 3.00"))]);
        assert!(md.contains("|tk-1|pending|2|"));
        assert!(md.contains("a / b"));
        assert!(md.contains("## Needs operator decision"));
        assert!(md.contains("`tk-2`: gap 3.00"));
    }

    #[test]
    fn empty_list_suggests_submit() {
        assert!(list_markdown("demo", "file", &[]).contains("relay submit"));
    }
}
