use std::fmt::Write as _;

use clap::Args;

use super::{
    OutputFormat, ProjectArgs, engine, escalation_exit, parse_pair, print_json, print_markdown,
};
use crate::coord::coordinator::VerdictOutcome;
use crate::coord::validator::{ValidatorFindings, Verdict};
use crate::error::ExitError;

/// Exit code for a rejected completion.
const REJECTED_EXIT: u8 = 10;

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Task id
    pub task: String,
    /// Attempt id that reported success
    pub attempt: String,
    /// Validator identity; must differ from the attempt's worker
    #[arg(long)]
    pub validator: String,
    /// Criterion the validator observed failing, CRITERION=NOTE (repeatable)
    #[arg(long = "fail", value_parser = parse_pair)]
    pub failed: Vec<(String, String)>,
    /// Note recorded with the verdict (repeatable)
    #[arg(long = "note")]
    pub notes: Vec<String>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl ValidateArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let mut coordinator = project.coordinator()?;
        let findings = ValidatorFindings {
            failed: self.failed.iter().cloned().collect(),
            notes: self.notes.clone(),
        };
        let outcome = engine(coordinator.validate(
            &self.task,
            &self.attempt,
            &self.validator,
            &findings,
        ))?;

        match self.project.format() {
            OutputFormat::Json => print_json(&outcome)?,
            OutputFormat::Text => print_text(&self.task, &outcome),
            OutputFormat::Pretty => print_markdown(&markdown(&self.task, &outcome)),
        }

        let state = engine(coordinator.state(&self.task))?;
        escalation_exit(&self.task, outcome.status, state.escalation.as_deref())?;
        if let Verdict::Rejected { unmet_criteria, .. } = &outcome.verdict.verdict {
            return Err(ExitError::new(
                REJECTED_EXIT,
                format!(
                    "completion of {} rejected ({} unmet criteria)",
                    self.task,
                    unmet_criteria.len()
                ),
            )
            .into());
        }
        Ok(())
    }
}

fn print_text(task: &str, outcome: &VerdictOutcome) {
    println!(
        "verdict  task={task}  attempt={}  validator={}  verdict={}  status={}",
        outcome.verdict.attempt_id,
        outcome.verdict.validator,
        outcome.verdict.verdict.as_str(),
        outcome.status
    );
    if let Verdict::Rejected {
        reasons,
        unmet_criteria,
        reproduction,
    } = &outcome.verdict.verdict
    {
        for c in unmet_criteria {
            println!("unmet  {c}");
        }
        for r in reasons {
            println!("reason  {r}");
        }
        for (i, step) in reproduction.iter().enumerate() {
            println!("reproduce  {}. {step}", i + 1);
        }
    }
    if let Some(parent) = &outcome.parent_completed {
        println!("parent-completed  task={parent}");
    }
}

fn markdown(task: &str, outcome: &VerdictOutcome) -> String {
    let mut md = format!(
        "# `{task}` attempt `{}`: **{}**\n\nValidated by {}; task is now **{}**.\n",
        outcome.verdict.attempt_id,
        outcome.verdict.verdict.as_str(),
        outcome.verdict.validator,
        outcome.status
    );
    if let Verdict::Rejected {
        reasons,
        unmet_criteria,
        reproduction,
    } = &outcome.verdict.verdict
    {
        md.push_str("\n## Unmet criteria\n");
        for c in unmet_criteria {
            let _ = writeln!(md, "* {c}");
        }
        md.push_str("\n## Reasons\n");
        for r in reasons {
            let _ = writeln!(md, "* {r}");
        }
        md.push_str("\n## Reproduction\n");
        for (i, step) in reproduction.iter().enumerate() {
            let _ = writeln!(md, "{}. {step}", i + 1);
        }
    }
    if let Some(parent) = &outcome.parent_completed {
        let _ = writeln!(md, "\nParent `{parent}` completed with its last subtask.");
    }
    md
}
