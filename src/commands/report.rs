use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Args;

use super::plan::plan_line;
use super::{
    OutputFormat, ProjectArgs, engine, escalation_exit, parse_pair, print_json, print_markdown,
    read_json,
};
use crate::coord::coordinator::{AttemptReport, ReportOutcome};
use crate::coord::evidence::EvidenceBundle;
use crate::coord::recovery::OverloadSignal;
use crate::coord::task::AttemptOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutcomeArg {
    Success,
    FalseCompletionSuspected,
    OverloadDetected,
    Escalated,
}

impl From<OutcomeArg> for AttemptOutcome {
    fn from(value: OutcomeArg) -> Self {
        match value {
            OutcomeArg::Success => AttemptOutcome::Success,
            OutcomeArg::FalseCompletionSuspected => AttemptOutcome::FalseCompletionSuspected,
            OutcomeArg::OverloadDetected => AttemptOutcome::OverloadDetected,
            OutcomeArg::Escalated => AttemptOutcome::Escalated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SignalArg {
    DecliningSpecificity,
    InconsistentContext,
    FalseCompletion,
    SelfReportedOverload,
}

impl From<SignalArg> for OverloadSignal {
    fn from(value: SignalArg) -> Self {
        match value {
            SignalArg::DecliningSpecificity => OverloadSignal::DecliningSpecificity,
            SignalArg::InconsistentContext => OverloadSignal::InconsistentContext,
            SignalArg::FalseCompletion => OverloadSignal::FalseCompletion,
            SignalArg::SelfReportedOverload => OverloadSignal::SelfReportedOverload,
        }
    }
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Task id
    pub task: String,
    /// Attempt id from `relay assign`
    pub attempt: String,
    #[arg(long, value_enum)]
    pub outcome: OutcomeArg,
    /// Evidence bundle as JSON: category -> [{uri, covers, reproduction}] (`-` for stdin)
    #[arg(long)]
    pub evidence: Option<PathBuf>,
    /// Context fact asserted at report time, KEY=VALUE (repeatable)
    #[arg(long = "fact", value_parser = parse_pair)]
    pub facts: Vec<(String, String)>,
    /// Free-form summary (never read by validators)
    #[arg(long)]
    pub summary: Option<String>,
    /// Overload symptom the worker noticed (repeatable)
    #[arg(long = "signal", value_enum)]
    pub signals: Vec<SignalArg>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl ReportArgs {
    fn report(&self) -> anyhow::Result<AttemptReport> {
        let mut report = AttemptReport::new(&self.attempt, self.outcome.into());
        if let Some(path) = &self.evidence {
            report.evidence = read_json::<EvidenceBundle>(path)?;
        }
        report.facts = self.facts.iter().cloned().collect();
        report.summary.clone_from(&self.summary);
        report.signals = self.signals.iter().map(|s| OverloadSignal::from(*s)).collect();
        Ok(report)
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let mut coordinator = project.coordinator()?;
        let outcome = engine(coordinator.report(&self.task, self.report()?))?;

        match self.project.format() {
            OutputFormat::Json => print_json(&outcome)?,
            OutputFormat::Text => print_text(&self.task, &outcome),
            OutputFormat::Pretty => print_markdown(&markdown(&self.task, &outcome)),
        }
        let state = engine(coordinator.state(&self.task))?;
        escalation_exit(&self.task, outcome.status, state.escalation.as_deref())
    }
}

fn print_text(task: &str, outcome: &ReportOutcome) {
    let signals: Vec<&str> = outcome.attempt.signals.iter().map(|s| s.as_str()).collect();
    println!(
        "reported  task={task}  attempt={}  outcome={}  status={}  phase={}  signals={}",
        outcome.attempt.attempt_id,
        outcome.attempt.outcome,
        outcome.status,
        outcome.phase,
        if signals.is_empty() { "-".to_string() } else { signals.join(",") }
    );
    for t in &outcome.transitions {
        println!("transition  {} -> {}  cycle={}", t.from, t.to, t.cycle);
    }
    if let Some(plan) = &outcome.replan {
        println!("{}", plan_line(plan));
    }
}

fn markdown(task: &str, outcome: &ReportOutcome) -> String {
    let mut md = format!(
        "# Attempt `{}` on `{task}`: {}\n\nTask is now **{}**; recovery phase *{}*.\n",
        outcome.attempt.attempt_id, outcome.attempt.outcome, outcome.status, outcome.phase
    );
    if outcome.attempt.outcome == AttemptOutcome::Success {
        md.push_str("\nAwaiting independent validation (`relay validate`).\n");
    }
    if !outcome.attempt.signals.is_empty() {
        md.push_str("\nOverload signals:\n");
        for s in &outcome.attempt.signals {
            let _ = writeln!(md, "* {s}");
        }
    }
    for t in &outcome.transitions {
        let _ = writeln!(md, "\n*{}* -> *{}* (cycle {})", t.from, t.to, t.cycle);
    }
    if let Some(plan) = &outcome.replan {
        let _ = writeln!(
            md,
            "\nRecovery plan: **{}** on {}",
            plan.decision.kind(),
            plan.worker_type
        );
    }
    md
}
