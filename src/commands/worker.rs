use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;

use super::{OutputFormat, Project, ProjectArgs, engine, print_json, print_markdown};
use crate::config;
use crate::coord::capacity::{
    CapacityBreakdown, CapacityModifier, CapacityRegistry, ModifierExpiry, WorkerProfile,
};
use crate::coord::task::validate_id;
use crate::error::ExitError;

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// List worker types with their current adjusted capacity
    List {
        /// Count modifiers scoped to this task
        #[arg(long)]
        task: Option<String>,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Stop planning for a worker type (types are kept, never removed)
    Deactivate {
        /// Worker type
        worker_type: String,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Manage capacity modifiers
    Modifier {
        #[command(subcommand)]
        command: ModifierCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModifierCommand {
    /// Add a capacity modifier to a worker type
    Add(ModifierAddArgs),
}

#[derive(Debug, Args)]
pub struct ModifierAddArgs {
    /// Worker type
    pub worker_type: String,
    /// Modifier name, e.g. unfamiliar-domain or context-load
    pub name: String,
    /// Capacity delta; negative reduces capacity
    #[arg(long, allow_hyphen_values = true)]
    pub delta: f64,
    /// Lapse at this RFC 3339 time
    #[arg(long, conflicts_with_all = ["task", "uses"])]
    pub until: Option<DateTime<Utc>>,
    /// Apply only when planning this task
    #[arg(long, conflicts_with = "uses")]
    pub task: Option<String>,
    /// Apply to the next N plans for this worker type
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub uses: Option<u32>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

#[derive(Debug, Serialize)]
struct WorkerRow<'a> {
    #[serde(flatten)]
    profile: &'a WorkerProfile,
    capacity: CapacityBreakdown,
    default: bool,
}

impl WorkerCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::List { task, project } => list(task.as_deref(), project),
            Self::Deactivate {
                worker_type,
                project,
            } => deactivate(worker_type, project),
            Self::Modifier {
                command: ModifierCommand::Add(args),
            } => args.execute(),
        }
    }
}

fn list(task: Option<&str>, args: &ProjectArgs) -> anyhow::Result<()> {
    let project = args.open()?;
    if let Some(task) = task {
        engine(validate_id(task))?;
    }
    let registry = CapacityRegistry::from_config(&project.config.workers);
    let default = project.config.project.default_worker.as_deref();
    let now = Utc::now();
    let rows = registry
        .profiles()
        .map(|profile| {
            let capacity =
                engine(registry.adjusted_capacity(&profile.worker_type, task.unwrap_or(""), now))?;
            Ok(WorkerRow {
                profile,
                capacity,
                default: default == Some(profile.worker_type.as_str()),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    match args.format() {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Text => {
            for row in &rows {
                println!(
                    "worker  type={}  baseline={:.2}  capacity={:.2}  active={}  modifiers={}{}",
                    row.profile.worker_type,
                    row.capacity.baseline,
                    row.capacity.adjusted,
                    row.profile.active,
                    row.profile.modifiers.len(),
                    if row.default { "  default" } else { "" }
                );
            }
        }
        OutputFormat::Pretty => print_markdown(&rows_markdown(&project, &rows)),
    }
    Ok(())
}

fn rows_markdown(project: &Project, rows: &[WorkerRow<'_>]) -> String {
    let mut md = format!(
        "# Worker types for `{}`\n\n|type|baseline|capacity|active|modifiers|\n|-|-|-|-|-|\n",
        project.config.project.name
    );
    for row in rows {
        let modifiers = row
            .profile
            .modifiers
            .iter()
            .map(|m| format!("{} {:+.2} ({})", m.name, m.delta, expiry_label(&m.expiry)))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            md,
            "|{}{}|{:.2}|{:.2}|{}|{}|",
            row.profile.worker_type,
            if row.default { " (default)" } else { "" },
            row.capacity.baseline,
            row.capacity.adjusted,
            if row.profile.active { "yes" } else { "no" },
            if modifiers.is_empty() { "-" } else { modifiers.as_str() }
        );
    }
    md
}

fn expiry_label(expiry: &ModifierExpiry) -> String {
    match expiry {
        ModifierExpiry::Permanent => "permanent".into(),
        ModifierExpiry::Until { at } => format!("until {}", at.format("%Y-%m-%d %H:%M")),
        ModifierExpiry::Task { task_id } => format!("task {task_id}"),
        ModifierExpiry::Uses { remaining } => format!("{remaining} uses left"),
    }
}

fn deactivate(worker_type: &str, args: &ProjectArgs) -> anyhow::Result<()> {
    let project = args.open()?;
    if project.config.project.default_worker.as_deref() == Some(worker_type) {
        return Err(ExitError::Config(format!(
            "{worker_type} is project.default_worker; choose another default first"
        ))
        .into());
    }
    config::update_workers(&project.config_path, |workers| {
        let mut registry = CapacityRegistry::from_config(workers);
        engine(registry.deactivate(worker_type))?;
        registry.write_into(workers);
        Ok(())
    })?;
    println!("deactivated  worker-type={worker_type}");
    Ok(())
}

impl ModifierAddArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let modifier = self.modifier()?;
        let summary = format!(
            "modifier added  worker-type={}  name={}  delta={:+.2}  expiry={}",
            self.worker_type,
            modifier.name,
            modifier.delta,
            expiry_label(&modifier.expiry)
        );
        config::update_workers(&project.config_path, |workers| {
            let mut registry = CapacityRegistry::from_config(workers);
            engine(registry.add_modifier(&self.worker_type, modifier))?;
            registry.write_into(workers);
            Ok(())
        })?;
        println!("{summary}");
        Ok(())
    }

    fn modifier(&self) -> anyhow::Result<CapacityModifier> {
        if self.name.trim().is_empty() {
            return Err(ExitError::Config("modifier name must not be empty".into()).into());
        }
        if !self.delta.is_finite() {
            return Err(ExitError::Config(format!("delta must be a number, got {}", self.delta)).into());
        }
        let name = self.name.trim();
        if let Some(at) = self.until {
            if at <= Utc::now() {
                return Err(ExitError::Config(format!("--until {at} is already in the past")).into());
            }
            return Ok(CapacityModifier {
                name: name.to_string(),
                delta: self.delta,
                expiry: ModifierExpiry::Until { at },
            });
        }
        if let Some(task_id) = &self.task {
            engine(validate_id(task_id))?;
            return Ok(CapacityModifier::for_task(name, self.delta, task_id));
        }
        if let Some(remaining) = self.uses {
            return Ok(CapacityModifier {
                name: name.to_string(),
                delta: self.delta,
                expiry: ModifierExpiry::Uses { remaining },
            });
        }
        Ok(CapacityModifier::permanent(name, self.delta))
    }
}
