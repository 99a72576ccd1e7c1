use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Subcommand;

use super::{OutputFormat, ProjectArgs, engine, print_json, print_markdown, read_json};
use crate::coord::memory::{ExternalMemorySnapshot, FullContext};

#[derive(Debug, Subcommand)]
pub enum MemoryCommand {
    /// Compress a worker's full context into a tiered snapshot on the task
    Compress {
        /// Task id
        task: String,
        /// Full context as JSON: {producer, window, elements: [{key, content, accesses}]} (`-` for stdin)
        #[arg(long)]
        context: PathBuf,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Show a snapshot, or list a task's snapshots when none is named
    Inspect {
        /// Task id
        task: String,
        /// Snapshot id
        snapshot: Option<String>,
        /// Print one entry's content only
        #[arg(long, requires = "snapshot")]
        key: Option<String>,
        #[command(flatten)]
        project: ProjectArgs,
    },
}

impl MemoryCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::Compress {
                task,
                context,
                project,
            } => compress(task, context, project),
            Self::Inspect {
                task,
                snapshot,
                key,
                project,
            } => inspect(task, snapshot.as_deref(), key.as_deref(), project),
        }
    }
}

fn compress(task: &str, context: &PathBuf, args: &ProjectArgs) -> anyhow::Result<()> {
    let project = args.open()?;
    let coordinator = project.coordinator()?;
    let context: FullContext = read_json(context)?;
    let snapshot = engine(coordinator.compress(task, &context))?;
    match args.format() {
        OutputFormat::Json => print_json(&snapshot)?,
        OutputFormat::Text => println!(
            "compressed  task={task}  snapshot={}  entries={}  complete={}",
            snapshot.id,
            snapshot.entry_count(),
            snapshot.complete
        ),
        OutputFormat::Pretty => print_markdown(&snapshot_markdown(&snapshot)),
    }
    Ok(())
}

fn inspect(
    task: &str,
    snapshot: Option<&str>,
    key: Option<&str>,
    args: &ProjectArgs,
) -> anyhow::Result<()> {
    let project = args.open()?;
    let coordinator = project.coordinator()?;
    let store = coordinator.memory();

    let Some(snapshot_id) = snapshot else {
        let ids = engine(store.list(task))?;
        match args.format() {
            OutputFormat::Json => print_json(&ids)?,
            OutputFormat::Text | OutputFormat::Pretty => {
                for id in ids {
                    println!("{id}");
                }
            }
        }
        return Ok(());
    };

    let snapshot = engine(store.load(task, snapshot_id))?;
    if let Some(key) = key {
        let entry = snapshot
            .tiers
            .values()
            .flatten()
            .find(|e| e.key == key)
            .ok_or_else(|| anyhow::anyhow!("snapshot {snapshot_id} has no entry {key:?}"))?;
        println!("{}", entry.content);
        return Ok(());
    }
    match args.format() {
        OutputFormat::Json => print_json(&snapshot)?,
        OutputFormat::Text => {
            println!(
                "snapshot  id={}  task={}  producer={}  consumer={}  complete={}",
                snapshot.id,
                snapshot.task_id,
                snapshot.producer,
                snapshot.consumer.as_deref().unwrap_or("-"),
                snapshot.complete
            );
            for (tier, entries) in &snapshot.tiers {
                for e in entries {
                    println!(
                        "entry  tier={}  key={}  preload={}  bytes={}",
                        tier.as_str(),
                        e.key,
                        e.preload,
                        e.content.len()
                    );
                }
            }
        }
        OutputFormat::Pretty => print_markdown(&snapshot_markdown(&snapshot)),
    }
    Ok(())
}

fn snapshot_markdown(snapshot: &ExternalMemorySnapshot) -> String {
    let mut md = format!(
        "# Snapshot `{}`\n\nTask `{}`, produced by {}, {}.\n",
        snapshot.id,
        snapshot.task_id,
        snapshot.producer,
        match &snapshot.consumer {
            Some(c) => format!("claimed by {c}"),
            None => "unclaimed".to_string(),
        }
    );
    if !snapshot.complete {
        md.push_str("\n**Incomplete:** critical entries failed verification at compression.\n");
    }
    md.push_str("\n|tier|key|preload|bytes|\n|-|-|-|-|\n");
    for (tier, entries) in &snapshot.tiers {
        for e in entries {
            let _ = writeln!(
                md,
                "|{}|{}|{}|{}|",
                tier.as_str(),
                e.key,
                if e.preload { "yes" } else { "no" },
                e.content.len()
            );
        }
    }
    md
}
