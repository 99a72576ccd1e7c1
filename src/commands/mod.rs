pub mod assign;
pub mod cancel;
pub mod init;
pub mod memory;
pub mod plan;
pub mod report;
pub mod schema;
pub mod start;
pub mod status;
pub mod submit;
pub mod validate;
pub mod watch;
pub mod worker;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use crate::config::{self, Config};
use crate::coord::{CoordError, Coordinator, TaskStatus};
use crate::error::ExitError;

/// Exit code when an operation leaves a task escalated.
pub const ESCALATED_EXIT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

/// Flags shared by every command that works inside a project.
#[derive(Debug, Clone, Args)]
pub struct ProjectArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl ProjectArgs {
    /// Explicit format, otherwise pretty on a terminal and text when piped.
    pub fn format(&self) -> OutputFormat {
        self.format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        })
    }

    pub fn open(&self) -> anyhow::Result<Project> {
        let start = match &self.project_root {
            Some(p) => p.clone(),
            None => std::env::current_dir().context("getting current directory")?,
        };
        Project::open(&start)
    }
}

/// A loaded project: where it lives and how it is configured.
#[derive(Debug)]
pub struct Project {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub config: Config,
}

impl Project {
    pub fn open(start: &Path) -> anyhow::Result<Self> {
        let (config_path, root) = config::find_config_in_project(start)?;
        let config = Config::load(&config_path)?;
        tracing::debug!(config = %config_path.display(), "project config loaded");
        Ok(Self {
            root,
            config_path,
            config,
        })
    }

    pub fn coordinator(&self) -> anyhow::Result<Coordinator> {
        let coordinator = engine(Coordinator::new(&self.config, &self.root))?;
        Ok(coordinator.with_config_file(&self.config_path))
    }
}

/// Carry an engine error out with its exit code.
pub fn engine<T>(result: Result<T, CoordError>) -> anyhow::Result<T> {
    result.map_err(|e| ExitError::from(e).into())
}

/// Fail with the escalation exit code when `status` is escalated.
pub fn escalation_exit(task: &str, status: TaskStatus, reason: Option<&str>) -> anyhow::Result<()> {
    if status == TaskStatus::Escalated {
        return Err(ExitError::new(
            ESCALATED_EXIT,
            format!(
                "task {task} escalated: {}; needs operator decision",
                reason.unwrap_or("no reason recorded")
            ),
        )
        .into());
    }
    Ok(())
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print markdown to the terminal.
pub fn print_markdown(markdown: &str) {
    termimad::MadSkin::default().print_text(markdown);
}

/// Read a JSON file, or stdin when `path` is `-`.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("reading stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// Parse `key=value`.
pub fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}
