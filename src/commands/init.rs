use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{self, Config, TrackerKind, WorkerConfig};
use crate::error::ExitError;

const TRACKERS: &[&str] = &["file", "bones", "http"];

/// Infer a project name from the current directory.
fn infer_project_name() -> Option<String> {
    let cwd = std::env::current_dir().ok()?;
    let name = cwd.file_name()?.to_str()?;
    // Lowercase and replace non-alphanumeric with hyphens
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-').to_string();
    if trimmed.is_empty() || validate_name(&trimmed, "project name").is_err() {
        return None;
    }
    Some(trimmed)
}

/// Names become config keys and dispatch arguments: `[a-z0-9-]`, at most 64.
fn validate_name(name: &str, label: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        anyhow::bail!("{label} must be 1-64 characters, got {}", name.len());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        anyhow::bail!("{label} must match [a-z0-9-], got {name:?}");
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("{label} must not start or end with '-', got {name:?}");
    }
    Ok(())
}

/// Parse `name=baseline`.
fn parse_worker(raw: &str) -> Result<(String, f64)> {
    let (name, baseline) = raw
        .split_once('=')
        .with_context(|| format!("expected NAME=BASELINE, got {raw:?}"))?;
    let name = name.trim();
    validate_name(name, "worker type")?;
    let baseline: f64 = baseline
        .trim()
        .parse()
        .with_context(|| format!("baseline for {name} is not a number"))?;
    if !(1.0..=5.0).contains(&baseline) {
        anyhow::bail!("baseline for {name} must be within 1.0-5.0, got {baseline}");
    }
    Ok((name.to_string(), baseline))
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Project name
    #[arg(long)]
    pub name: Option<String>,
    /// Ticket tracker backing the ledger (file, bones, http)
    #[arg(long)]
    pub tracker: Option<String>,
    /// Base URL for the http tracker
    #[arg(long)]
    pub tracker_url: Option<String>,
    /// Worker types as NAME=BASELINE (comma-separated, e.g. junior=2.0,senior=4.0)
    #[arg(long, value_delimiter = ',')]
    pub workers: Vec<String>,
    /// Worker type used when `relay assign` names none
    #[arg(long)]
    pub default_worker: Option<String>,
    /// Non-interactive mode
    #[arg(long)]
    pub no_interactive: bool,
    /// Force overwrite existing config
    #[arg(long)]
    pub force: bool,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

/// Collected user choices for init
struct InitChoices {
    name: String,
    tracker: TrackerKind,
    tracker_url: Option<String>,
    workers: Vec<(String, f64)>,
    default_worker: Option<String>,
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let project_dir = match &self.project_root {
            Some(p) => p.clone(),
            None => std::env::current_dir().context("getting current directory")?,
        };
        fs::create_dir_all(&project_dir)
            .with_context(|| format!("creating {}", project_dir.display()))?;
        let project_dir = project_dir.canonicalize().unwrap_or(project_dir);

        let config_path = project_dir.join(config::CONFIG_TOML);
        if config::find_config(&project_dir).is_some() && !self.force {
            return Err(ExitError::Config(format!(
                "{} already configured; use --force to overwrite",
                project_dir.display()
            ))
            .into());
        }

        let interactive = !self.no_interactive && std::io::stdin().is_terminal();
        let choices = self.gather_choices(interactive)?;
        let config = build_config(&choices);
        config.check()?;

        fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Generated {}", config::CONFIG_TOML);

        let state_dir = config.state_dir(&project_dir);
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating {}", state_dir.display()))?;
        let ignore = state_dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "briefs/\n")?;
        }
        println!("Created {}", config.project.state_dir);

        if choices.tracker == TrackerKind::Bones {
            println!("Ledger entries will be written as bone comments via `bn`.");
        }
        println!("Done.");
        Ok(())
    }

    fn gather_choices(&self, interactive: bool) -> Result<InitChoices> {
        let name = match &self.name {
            Some(n) => n.clone(),
            None if interactive => prompt_input("Project name", infer_project_name().as_deref())?,
            None => infer_project_name().ok_or_else(|| {
                ExitError::Config("cannot infer a project name; pass --name".into())
            })?,
        };
        validate_name(&name, "project name")?;

        let tracker = match &self.tracker {
            Some(t) => t.clone(),
            None if interactive => prompt_select("Ticket tracker", TRACKERS, 0)?,
            None => "file".to_string(),
        };
        let tracker = match tracker.as_str() {
            "file" => TrackerKind::File,
            "bones" => TrackerKind::Bones,
            "http" => TrackerKind::Http,
            other => {
                return Err(ExitError::Config(format!(
                    "unknown tracker {other:?}; expected one of {}",
                    TRACKERS.join(", ")
                ))
                .into());
            }
        };

        let tracker_url = match &self.tracker_url {
            Some(u) => Some(u.clone()),
            None if interactive && tracker == TrackerKind::Http => {
                Some(prompt_input("Tracker base URL", None)?)
            }
            None => None,
        };

        let workers = if !self.workers.is_empty() {
            self.workers
                .iter()
                .map(|w| parse_worker(w))
                .collect::<Result<Vec<_>>>()?
        } else if interactive
            && !prompt_confirm(
                "Use the starter worker types (generalist 3.0, specialist 4.0)?",
                true,
            )?
        {
            let raw = prompt_input("Worker types as NAME=BASELINE, comma-separated", None)?;
            raw.split(',')
                .filter(|s| !s.trim().is_empty())
                .map(parse_worker)
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let default_worker = self
            .default_worker
            .clone()
            .or_else(|| workers.first().map(|(n, _)| n.clone()));

        Ok(InitChoices {
            name,
            tracker,
            tracker_url,
            workers,
            default_worker,
        })
    }
}

fn build_config(choices: &InitChoices) -> Config {
    let mut config = Config::starter(&choices.name);
    config.tracker.kind = choices.tracker;
    config.tracker.url.clone_from(&choices.tracker_url);
    if !choices.workers.is_empty() {
        config.workers = choices
            .workers
            .iter()
            .map(|(name, baseline)| {
                (
                    name.clone(),
                    WorkerConfig {
                        baseline: *baseline,
                        description: None,
                        modifiers: Vec::new(),
                        dispatch: None,
                        active: true,
                    },
                )
            })
            .collect();
        config.project.default_worker.clone_from(&choices.default_worker);
    } else if choices.default_worker.is_some() {
        config.project.default_worker.clone_from(&choices.default_worker);
    }
    config
}

// --- Interactive prompts using dialoguer ---

fn prompt_input(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut builder = dialoguer::Input::<String>::new().with_prompt(prompt);
    if let Some(d) = default {
        builder = builder.default(d.to_string());
    }
    builder.interact_text().context("reading user input")
}

fn prompt_select(prompt: &str, items: &[&str], default: usize) -> Result<String> {
    let index = dialoguer::Select::new()
        .with_prompt(prompt)
        .items(items)
        .default(default)
        .interact()
        .context("reading user selection")?;
    Ok(items[index].to_string())
}

fn prompt_confirm(prompt: &str, default: bool) -> Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("reading user confirmation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_restricted() {
        assert!(validate_name("relay-demo", "project name").is_ok());
        assert!(validate_name("Relay", "project name").is_err());
        assert!(validate_name("-x", "project name").is_err());
        assert!(validate_name("", "project name").is_err());
    }

    #[test]
    fn worker_flag_parses_baseline() {
        assert_eq!(parse_worker("junior=2.5").unwrap(), ("junior".to_string(), 2.5));
        assert!(parse_worker("junior").is_err());
        assert!(parse_worker("junior=9").is_err());
        assert!(parse_worker("Junior=2").is_err());
    }

    #[test]
    fn explicit_workers_replace_starter_set() {
        let config = build_config(&InitChoices {
            name: "demo".into(),
            tracker: TrackerKind::File,
            tracker_url: None,
            workers: vec![("junior".into(), 2.0), ("senior".into(), 4.0)],
            default_worker: None,
        });
        assert_eq!(config.workers.len(), 2);
        assert!(config.project.default_worker.is_none());
        config.check().unwrap();

        let starter = build_config(&InitChoices {
            name: "demo".into(),
            tracker: TrackerKind::Bones,
            tracker_url: None,
            workers: Vec::new(),
            default_worker: None,
        });
        assert!(starter.workers.contains_key("generalist"));
        assert_eq!(starter.project.default_worker.as_deref(), Some("generalist"));
        assert_eq!(starter.tracker.kind, TrackerKind::Bones);
    }
}
