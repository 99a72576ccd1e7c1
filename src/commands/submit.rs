use std::path::PathBuf;

use clap::Args;

use super::{OutputFormat, ProjectArgs, engine, print_json, print_markdown, read_json};
use crate::coord::evidence::EvidenceCategory;
use crate::coord::task::{NewTask, StructuralSignals};

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// What the task asks for
    #[arg(required_unless_present = "from")]
    pub description: Option<String>,
    /// Task id (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,
    /// Distinct requirements (R)
    #[arg(short = 'r', long, default_value_t = 0, allow_negative_numbers = true)]
    pub requirements: i64,
    /// Interdependencies between requirements (D)
    #[arg(short = 'd', long, default_value_t = 0, allow_negative_numbers = true)]
    pub interdependencies: i64,
    /// Context switches between domains (C)
    #[arg(short = 'c', long, default_value_t = 0, allow_negative_numbers = true)]
    pub context_switches: i64,
    /// Validation checkpoints (V)
    #[arg(short = 'v', long, default_value_t = 0, allow_negative_numbers = true)]
    pub checkpoints: i64,
    /// Acceptance criterion as CATEGORY:TEXT (repeatable)
    #[arg(long = "criterion", value_parser = parse_criterion)]
    pub criteria: Vec<(EvidenceCategory, String)>,
    /// Read the whole submission from a JSON file (`-` for stdin)
    #[arg(long, conflicts_with = "description")]
    pub from: Option<PathBuf>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

fn parse_criterion(raw: &str) -> Result<(EvidenceCategory, String), String> {
    let (category, text) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected CATEGORY:TEXT, got {raw:?}"))?;
    let text = text.trim();
    if category.trim().is_empty() || text.is_empty() {
        return Err(format!("expected CATEGORY:TEXT, got {raw:?}"));
    }
    Ok((EvidenceCategory::from(category.to_string()), text.to_string()))
}

impl SubmitArgs {
    fn request(&self) -> anyhow::Result<NewTask> {
        if let Some(path) = &self.from {
            return read_json(path);
        }
        let signals = StructuralSignals::new(
            self.requirements,
            self.interdependencies,
            self.context_switches,
            self.checkpoints,
        );
        let mut request = NewTask::new(self.description.clone().unwrap_or_default(), signals);
        request.id.clone_from(&self.id);
        for (category, text) in &self.criteria {
            request = request.criterion(category.clone(), text);
        }
        Ok(request)
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let coordinator = project.coordinator()?;
        let state = engine(coordinator.submit(self.request()?))?;
        let Some(task) = &state.task else {
            anyhow::bail!("task submission was not recorded");
        };

        match self.project.format() {
            OutputFormat::Json => print_json(task)?,
            OutputFormat::Text => {
                println!(
                    "submitted  id={}  band={}  raw={:.2}  criteria={}",
                    task.id,
                    task.score.band,
                    task.score.raw,
                    task.criteria.len()
                );
                if !task.score.clamped.is_empty() {
                    println!("clamped  {}", task.score.clamped.join(","));
                }
            }
            OutputFormat::Pretty => {
                let mut md = format!(
                    "# Submitted `{}`\n\n{}\n\n**Complexity band {}** (raw {:.2})\n",
                    task.id, task.description, task.score.band, task.score.raw
                );
                if !task.score.clamped.is_empty() {
                    md.push_str(&format!(
                        "\n*Clamped malformed signals:* {}\n",
                        task.score.clamped.join(", ")
                    ));
                }
                for c in &task.criteria {
                    md.push_str(&format!("\n* **{}** ({}) {}", c.id, c.category, c.text));
                }
                md.push('\n');
                print_markdown(&md);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criterion_flag_splits_category() {
        let (cat, text) = parse_criterion("ux: reset page is readable").unwrap();
        assert_eq!(cat, EvidenceCategory::UserExperience);
        assert_eq!(text, "reset page is readable");
        assert!(parse_criterion("no separator").is_err());
        assert!(parse_criterion("functional:  ").is_err());
    }
}
