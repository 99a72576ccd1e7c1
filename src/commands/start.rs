use clap::Args;

use super::{OutputFormat, ProjectArgs, engine, print_json};

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Task id
    pub task: String,
    /// Attempt id from `relay assign`
    pub attempt: String,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl StartArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let coordinator = project.coordinator()?;
        let state = engine(coordinator.start(&self.task, &self.attempt))?;
        let started_at = state.started_at.map(|t| t.to_rfc3339()).unwrap_or_default();
        match self.project.format() {
            OutputFormat::Json => print_json(&serde_json::json!({
                "task": self.task,
                "attempt": self.attempt,
                "status": state.status(),
                "startedAt": started_at,
            }))?,
            OutputFormat::Text | OutputFormat::Pretty => {
                println!("started  task={}  attempt={}  at={started_at}", self.task, self.attempt);
            }
        }
        Ok(())
    }
}
