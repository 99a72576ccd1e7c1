use clap::Args;

use super::{OutputFormat, ProjectArgs, engine, print_json};

#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Task id
    pub task: String,
    /// Why the task is being cancelled
    #[arg(long, default_value = "cancelled by operator")]
    pub reason: String,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl CancelArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.open()?;
        let coordinator = project.coordinator()?;
        let state = engine(coordinator.cancel(&self.task, &self.reason))?;
        let children = state
            .task
            .as_ref()
            .map(|t| t.children.clone())
            .unwrap_or_default();
        match self.project.format() {
            OutputFormat::Json => print_json(&serde_json::json!({
                "task": self.task,
                "status": state.status(),
                "reason": self.reason,
                "children": children,
            }))?,
            OutputFormat::Text | OutputFormat::Pretty => {
                println!("cancelled  task={}  reason={:?}", self.task, self.reason);
                if !children.is_empty() {
                    println!("subtasks  ids={}", children.join(","));
                }
            }
        }
        Ok(())
    }
}
