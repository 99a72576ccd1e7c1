//! Handoff brief rendering.

use minijinja::Environment;
use serde::Serialize;

use crate::coord::memory::ExternalMemorySnapshot;
use crate::coord::planner::PlanDecision;
use crate::coord::task::{AttemptRecord, Task, WorkerHandle};

const HANDOFF_TEMPLATE: &str = include_str!("templates/handoff.md.jinja");

#[derive(Debug, Serialize)]
struct PreloadEntry<'a> {
    key: &'a str,
    content: &'a str,
}

/// Context data passed to the handoff template
#[derive(Debug, Serialize)]
pub struct BriefContext<'a> {
    task: &'a Task,
    handle: &'a WorkerHandle,
    plan: Option<&'a PlanDecision>,
    preload: Vec<PreloadEntry<'a>>,
    /// Keys of non-preloaded snapshot entries.
    addressable: Vec<&'a str>,
    previous: &'a [AttemptRecord],
}

impl<'a> BriefContext<'a> {
    pub fn new(
        task: &'a Task,
        handle: &'a WorkerHandle,
        plan: Option<&'a PlanDecision>,
        snapshot: Option<&'a ExternalMemorySnapshot>,
    ) -> Self {
        let mut preload = Vec::new();
        let mut addressable = Vec::new();
        if let Some(snapshot) = snapshot {
            for entry in snapshot.tiers.values().flatten() {
                if entry.preload {
                    preload.push(PreloadEntry {
                        key: &entry.key,
                        content: &entry.content,
                    });
                } else {
                    addressable.push(entry.key.as_str());
                }
            }
        }
        Self {
            task,
            handle,
            plan,
            preload,
            addressable,
            previous: &task.attempts,
        }
    }
}

/// Render the markdown brief handed to a worker with its assignment.
pub fn render_brief(ctx: &BriefContext<'_>) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_template("handoff", HANDOFF_TEMPLATE)?;
    let template = env.get_template("handoff")?;
    Ok(template.render(ctx)?)
}
