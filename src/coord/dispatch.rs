//! Spawning configured worker commands for new attempts.

use std::path::Path;

use tracing::info;

use super::error::{CoordError, Result};
use super::task::WorkerHandle;
use crate::subprocess::Tool;

/// Values substituted into a `dispatch` argv template and exported to the
/// worker's environment.
#[derive(Debug, Clone)]
pub struct DispatchVars<'a> {
    pub handle: &'a WorkerHandle,
    pub brief: &'a Path,
}

impl DispatchVars<'_> {
    fn pairs(&self) -> [(&'static str, &'static str, String); 5] {
        [
            ("{task}", "RELAY_TASK", self.handle.task_id.clone()),
            ("{attempt}", "RELAY_ATTEMPT", self.handle.attempt_id.clone()),
            ("{worker}", "RELAY_WORKER", self.handle.worker.clone()),
            (
                "{snapshot}",
                "RELAY_SNAPSHOT",
                self.handle.snapshot.clone().unwrap_or_default(),
            ),
            ("{brief}", "RELAY_BRIEF", self.brief.display().to_string()),
        ]
    }
}

/// Expand placeholders in each argument of a dispatch template.
pub fn expand(template: &[String], vars: &DispatchVars<'_>) -> Result<Vec<String>> {
    if template.is_empty() {
        return Err(CoordError::InvalidInput("dispatch command is empty".into()));
    }
    let pairs = vars.pairs();
    Ok(template
        .iter()
        .map(|arg| {
            pairs
                .iter()
                .fold(arg.clone(), |acc, (placeholder, _, value)| acc.replace(placeholder, value))
        })
        .collect())
}

/// Spawn the worker detached, in `cwd`, and return its pid.
pub fn spawn(template: &[String], vars: &DispatchVars<'_>, cwd: &Path) -> Result<u32> {
    let argv = expand(template, vars)?;
    let rest: Vec<&str> = argv[1..].iter().map(String::as_str).collect();
    let mut tool = Tool::new(&argv[0]).args(&rest).current_dir(cwd);
    for (_, key, value) in vars.pairs() {
        tool = tool.env(key, &value);
    }
    let pid = tool
        .spawn_detached()
        .map_err(|e| CoordError::InvalidInput(format!("dispatch {} failed: {e:#}", argv[0])))?;
    info!(
        task = %vars.handle.task_id,
        attempt = %vars.handle.attempt_id,
        program = %argv[0],
        pid,
        "worker dispatched"
    );
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::coord::task::CapacityTier;

    fn handle() -> WorkerHandle {
        WorkerHandle {
            task_id: "tk-1".into(),
            attempt_id: "at-9".into(),
            worker: "alice".into(),
            worker_type: "junior".into(),
            tier: CapacityTier::MemorySupported,
            snapshot: Some("ms-2".into()),
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn placeholders_expand_inside_arguments() {
        let h = handle();
        let brief = Path::new("/tmp/brief.md");
        let vars = DispatchVars { handle: &h, brief };
        let argv = expand(
            &[
                "agent".into(),
                "--task={task}".into(),
                "{attempt}".into(),
                "--brief".into(),
                "{brief}".into(),
                "{worker}@{snapshot}".into(),
            ],
            &vars,
        )
        .unwrap();
        assert_eq!(
            argv,
            vec!["agent", "--task=tk-1", "at-9", "--brief", "/tmp/brief.md", "alice@ms-2"]
        );
    }

    #[test]
    fn empty_template_is_rejected() {
        let h = handle();
        let vars = DispatchVars {
            handle: &h,
            brief: Path::new("b.md"),
        };
        assert!(expand(&[], &vars).is_err());
    }

    #[test]
    fn spawned_worker_sees_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let h = handle();
        let vars = DispatchVars {
            handle: &h,
            brief: Path::new("b.md"),
        };
        let script = format!(
            "printf '%s %s %s' \"$RELAY_TASK\" \"$RELAY_ATTEMPT\" \"$RELAY_SNAPSHOT\" > {}",
            out.display()
        );
        spawn(&["sh".into(), "-c".into(), script], &vars, dir.path()).unwrap();
        let mut written = String::new();
        for _ in 0..100 {
            written = std::fs::read_to_string(&out).unwrap_or_default();
            if !written.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(written, "tk-1 at-9 ms-2");
    }
}
