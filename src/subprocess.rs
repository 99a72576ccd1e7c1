use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use crate::error::ExitError;

/// Result of running a subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for running external tools: the `bn` tracker CLI and worker
/// dispatch commands.
pub struct Tool {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
    maw_workspace: Option<String>,
}

impl Tool {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout: None,
            maw_workspace: None,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| (*s).to_string()));
        self
    }

    /// Set an environment variable for the child only.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Wrap this command with `maw exec <workspace> --`.
    ///
    /// The workspace name must match `[a-z0-9][a-z0-9-]*` so it cannot be
    /// mistaken for a maw flag.
    pub fn in_workspace(mut self, workspace: &str) -> anyhow::Result<Self> {
        if workspace.is_empty()
            || !workspace
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            || workspace.starts_with('-')
            || workspace.len() > 64
        {
            anyhow::bail!(
                "invalid workspace name {workspace:?}: must match [a-z0-9][a-z0-9-]*, max 64 chars"
            );
        }
        self.maw_workspace = Some(workspace.to_string());
        Ok(self)
    }

    /// Run the tool, capturing stdout and stderr.
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = self.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output: Output = if let Some(timeout) = self.timeout {
            run_with_timeout(&mut cmd, timeout, &self.program)?
        } else {
            cmd.output().map_err(|e| self.not_found_or_other(e))?
        };

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into())
        }
    }

    /// Start the tool without waiting for it. Stdio is detached; the child
    /// outlives this process. Returns the child's pid.
    pub fn spawn_detached(&self) -> anyhow::Result<u32> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| self.not_found_or_other(e))?;
        Ok(child.id())
    }

    fn command(&self) -> Command {
        let (program, args) = self.build_command();
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn build_command(&self) -> (String, Vec<String>) {
        if let Some(ref ws) = self.maw_workspace {
            let mut args = vec![
                "exec".to_string(),
                ws.clone(),
                "--".to_string(),
                self.program.clone(),
            ];
            args.extend(self.args.clone());
            ("maw".to_string(), args)
        } else {
            (self.program.clone(), self.args.clone())
        }
    }

    fn not_found_or_other(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            let tool = if self.maw_workspace.is_some() {
                "maw"
            } else {
                &self.program
            };
            ExitError::ToolNotFound {
                tool: tool.to_string(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("running {}", self.program))
        }
    }
}

fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    tool_name: &str,
) -> anyhow::Result<Output> {
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::Error::from(ExitError::ToolNotFound {
                tool: tool_name.to_string(),
            })
        } else {
            anyhow::Error::new(e).context(format!("spawning {tool_name}"))
        }
    })?;

    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = drain(child.stdout.take());
                let stderr = drain(child.stderr.take());
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExitError::Timeout {
                        tool: tool_name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("waiting for {tool_name}")));
            }
        }
    }
}

fn drain(pipe: Option<impl std::io::Read>) -> Vec<u8> {
    pipe.map_or_else(Vec::new, |mut r| {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap_or(0);
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_echo() {
        let output = Tool::new("echo").arg("hello").run().unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn run_ok_returns_error_on_failure() {
        let err = Tool::new("false").run_ok().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExitError>(),
            Some(ExitError::ToolFailed { .. })
        ));
    }

    #[test]
    fn run_not_found() {
        let err = Tool::new("nonexistent-tool-xyz").run().unwrap_err();
        let exit_err = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit_err, ExitError::ToolNotFound { .. }));
    }

    #[test]
    fn env_and_cwd_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let output = Tool::new("sh")
            .args(&["-c", "printf '%s:' \"$RELAY_TASK\"; pwd"])
            .env("RELAY_TASK", "tk-1")
            .current_dir(dir.path())
            .timeout(Duration::from_secs(5))
            .run_ok()
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(output.stdout.trim(), format!("tk-1:{}", canonical.display()));
    }

    #[test]
    fn timeout_kills_slow_tool() {
        let err = Tool::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .run()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExitError>(),
            Some(ExitError::Timeout { .. })
        ));
    }

    #[test]
    fn spawn_detached_returns_pid() {
        let pid = Tool::new("true").spawn_detached().unwrap();
        assert!(pid > 0);
        let err = Tool::new("nonexistent-tool-xyz").spawn_detached().unwrap_err();
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn maw_exec_wrapper() {
        let tool = Tool::new("bn").arg("comments").in_workspace("default").unwrap();
        let (program, args) = tool.build_command();
        assert_eq!(program, "maw");
        assert_eq!(args, vec!["exec", "default", "--", "bn", "comments"]);
    }

    #[test]
    fn invalid_workspace_names() {
        assert!(Tool::new("bn").in_workspace("").is_err());
        assert!(Tool::new("bn").in_workspace("--flag").is_err());
        assert!(Tool::new("bn").in_workspace("Has Uppercase").is_err());
        assert!(Tool::new("bn").in_workspace("../up").is_err());
        assert!(Tool::new("bn").in_workspace("northern-cedar").is_ok());
    }
}
