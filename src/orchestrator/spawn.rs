//! Sub-agent spawning.
//!
//! Launching a child agent process is a trait seam so the orchestration
//! loop can be driven in tests without forking. The process-backed
//! implementation runs the agent binary with the objective, enforces the
//! wall-clock timeout, and kills on expiry.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Terminal status of a waited-on sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentStatus {
    Done,
    Error,
    Killed,
    Interrupted,
}

impl std::fmt::Display for SubAgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
            Self::Killed => write!(f, "killed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Result of a waited spawn: status, final output, and the tail of the
/// child's history.
#[derive(Debug, Clone)]
pub struct SubAgentOutcome {
    pub status: SubAgentStatus,
    pub result: String,
    /// Last few output lines, newest last.
    pub history: Vec<String>,
}

/// Parameters for one spawn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub objective: String,
    pub repo_root: Option<PathBuf>,
    pub max_iterations: u32,
    pub timeout_s: u64,
}

impl SpawnSpec {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            repo_root: None,
            max_iterations: 10,
            timeout_s: 600,
        }
    }

    pub fn with_repo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repo_root = Some(root.into());
        self
    }

    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_s = seconds;
        self
    }
}

/// Handle for a detached (non-waited) spawn.
#[derive(Debug, Clone)]
pub struct SpawnHandle {
    pub pid: u32,
}

/// Launcher seam.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Spawn a child agent and block until it exits or times out.
    async fn launch_and_wait(&self, spec: &SpawnSpec) -> Result<SubAgentOutcome>;

    /// Spawn without waiting; returns a handle immediately.
    async fn launch_detached(&self, spec: &SpawnSpec) -> Result<SpawnHandle>;
}

/// Process-backed launcher running the agent binary as a daemon worker.
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    /// Use an explicit agent binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Resolve the agent binary by name on PATH, falling back to the
    /// current executable.
    pub fn resolve(binary_name: &str) -> Result<Self> {
        let binary = which::which(binary_name)
            .or_else(|_| std::env::current_exe())
            .map_err(|e| Error::Config(format!("cannot resolve agent binary: {}", e)))?;
        Ok(Self { binary })
    }

    fn command(&self, spec: &SpawnSpec) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("daemon")
            .arg("--objective")
            .arg(&spec.objective)
            .arg("--max-iterations")
            .arg(spec.max_iterations.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = &spec.repo_root {
            cmd.current_dir(root);
        }
        cmd
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch_and_wait(&self, spec: &SpawnSpec) -> Result<SubAgentOutcome> {
        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| Error::Orchestration(format!("spawn failed: {}", e)))?;

        let mut stdout = child.stdout.take();
        let waited = tokio::time::timeout(Duration::from_secs(spec.timeout_s), async {
            let mut output = String::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_string(&mut output).await;
            }
            let status = child.wait().await;
            (status, output)
        })
        .await;

        match waited {
            Ok((Ok(status), output)) => {
                let lines: Vec<String> = output.lines().map(String::from).collect();
                let history: Vec<String> =
                    lines.iter().rev().take(3).rev().cloned().collect();
                let result = lines.last().cloned().unwrap_or_default();
                let sub_status = if status.success() {
                    SubAgentStatus::Done
                } else if status.code().is_none() {
                    SubAgentStatus::Interrupted
                } else {
                    SubAgentStatus::Error
                };
                info!(status = %sub_status, "sub-agent finished");
                Ok(SubAgentOutcome {
                    status: sub_status,
                    result,
                    history,
                })
            }
            Ok((Err(e), _)) => Err(Error::Orchestration(format!("wait failed: {}", e))),
            Err(_) => {
                warn!(timeout_s = spec.timeout_s, "sub-agent timed out; killing");
                // Best-effort kill; kill_on_drop covers the rest
                Ok(SubAgentOutcome {
                    status: SubAgentStatus::Killed,
                    result: format!("killed after {}s timeout", spec.timeout_s),
                    history: Vec::new(),
                })
            }
        }
    }

    async fn launch_detached(&self, spec: &SpawnSpec) -> Result<SpawnHandle> {
        let mut cmd = self.command(spec);
        // Detached children outlive this handle
        let child = cmd
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::Orchestration(format!("spawn failed: {}", e)))?;
        Ok(SpawnHandle {
            pid: child.id().unwrap_or(0),
        })
    }
}

/// Scripted launcher replaying canned outcomes, for driving the
/// orchestration loop in tests.
pub struct ScriptedLauncher {
    outcomes: std::sync::Mutex<std::collections::VecDeque<Result<SubAgentOutcome>>>,
    pub specs_seen: std::sync::Mutex<Vec<SpawnSpec>>,
}

impl ScriptedLauncher {
    pub fn new(outcomes: Vec<Result<SubAgentOutcome>>) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(outcomes.into()),
            specs_seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn done(result: &str) -> Result<SubAgentOutcome> {
        Ok(SubAgentOutcome {
            status: SubAgentStatus::Done,
            result: result.to_string(),
            history: vec![result.to_string()],
        })
    }

    pub fn failed(result: &str) -> Result<SubAgentOutcome> {
        Ok(SubAgentOutcome {
            status: SubAgentStatus::Error,
            result: result.to_string(),
            history: vec![result.to_string()],
        })
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch_and_wait(&self, spec: &SpawnSpec) -> Result<SubAgentOutcome> {
        self.specs_seen
            .lock()
            .expect("spec lock")
            .push(spec.clone());
        self.outcomes
            .lock()
            .expect("outcome lock")
            .pop_front()
            .unwrap_or_else(|| Err(Error::Orchestration("launcher script exhausted".to_string())))
    }

    async fn launch_detached(&self, spec: &SpawnSpec) -> Result<SpawnHandle> {
        self.specs_seen
            .lock()
            .expect("spec lock")
            .push(spec.clone());
        Ok(SpawnHandle { pid: 4242 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_launcher_replays() {
        let launcher = ScriptedLauncher::new(vec![
            ScriptedLauncher::done("implemented"),
            ScriptedLauncher::failed("tests failing"),
        ]);

        let spec = SpawnSpec::new("objective");
        let first = launcher.launch_and_wait(&spec).await.unwrap();
        assert_eq!(first.status, SubAgentStatus::Done);

        let second = launcher.launch_and_wait(&spec).await.unwrap();
        assert_eq!(second.status, SubAgentStatus::Error);

        // Exhausted script turns into a launch failure
        assert!(launcher.launch_and_wait(&spec).await.is_err());
        assert_eq!(launcher.specs_seen.lock().unwrap().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_timeout_kills() {
        use std::os::unix::fs::PermissionsExt;

        // A shim that ignores its arguments and hangs, standing in for a
        // stuck agent binary.
        let dir = tempfile::tempdir().unwrap();
        let shim = dir.path().join("hung-agent.sh");
        std::fs::write(&shim, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = ProcessLauncher::new(&shim);
        let spec = SpawnSpec::new("objective").with_timeout(1);

        let outcome = launcher.launch_and_wait(&spec).await.unwrap();
        assert_eq!(outcome.status, SubAgentStatus::Killed);
        assert!(outcome.result.contains("timeout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_collects_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shim = dir.path().join("ok-agent.sh");
        std::fs::write(&shim, "#!/bin/sh\necho step one\necho step two\necho done: all green\n")
            .unwrap();
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = ProcessLauncher::new(&shim);
        let outcome = launcher
            .launch_and_wait(&SpawnSpec::new("objective").with_timeout(10))
            .await
            .unwrap();

        assert_eq!(outcome.status, SubAgentStatus::Done);
        assert_eq!(outcome.result, "done: all green");
        assert_eq!(outcome.history.len(), 3);
    }

    #[test]
    fn test_spawn_spec_builder() {
        let spec = SpawnSpec::new("do the thing")
            .with_repo_root("/tmp/repo")
            .with_max_iterations(5)
            .with_timeout(120);
        assert_eq!(spec.max_iterations, 5);
        assert_eq!(spec.timeout_s, 120);
        assert_eq!(spec.repo_root.as_deref(), Some(std::path::Path::new("/tmp/repo")));
    }
}
