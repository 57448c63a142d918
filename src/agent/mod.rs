//! Agent invocation: run the external coding agent as a subprocess.
//!
//! Every spawned agent runs in its own process group and is recorded in a
//! shared [`ProcessRegistry`], so shutdown can signal the whole subtree.

pub mod verdict;

pub use verdict::{Verdict, parse_verdict};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::issue::Issue;

/// Which step of the per-issue workflow an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentPhase {
    Ready,
    Implement,
}

impl AgentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Ready => "ready",
            AgentPhase::Implement => "implement",
        }
    }
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub issue_id: String,
    pub phase: AgentPhase,
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl AgentOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Short failure detail: stderr if present, else the tail of stdout.
    pub fn failure_detail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.trim().lines().collect();
        let start = lines.len().saturating_sub(10);
        lines[start..].join("\n")
    }
}

/// Runs one agent command.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput>;
}

/// Agent command templates. Placeholders: `{issue_id}`, `{issue_path}`, `{title}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommands {
    pub ready: String,
    pub implement: String,
}

impl AgentCommands {
    pub fn render(&self, phase: AgentPhase, issue: &Issue) -> String {
        let template = match phase {
            AgentPhase::Ready => &self.ready,
            AgentPhase::Implement => &self.implement,
        };
        template
            .replace("{issue_id}", &issue.id)
            .replace("{issue_path}", &issue.path.to_string_lossy())
            .replace("{title}", &issue.title)
    }
}

/// Live agent process groups, keyed by leader pid.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    running: Mutex<HashMap<u32, String>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, label: impl Into<String>) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, label.into());
    }

    pub fn unregister(&self, pid: u32) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SIGTERM every group, wait up to `grace` for them to exit, then SIGKILL
    /// whatever is still registered. Returns how many groups were signalled.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        let pids = self.pids();
        if pids.is_empty() {
            return 0;
        }
        info!(count = pids.len(), "terminating agent processes");
        for pid in &pids {
            signal_group(*pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if pids.iter().all(|pid| !self.contains(*pid)) {
                return pids.len();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for pid in pids.iter().filter(|pid| self.contains(**pid)) {
            warn!(pid, "agent did not exit after SIGTERM; sending SIGKILL");
            signal_group(*pid, Signal::SIGKILL);
        }
        pids.len()
    }

    /// SIGKILL everything immediately, without waiting.
    pub fn kill_all_now(&self) {
        for pid in self.pids() {
            signal_group(pid, Signal::SIGKILL);
        }
    }

    fn contains(&self, pid: u32) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&pid)
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, error = %e, "failed to signal agent process group"),
    }
}

/// Runs agent commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellAgent {
    registry: Arc<ProcessRegistry>,
    shell: String,
}

impl ShellAgent {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            registry,
            shell: "sh".to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }
}

#[async_trait]
impl AgentInvoker for ShellAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        debug!(issue = %request.issue_id, phase = %request.phase, command = %request.command, "invoking agent");
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent in {}", request.cwd.display()))?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry
                .register(pid, format!("{}:{}", request.issue_id, request.phase));
        }

        let waited = tokio::time::timeout(request.timeout, child.wait_with_output()).await;
        if let Some(pid) = pid {
            self.registry.unregister(pid);
        }

        match waited {
            Ok(output) => {
                let output = output.context("Failed to wait for agent process")?;
                Ok(AgentOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            }
            Err(_) => {
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                warn!(issue = %request.issue_id, phase = %request.phase, "agent timed out");
                Ok(AgentOutput {
                    exit_code: -1,
                    timed_out: true,
                    ..Default::default()
                })
            }
        }
    }
}

/// Check that the agent's working directory exists before invoking it.
pub fn ensure_cwd(path: &Path) -> Result<()> {
    anyhow::ensure!(path.is_dir(), "Agent working directory {} does not exist", path.display());
    Ok(())
}
