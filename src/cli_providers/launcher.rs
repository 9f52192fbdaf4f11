//! Process launcher for agent CLIs
//!
//! The engine only sees an [`AgentHandle`]: a stream of output lines, a one-shot exit
//! result, and a cancellation token that terminates the process. Tests swap in a
//! scripted launcher behind the same trait.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{CliProvider, CliSpawnConfig};
use crate::error::{AppError, AppResult};

const LINE_CHANNEL_CAPACITY: usize = 256;

/// How a launched agent ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentExit {
    Exited(i32),
    /// Killed through the handle's cancellation token
    Killed,
    /// Waiting on the process failed
    Failed(String),
}

/// Live view of a launched agent
pub struct AgentHandle {
    pub pid: Option<u32>,
    /// Output lines in arrival order; closes once the process has no more output
    pub lines: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<AgentExit>,
    /// Cancel to terminate the process (SIGTERM, then SIGKILL after the grace period)
    pub kill: CancellationToken,
}

/// Starts an agent process described by a spawn configuration
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, config: &CliSpawnConfig) -> AppResult<AgentHandle>;
}

/// Launches real OS processes through a [`CliProvider`]
pub struct ProcessLauncher<P: CliProvider> {
    provider: P,
    stop_grace: Duration,
}

impl<P: CliProvider> ProcessLauncher<P> {
    pub fn new(provider: P, stop_grace: Duration) -> Self {
        Self {
            provider,
            stop_grace,
        }
    }
}

impl<P: CliProvider> AgentLauncher for ProcessLauncher<P> {
    fn launch(&self, config: &CliSpawnConfig) -> AppResult<AgentHandle> {
        if !config.working_dir.is_dir() {
            return Err(AppError::launch(format!(
                "Working directory does not exist: {}",
                config.working_dir.display()
            )));
        }

        let mut cmd = Command::new(&config.program);
        cmd.args(self.provider.build_args(config))
            .current_dir(&config.working_dir)
            .envs(&config.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            AppError::launch(format!("Failed to spawn {}: {}", config.program, e))
        })?;
        let pid = child.id();
        debug!(pid = ?pid, program = %config.program, "agent process spawned");

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        tokio::spawn(supervise(child, kill.clone(), self.stop_grace, exit_tx));

        Ok(AgentHandle {
            pid,
            lines: line_rx,
            exit: exit_rx,
            kill,
        })
    }
}

async fn supervise(
    mut child: Child,
    kill: CancellationToken,
    grace: Duration,
    exit_tx: oneshot::Sender<AgentExit>,
) {
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => AgentExit::Exited(exit_code(status)),
            Err(e) => AgentExit::Failed(e.to_string()),
        },
        _ = kill.cancelled() => {
            terminate(&mut child, grace).await;
            AgentExit::Killed
        }
    };
    let _ = exit_tx.send(exit);
}

/// SIGTERM, then SIGKILL if the process outlives the grace period
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid = ?child.id(), "agent ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill agent process");
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs the program with the prompt as its only argument
    struct ShellProvider;

    impl CliProvider for ShellProvider {
        fn name(&self) -> &'static str {
            "sh"
        }
        fn map_model(&self, model: &str) -> String {
            model.to_string()
        }
        fn build_args(&self, config: &CliSpawnConfig) -> Vec<String> {
            vec!["-c".to_string(), config.prompt.clone()]
        }
    }

    fn config(script: &str) -> CliSpawnConfig {
        CliSpawnConfig {
            program: "sh".to_string(),
            prompt: script.to_string(),
            working_dir: std::env::temp_dir(),
            ..CliSpawnConfig::default()
        }
    }

    async fn collect(handle: &mut AgentHandle) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = handle.lines.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_streams_lines_and_exit_code() {
        let launcher = ProcessLauncher::new(ShellProvider, Duration::from_secs(1));
        let mut handle = launcher
            .launch(&config("echo one; echo two; echo three; exit 1"))
            .unwrap();
        assert_eq!(collect(&mut handle).await, vec!["one", "two", "three"]);
        assert_eq!(handle.exit.await.unwrap(), AgentExit::Exited(1));
    }

    #[tokio::test]
    async fn test_kill_terminates_process() {
        let launcher = ProcessLauncher::new(ShellProvider, Duration::from_millis(200));
        let handle = launcher.launch(&config("sleep 30")).unwrap();
        handle.kill.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, AgentExit::Killed);
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let launcher = ProcessLauncher::new(ShellProvider, Duration::from_secs(1));
        let mut cfg = config("true");
        cfg.program = "/nonexistent/agent-binary".to_string();
        let err = launcher.launch(&cfg).err().unwrap();
        assert_eq!(err.code, crate::error::ErrorCode::LaunchError);
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_launch_error() {
        let launcher = ProcessLauncher::new(ShellProvider, Duration::from_secs(1));
        let mut cfg = config("true");
        cfg.working_dir = "/nonexistent/dir/for/agent".into();
        assert!(launcher.launch(&cfg).is_err());
    }
}
