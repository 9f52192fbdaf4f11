//! Scripted stand-in for the agent process

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cli_providers::{AgentExit, AgentHandle, AgentLauncher, CliSpawnConfig};
use crate::error::{AppError, AppResult};

pub const INIT_LINE: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#;

/// Assistant message calling ExitPlanMode with `plan`
pub fn plan_line(plan: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": {"content": [{
            "type": "tool_use",
            "id": "toolu_1",
            "name": "ExitPlanMode",
            "input": {"plan": plan}
        }]},
        "session_id": "sess-1"
    })
    .to_string()
}

pub fn result_line(text: &str) -> String {
    serde_json::json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": text,
        "session_id": "sess-1"
    })
    .to_string()
}

/// What one launch does
pub enum Script {
    /// Print the lines, then exit with the code
    Exit(Vec<String>, i32),
    /// Print the lines, then run until killed
    Hang(Vec<String>),
    LaunchError(String),
}

impl Script {
    pub fn exit(lines: &[&str], code: i32) -> Self {
        Script::Exit(lines.iter().map(|l| l.to_string()).collect(), code)
    }

    pub fn hang(lines: &[&str]) -> Self {
        Script::Hang(lines.iter().map(|l| l.to_string()).collect())
    }

    pub fn launch_error(message: &str) -> Self {
        Script::LaunchError(message.to_string())
    }
}

/// Plays one script per launch, in order
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    launched: Mutex<Vec<CliSpawnConfig>>,
}

impl ScriptedLauncher {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Spawn configurations seen so far
    pub fn launched(&self) -> Vec<CliSpawnConfig> {
        self.launched.lock().unwrap().clone()
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(&self, config: &CliSpawnConfig) -> AppResult<AgentHandle> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::exit(&[], 0));
        let (lines, exit_code) = match script {
            Script::LaunchError(message) => return Err(AppError::launch(message)),
            Script::Exit(lines, code) => (lines, Some(code)),
            Script::Hang(lines) => (lines, None),
        };
        self.launched.lock().unwrap().push(config.clone());

        let (line_tx, line_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let token = kill.clone();
        tokio::spawn(async move {
            for line in lines {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
            let exit = match exit_code {
                Some(code) => {
                    drop(line_tx);
                    AgentExit::Exited(code)
                }
                None => {
                    token.cancelled().await;
                    drop(line_tx);
                    AgentExit::Killed
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(AgentHandle {
            pid: None,
            lines: line_rx,
            exit: exit_rx,
            kill,
        })
    }
}
