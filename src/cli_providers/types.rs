//! Types and traits for CLI provider abstraction

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

/// Configuration for spawning a CLI agent
#[derive(Clone, Debug, PartialEq)]
pub struct CliSpawnConfig {
    /// Executable to run
    pub program: String,
    /// The prompt/instructions to send to the agent
    pub prompt: String,
    /// Model to use (provider-agnostic name like "opus", "sonnet", "haiku")
    pub model: Option<String>,
    /// Working directory for the agent
    pub working_dir: PathBuf,
    /// Session to resume instead of starting a new one
    pub resume_session: Option<String>,
    pub permission_mode: PermissionMode,
    /// Allowed tools (for guardrails)
    pub allowed_tools: Vec<String>,
    /// Additional system prompt content
    pub system_prompt_append: Option<String>,
    /// Whether to skip permission prompts
    pub skip_permissions: bool,
    pub max_turns: Option<u32>,
    /// Stream token-level deltas in addition to whole messages
    pub include_partial_messages: bool,
    /// Environment variables to set
    pub env_vars: HashMap<String, String>,
}

impl Default for CliSpawnConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            prompt: String::new(),
            model: None,
            working_dir: PathBuf::from("."),
            resume_session: None,
            permission_mode: PermissionMode::Default,
            allowed_tools: Vec::new(),
            system_prompt_append: None,
            skip_permissions: false,
            max_turns: None,
            include_partial_messages: true,
            env_vars: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PermissionMode {
    #[default]
    Default,
    /// Read-only planning; the agent proposes a plan instead of acting
    Plan,
}

/// How a run invokes the agent
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    /// Prompt task with permission prompts left on
    Headless,
    /// Prompt task with `--dangerously-skip-permissions`
    Autonomous,
    Skill,
    PlanMode,
    /// Continue a planning session after the plan was approved
    ResumeWithApproval { session_id: String },
    /// Continue a planning session with reviewer feedback, still read-only
    ResumeWithFeedback { session_id: String, feedback: String },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Headless => "headless",
            Strategy::Autonomous => "autonomous",
            Strategy::Skill => "skill",
            Strategy::PlanMode => "plan_mode",
            Strategy::ResumeWithApproval { .. } => "resume_with_approval",
            Strategy::ResumeWithFeedback { .. } => "resume_with_feedback",
        }
    }

    /// Whether the run stops at a plan and waits for review
    pub fn is_planning(&self) -> bool {
        matches!(self, Strategy::PlanMode | Strategy::ResumeWithFeedback { .. })
    }
}

/// Trait for CLI provider implementations
///
/// A provider turns a spawn configuration into a concrete command line for its CLI.
pub trait CliProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &'static str;

    /// Map a generic model name to provider-specific model identifier
    fn map_model(&self, model: &str) -> String;

    /// Build CLI arguments (for direct Command building, not shell string)
    fn build_args(&self, config: &CliSpawnConfig) -> Vec<String>;

    /// Build a copy-pasteable shell command line
    fn build_command(&self, config: &CliSpawnConfig) -> String {
        let mut parts = Vec::new();
        if !config.env_vars.is_empty() {
            let mut exports: Vec<String> = config
                .env_vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, shell_escape::escape(v.as_str().into())))
                .collect();
            exports.sort();
            parts.push(format!("export {}", exports.join(" ")));
        }
        parts.push(format!(
            "cd {}",
            shell_escape::escape(config.working_dir.to_string_lossy())
        ));

        let mut cmd = vec![shell_escape::escape(config.program.as_str().into()).into_owned()];
        cmd.extend(
            self.build_args(config)
                .iter()
                .map(|arg| shell_escape::escape(arg.as_str().into()).into_owned()),
        );
        parts.push(cmd.join(" "));
        parts.join(" && ")
    }
}
