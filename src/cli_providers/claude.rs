//! Claude Code CLI provider implementation

use super::types::*;
use crate::tasks::skills::resolve_prompt;
use crate::tasks::Task;

/// Appended to every fresh, non-planning run
pub const TASK_SYSTEM_PROMPT: &str = "You are running as a scheduled task agent. Complete the \
task described in the prompt without asking follow-up questions. Nobody is watching this session \
interactively, so make reasonable assumptions and finish the work.";

pub const PLAN_MODE_SYSTEM_PROMPT: &str = "You are running as a scheduled task agent. You can \
help with ANY task the user has scheduled, including coding, content creation, research, writing, \
analysis and automation. Do not refuse tasks for being non-coding: the user explicitly scheduled \
this task and expects it to be completed. If the task involves creating content, generate the \
content directly. If it involves file operations, plan those operations.";

pub const APPROVAL_SYSTEM_PROMPT: &str = "You are running as a scheduled task agent. The user has \
reviewed and APPROVED your plan. Complete the task now without refusing or redirecting. If the \
task involves files, create or modify them. If it is content generation, output the final \
content. The user explicitly approved this, so proceed fully.";

pub const APPROVED_PROMPT: &str = "USER APPROVED. Complete the task now.";

/// Claude Code CLI provider
///
/// Uses the `claude` CLI command with flags:
/// - `-p <prompt>`: Prompt to send
/// - `--model <model>`: Model selection (opus, sonnet, haiku)
/// - `--resume <session>`: Continue an existing session
/// - `--permission-mode plan`: Read-only planning
/// - `--dangerously-skip-permissions`: Skip permission prompts
/// - `--output-format stream-json --verbose`: JSON streaming output
/// - `--include-partial-messages`: Token-level deltas
/// - `--max-turns <n>`: Agentic turn cap
/// - `--allowedTools <tools>`: Comma-separated list of allowed tools
/// - `--append-system-prompt <prompt>`: Additional system prompt
pub struct ClaudeCodeProvider {
    program: String,
}

impl ClaudeCodeProvider {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolve the spawn configuration for running `task` with `strategy`
    pub fn spawn_config(&self, task: &Task, strategy: &Strategy) -> CliSpawnConfig {
        let base = CliSpawnConfig {
            program: self.program.clone(),
            working_dir: task.working_dir.clone(),
            ..CliSpawnConfig::default()
        };

        match strategy {
            Strategy::Headless | Strategy::Autonomous | Strategy::Skill => CliSpawnConfig {
                prompt: resolve_prompt(task),
                model: Some(task.model.as_str().to_string()),
                allowed_tools: task.allowed_tools.clone(),
                system_prompt_append: Some(TASK_SYSTEM_PROMPT.to_string()),
                skip_permissions: task.autonomous || *strategy == Strategy::Autonomous,
                max_turns: task.max_turns,
                ..base
            },
            Strategy::PlanMode => CliSpawnConfig {
                prompt: resolve_prompt(task),
                model: Some(task.model.as_str().to_string()),
                permission_mode: PermissionMode::Plan,
                allowed_tools: task.allowed_tools.clone(),
                system_prompt_append: Some(PLAN_MODE_SYSTEM_PROMPT.to_string()),
                max_turns: task.max_turns,
                ..base
            },
            Strategy::ResumeWithApproval { session_id } => CliSpawnConfig {
                prompt: APPROVED_PROMPT.to_string(),
                resume_session: Some(session_id.clone()),
                system_prompt_append: Some(APPROVAL_SYSTEM_PROMPT.to_string()),
                skip_permissions: true,
                ..base
            },
            Strategy::ResumeWithFeedback {
                session_id,
                feedback,
            } => CliSpawnConfig {
                prompt: feedback.clone(),
                resume_session: Some(session_id.clone()),
                permission_mode: PermissionMode::Plan,
                system_prompt_append: Some(PLAN_MODE_SYSTEM_PROMPT.to_string()),
                ..base
            },
        }
    }
}

/// Pick the strategy for a fresh run of `task`
pub fn initial_strategy(task: &Task) -> Strategy {
    if task.plan_mode {
        Strategy::PlanMode
    } else if task.skill.is_some() {
        Strategy::Skill
    } else if task.autonomous {
        Strategy::Autonomous
    } else {
        Strategy::Headless
    }
}

impl CliProvider for ClaudeCodeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn map_model(&self, model: &str) -> String {
        // Claude Code uses simple model names directly
        match model.to_lowercase().as_str() {
            "opus" | "claude-opus" => "opus".to_string(),
            "sonnet" | "claude-sonnet" => "sonnet".to_string(),
            "haiku" | "claude-haiku" => "haiku".to_string(),
            other => other.to_string(),
        }
    }

    fn build_args(&self, config: &CliSpawnConfig) -> Vec<String> {
        let mut args = Vec::new();

        // Resume
        if let Some(ref session_id) = config.resume_session {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }

        // System prompt append
        if let Some(ref system_prompt) = config.system_prompt_append {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }

        args.push("-p".to_string());
        args.push(config.prompt.clone());

        if config.permission_mode == PermissionMode::Plan {
            args.push("--permission-mode".to_string());
            args.push("plan".to_string());
        }

        if config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        // Output format
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        if config.include_partial_messages {
            args.push("--include-partial-messages".to_string());
        }

        // Model
        if let Some(ref model) = config.model {
            args.push("--model".to_string());
            args.push(self.map_model(model));
        }

        if let Some(turns) = config.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }

        // Allowed tools
        if !config.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(config.allowed_tools.join(","));
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::sample_create;

    fn task(plan_mode: bool, autonomous: bool) -> Task {
        let mut req = sample_create("digest", "0 9 * * *");
        req.plan_mode = plan_mode;
        req.autonomous = autonomous;
        req.max_turns = Some(12);
        req.allowed_tools = vec!["Read".to_string(), "Grep".to_string()];
        Task::from_create(req).unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(initial_strategy(&task(false, false)), Strategy::Headless);
        assert_eq!(initial_strategy(&task(false, true)), Strategy::Autonomous);
        assert_eq!(initial_strategy(&task(true, true)), Strategy::PlanMode);
    }

    #[test]
    fn test_headless_args() {
        let provider = ClaudeCodeProvider::new("claude");
        let t = task(false, false);
        let args = provider.build_args(&provider.spawn_config(&t, &Strategy::Headless));

        assert!(has_pair(&args, "-p", "summarize recent commits"));
        assert!(has_pair(&args, "--output-format", "stream-json"));
        assert!(has_pair(&args, "--model", "sonnet"));
        assert!(has_pair(&args, "--max-turns", "12"));
        assert!(has_pair(&args, "--allowedTools", "Read,Grep"));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));
    }

    #[test]
    fn test_autonomous_skips_permissions() {
        let provider = ClaudeCodeProvider::new("claude");
        let args = provider.build_args(&provider.spawn_config(&task(false, true), &Strategy::Autonomous));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_plan_mode_args() {
        let provider = ClaudeCodeProvider::new("claude");
        let args = provider.build_args(&provider.spawn_config(&task(true, true), &Strategy::PlanMode));
        assert!(has_pair(&args, "--permission-mode", "plan"));
        assert!(has_pair(&args, "--append-system-prompt", PLAN_MODE_SYSTEM_PROMPT));
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_resume_strategies() {
        let provider = ClaudeCodeProvider::new("claude");
        let t = task(true, false);

        let approve = provider.build_args(&provider.spawn_config(
            &t,
            &Strategy::ResumeWithApproval {
                session_id: "sess-1".to_string(),
            },
        ));
        assert!(has_pair(&approve, "--resume", "sess-1"));
        assert!(has_pair(&approve, "-p", APPROVED_PROMPT));
        assert!(approve.contains(&"--dangerously-skip-permissions".to_string()));

        let feedback = provider.build_args(&provider.spawn_config(
            &t,
            &Strategy::ResumeWithFeedback {
                session_id: "sess-1".to_string(),
                feedback: "also update the changelog".to_string(),
            },
        ));
        assert!(has_pair(&feedback, "--resume", "sess-1"));
        assert!(has_pair(&feedback, "-p", "also update the changelog"));
        assert!(has_pair(&feedback, "--permission-mode", "plan"));
        assert!(!feedback.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_build_command_is_shell_escaped() {
        let provider = ClaudeCodeProvider::new("claude");
        let mut config = provider.spawn_config(&task(false, false), &Strategy::Headless);
        config.prompt = "it's done".to_string();
        config.working_dir = "/tmp/my project".into();
        let command = provider.build_command(&config);
        assert!(command.starts_with("cd '/tmp/my project' && claude "));
        assert!(command.contains("-p 'it'\\''s done'"));
    }
}
