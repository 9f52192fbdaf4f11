//! Prompt resolution for skill and free-text tasks

use std::path::{Path, PathBuf};

use super::types::Task;

/// `<working_dir>/.claude/skills/<skill>/SKILL.md`
pub fn skill_file(working_dir: &Path, skill: &str) -> PathBuf {
    working_dir
        .join(".claude")
        .join("skills")
        .join(skill)
        .join("SKILL.md")
}

/// The prompt sent to the agent for `task`.
///
/// A skill with a readable SKILL.md contributes its body (front matter stripped) with
/// `$ARGUMENTS` substituted; otherwise the slash-command form `/<skill> <arguments>` is
/// used and the agent CLI resolves the skill itself. `{{name}}` placeholders are filled
/// from the task's variables in both cases.
pub fn resolve_prompt(task: &Task) -> String {
    let raw = match &task.skill {
        Some(skill) => {
            let arguments = task.skill_arguments.as_deref().unwrap_or("");
            match std::fs::read_to_string(skill_file(&task.working_dir, skill)) {
                Ok(contents) => strip_front_matter(&contents)
                    .trim()
                    .replace("$ARGUMENTS", arguments),
                Err(_) if arguments.is_empty() => format!("/{}", skill),
                Err(_) => format!("/{} {}", skill, arguments),
            }
        }
        None => task.prompt.clone().unwrap_or_default(),
    };
    substitute_variables(&raw, task)
}

fn substitute_variables(text: &str, task: &Task) -> String {
    task.variables
        .iter()
        .fold(text.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{{{}}}}}", key), value)
        })
}

/// Drop a leading `---` delimited YAML block
fn strip_front_matter(contents: &str) -> &str {
    let Some(rest) = contents.strip_prefix("---") else {
        return contents;
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            after.strip_prefix('\n').unwrap_or(after)
        }
        None => contents,
    }
}
