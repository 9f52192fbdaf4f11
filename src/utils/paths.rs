use std::env;
use std::path::{Path, PathBuf};

// =============================================================================
// Core Path Functions
// =============================================================================

/// Get user home directory
/// NEVER use "~" as Rust's std::fs and Command do not expand it
pub fn get_home_dir() -> Result<PathBuf, String> {
    env::var("HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::home_dir)
        .ok_or_else(|| "HOME environment variable not set".to_string())
}

/// Get data root directory for persisted state
/// Priority:
/// 1. CADENCE_DATA_ROOT environment variable
/// 2. Default to ~/.cadence
pub fn default_data_root() -> Result<PathBuf, String> {
    if let Ok(data_root) = env::var("CADENCE_DATA_ROOT") {
        if !data_root.trim().is_empty() {
            return Ok(expand_home(&data_root));
        }
    }
    Ok(get_home_dir()?.join(".cadence"))
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return get_home_dir().unwrap_or_else(|_| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = get_home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// =============================================================================
// Data Layout
// =============================================================================

/// Filesystem layout under the data root
///
/// ```text
/// <root>/tasks.yaml
/// <root>/approvals/<approval_id>.json
/// <root>/logs/<task_id>.jsonl
/// <root>/logs/inflight/<execution_id>.json
/// ```
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.yaml")
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.root.join("approvals")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn inflight_dir(&self) -> PathBuf {
        self.logs_dir().join("inflight")
    }

    /// Create every directory in the layout
    pub fn ensure(&self) -> Result<(), String> {
        for dir in [self.approvals_dir(), self.inflight_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        Ok(())
    }
}

/// Ids become file names; anything outside `[A-Za-z0-9_-]` is rejected
pub fn is_safe_file_stem(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = DataPaths::new("/data");
        assert_eq!(paths.tasks_file(), PathBuf::from("/data/tasks.yaml"));
        assert_eq!(paths.approvals_dir(), PathBuf::from("/data/approvals"));
        assert_eq!(paths.inflight_dir(), PathBuf::from("/data/logs/inflight"));
    }

    #[test]
    fn test_ensure_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("nested"));
        paths.ensure().unwrap();
        assert!(paths.approvals_dir().is_dir());
        assert!(paths.inflight_dir().is_dir());
    }

    #[test]
    fn test_safe_file_stem() {
        assert!(is_safe_file_stem("a1b2c3d4"));
        assert!(is_safe_file_stem("9f1c-22_x"));
        assert!(!is_safe_file_stem("../etc"));
        assert!(!is_safe_file_stem(""));
        assert!(!is_safe_file_stem("a/b"));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/srv/cadence"), PathBuf::from("/srv/cadence"));
    }
}
