use std::path::PathBuf;

use tracing::warn;

use super::types::Approval;
use crate::error::{AppError, AppResult};
use crate::utils::paths::is_safe_file_stem;

/// One JSON document per approval
pub struct ApprovalStore {
    dir: PathBuf,
}

impl ApprovalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> AppResult<PathBuf> {
        if !is_safe_file_stem(id) {
            return Err(AppError::not_found("Approval", id));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    pub async fn save(&self, approval: &Approval) -> AppResult<()> {
        let path = self.path(&approval.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(approval)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> AppResult<Approval> {
        let path = self.path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::not_found("Approval", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable approval, newest first
    pub async fn load_all(&self) -> AppResult<Vec<Approval>> {
        let mut approvals = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(approvals),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Approval>(&bytes) {
                Ok(approval) => approvals.push(approval),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable approval"),
            }
        }
        approvals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(approvals)
    }
}
