use std::path::{Path, PathBuf};

use crate::error::{ArchiverError, Result};

/// Per-job local staging directory.
///
/// Created empty at pipeline start, wiping anything left behind by an
/// earlier attempt on the same job, and removed at pipeline end.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(root: &Path, job_id: &str) -> Result<Self> {
        if job_id.is_empty()
            || job_id == "."
            || job_id == ".."
            || job_id.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        {
            return Err(ArchiverError::InvalidJobId(job_id.to_string()));
        }

        let path = root.join(job_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub async fn remove(self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
