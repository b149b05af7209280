use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crate::error::{ArchiverError, Result};
use crate::store::{copy_hashed, path_components, verify_body, ObjectBody, ObjectStore, PutOptions};

/// Object store backed by a local directory tree.
///
/// Object `/a/b/c` lives at `<root>/a/b/c`. Content type and headers are
/// not persisted.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for part in path_components(path)? {
            resolved.push(part);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, mut body: ObjectBody, opts: PutOptions) -> Result<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| ArchiverError::Store(format!("no parent for {}", path)))?
            .to_path_buf();
        if !tokio::fs::metadata(&parent)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(ArchiverError::DirectoryNotFound(parent.display().to_string()));
        }

        // Stream beside the target and rename so readers never see a partial object.
        let staging = parent.join(format!(
            ".{}.{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4()
        ));
        let mut file = tokio::fs::File::create(&staging).await?;
        let written = match copy_hashed(&mut body, &mut file).await {
            Ok((size, md5)) => verify_body(path, &opts, size, &md5).map(|()| size),
            Err(e) => Err(e),
        };
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(&staging).await {
                    tracing::warn!(path, error = %rm, "Unable to remove staging file");
                }
                return Err(e);
            }
        };
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, &target).await?;

        tracing::debug!(path, bytes = size, "Stored object");
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiverError::ObjectNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
