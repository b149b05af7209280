use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ArchiverError, Result};
use crate::store::{copy_hashed, path_components, verify_body, ObjectBody, ObjectStore, PutOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
}

impl StoredObject {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<String, StoredObject>,
    dirs: BTreeSet<String>,
}

/// Object store kept in memory, with directory semantics.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: RwLock<StoreState>,
}

fn normalize(path: &str) -> Result<(String, String)> {
    let parts = path_components(path)?;
    let full = format!("/{}", parts.join("/"));
    let parent = format!("/{}", parts[..parts.len() - 1].join("/"));
    Ok((full, parent))
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, path: &str) -> Option<StoredObject> {
        let (full, _) = normalize(path).ok()?;
        self.state.read().await.objects.get(&full).cloned()
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.get(path).await.is_some()
    }

    pub async fn is_dir(&self, path: &str) -> bool {
        match normalize(path) {
            Ok((full, _)) => self.state.read().await.dirs.contains(&full),
            Err(_) => false,
        }
    }

    pub async fn paths(&self) -> Vec<String> {
        self.state.read().await.objects.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, mut body: ObjectBody, opts: PutOptions) -> Result<()> {
        let (full, parent) = normalize(path)?;
        if parent != "/" && !self.state.read().await.dirs.contains(&parent) {
            return Err(ArchiverError::DirectoryNotFound(parent));
        }

        let mut data = Vec::new();
        let (size, md5) = copy_hashed(&mut body, &mut data).await?;
        verify_body(&full, &opts, size, &md5)?;

        self.state.write().await.objects.insert(
            full,
            StoredObject {
                data,
                content_type: opts.content_type,
                headers: opts.headers,
            },
        );
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let parts = path_components(path)?;
        let mut state = self.state.write().await;
        for depth in 1..=parts.len() {
            state.dirs.insert(format!("/{}", parts[..depth].join("/")));
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let (full, _) = normalize(path)?;
        match self.state.write().await.objects.remove(&full) {
            Some(_) => Ok(()),
            None => Err(ArchiverError::ObjectNotFound(full)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{bytes_body, content_md5};

    #[tokio::test]
    async fn put_requires_parent_directory() {
        let store = MemoryObjectStore::new();
        let err = store
            .put("/U1/jobs/J1/in.txt", bytes_body(b"a\n".to_vec()), PutOptions::new("text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiverError::DirectoryNotFound(ref d) if d == "/U1/jobs/J1"));

        store.mkdir("/U1/jobs/J1").await.unwrap();
        assert!(store.is_dir("/U1/jobs").await);
        store
            .put("/U1/jobs/J1/in.txt", bytes_body(b"a\n".to_vec()), PutOptions::new("text/plain"))
            .await
            .unwrap();
        assert_eq!(store.get("/U1/jobs/J1/in.txt").await.unwrap().lines(), vec!["a"]);
    }

    #[tokio::test]
    async fn put_verifies_size_and_md5() {
        let store = MemoryObjectStore::new();
        store.mkdir("/a").await.unwrap();

        let bad_size = PutOptions::new("text/plain").size(10);
        assert!(store.put("/a/b", bytes_body(b"abc".to_vec()), bad_size).await.is_err());

        let bad_md5 = PutOptions::new("text/plain").md5(content_md5(b"xyz"));
        assert!(store.put("/a/b", bytes_body(b"abc".to_vec()), bad_md5).await.is_err());

        let good = PutOptions::new("text/plain").size(3).md5(content_md5(b"abc"));
        store.put("/a/b", bytes_body(b"abc".to_vec()), good).await.unwrap();
    }

    #[tokio::test]
    async fn unlink_missing_object() {
        let store = MemoryObjectStore::new();
        store.mkdir("/a").await.unwrap();
        let err = store.unlink("/a/live").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
