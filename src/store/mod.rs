//! Durable object storage for archived job artifacts.
//!
//! Paths are absolute, `/`-separated, and never contain `.` or `..`
//! components. Puts into a missing parent directory fail with
//! [`DirectoryNotFound`](crate::error::ArchiverError::DirectoryNotFound);
//! callers decide whether that is fatal.

pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ArchiverError, Result};

pub use local::LocalObjectStore;
pub use memory::{MemoryObjectStore, StoredObject};

pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub size: Option<u64>,
    /// Base64 MD5 digest of the body.
    pub md5: Option<String>,
}

impl PutOptions {
    pub fn new(content_type: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn md5(mut self, md5: String) -> Self {
        self.md5 = Some(md5);
        self
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, body: ObjectBody, opts: PutOptions) -> Result<()>;

    /// Create a directory and any missing ancestors.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Remove an object; fails with `ObjectNotFound` if absent.
    async fn unlink(&self, path: &str) -> Result<()>;
}

/// Base64-encoded MD5 of `data`, as carried in `PutOptions::md5`.
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Size and base64 MD5 of a local file, read in chunks.
pub async fn file_digest(path: &std::path::Path) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    copy_hashed(&mut file, &mut tokio::io::sink()).await
}

/// Copy `reader` into `writer` in chunks, returning the byte count and
/// base64 MD5 of what was copied.
pub async fn copy_hashed<R, W>(reader: &mut R, writer: &mut W) -> Result<(u64, String)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    writer.flush().await?;
    Ok((size, STANDARD.encode(hasher.finalize())))
}

/// Check a received body against the size and digest the caller declared.
pub(crate) fn verify_body(path: &str, opts: &PutOptions, size: u64, md5: &str) -> Result<()> {
    if opts.size.is_some_and(|expected| expected != size) {
        return Err(ArchiverError::Store(format!(
            "{}: size mismatch ({} bytes received)",
            path, size
        )));
    }
    if opts.md5.as_deref().is_some_and(|expected| expected != md5) {
        return Err(ArchiverError::Store(format!("{}: md5 mismatch", path)));
    }
    Ok(())
}

/// Split an object path into its components, rejecting relative paths.
pub fn path_components(path: &str) -> Result<Vec<&str>> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| ArchiverError::Store(format!("object path must be absolute: {}", path)))?;
    let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(ArchiverError::Store(format!("invalid object path: {}", path)));
    }
    Ok(parts)
}

/// Wrap an in-memory buffer as an object body.
pub fn bytes_body(data: Vec<u8>) -> ObjectBody {
    Box::pin(std::io::Cursor::new(data))
}
