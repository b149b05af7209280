use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_stream::StreamExt;

use crate::directory::{JobDirectory, ResultStream, StreamEntry};
use crate::error::{ArchiverError, Result};

/// Position within a paginated result stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportCursor {
    pub last_seen: Option<u64>,
    /// Authoritative stream length, taken from the first page.
    pub expected: Option<u64>,
    pub seen: u64,
}

impl ExportCursor {
    /// Record an entry; returns false for a redelivery of the last one seen.
    pub fn observe(&mut self, entry: &StreamEntry) -> bool {
        if self.expected.is_none() {
            self.expected = entry.count;
        }
        if self.last_seen == Some(entry.id) {
            return false;
        }
        self.last_seen = Some(entry.id);
        self.seen += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.seen >= self.expected.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub stream: Option<ResultStream>,
    pub path: PathBuf,
    pub lines: u64,
}

/// Write every record of `stream` to `path`, one payload per line.
///
/// The file is truncated first, so re-running an export overwrites rather
/// than appends. Pages are fetched from the last seen id until the count
/// announced on the first page is reached; `stall_limit` consecutive pages
/// without a new record fail the export.
pub async fn export_stream(
    directory: &dyn JobDirectory,
    job_id: &str,
    stream: ResultStream,
    path: &Path,
    stall_limit: u32,
) -> Result<ExportSummary> {
    let mut out = BufWriter::new(tokio::fs::File::create(path).await?);
    let mut cursor = ExportCursor::default();
    let mut stalled = 0;

    loop {
        let mut page = directory
            .fetch_stream(job_id, stream, cursor.last_seen)
            .await?;
        let mut progressed = false;

        while let Some(entry) = page.next().await {
            let entry = entry?;
            if cursor.observe(&entry) {
                out.write_all(entry.payload.as_bytes()).await?;
                out.write_all(b"\n").await?;
                progressed = true;
            }
        }

        if cursor.is_complete() {
            break;
        }
        if progressed {
            stalled = 0;
        } else {
            stalled += 1;
            if stalled >= stall_limit.max(1) {
                return Err(ArchiverError::ExportIncomplete {
                    job_id: job_id.to_string(),
                    stream: stream.to_string(),
                    seen: cursor.seen,
                    expected: cursor.expected.unwrap_or(0),
                });
            }
        }
        tracing::trace!(
            job_id,
            %stream,
            seen = cursor.seen,
            expected = ?cursor.expected,
            "Fetching next page"
        );
    }

    out.flush().await?;
    out.into_inner().sync_all().await?;
    tracing::debug!(job_id, %stream, lines = cursor.seen, "Exported stream");
    Ok(ExportSummary {
        stream: Some(stream),
        path: path.to_path_buf(),
        lines: cursor.seen,
    })
}

/// Create an empty export, for jobs without phases.
pub async fn export_empty(path: &Path) -> Result<ExportSummary> {
    tokio::fs::File::create(path).await?.sync_all().await?;
    Ok(ExportSummary {
        stream: None,
        path: path.to_path_buf(),
        lines: 0,
    })
}
