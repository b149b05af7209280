//! Job directory and claim store contracts.
//!
//! The job directory is the service of record for job metadata. The daemon
//! reads job records and their result streams through [`JobDirectory`], and
//! moves ownership of a job between instances through [`ClaimStore`]. Both
//! backends shipped here embed the claim in the job record:
//!
//! - `wrasse`: identity of the instance holding the claim
//! - `time_archive_started`: last time the holder wrote the claim
//! - `claim_version`: version token, bumped on every claim write
//!
//! Every claim write is a compare-and-swap against `claim_version`, so for
//! any job at most one of several racing writers succeeds.
//!
//! # Backends
//!
//! - [`MemoryDirectory`]: in-process, used by tests and embedders
//! - [`SqliteDirectory`]: a SQLite file shared by daemons on one host

pub mod job;
pub mod memory;
pub mod sqlite;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_stream::Stream;

use crate::error::Result;

pub use job::{Job, JobAuth, JobManifest, JobState, Phase};
pub use memory::MemoryDirectory;
pub use sqlite::SqliteDirectory;

/// Lazy sequence of records, ended by exhaustion or by an `Err` item.
pub type RecordStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Current ownership of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub job_id: String,
    pub holder: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Claim {
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }

    /// A claim expires once `now - updated_at >= takeover`.
    ///
    /// A holder that never stamped the claim is treated as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, takeover: Duration) -> bool {
        match self.updated_at {
            Some(updated_at) => now - updated_at >= takeover,
            None => true,
        }
    }
}

/// One result stream of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultStream {
    Errors,
    FailedInputs,
    Inputs,
    Outputs { phase: usize },
}

impl ResultStream {
    pub fn name(&self) -> &'static str {
        match self {
            ResultStream::Errors => "errors",
            ResultStream::FailedInputs => "failed-inputs",
            ResultStream::Inputs => "inputs",
            ResultStream::Outputs { .. } => "outputs",
        }
    }

    /// Name of the exported file, both in scratch and in the object store.
    pub fn file_name(&self) -> &'static str {
        match self {
            ResultStream::Errors => "err.txt",
            ResultStream::FailedInputs => "fail.txt",
            ResultStream::Inputs => "in.txt",
            ResultStream::Outputs { .. } => "out.txt",
        }
    }

    pub fn phase(&self) -> Option<usize> {
        match self {
            ResultStream::Outputs { phase } => Some(*phase),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStream::Outputs { phase } => write!(f, "outputs[{}]", phase),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A record of a result stream.
///
/// `count` is the authoritative stream length and is only present on
/// records of the first page (fetched without a marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: u64,
    pub payload: String,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClaimFilter {
    #[default]
    Any,
    Unclaimed,
    Claimed,
    HeldBy(String),
    /// Claimed by someone other than the given identity.
    HeldByOther(String),
}

impl ClaimFilter {
    pub fn matches(&self, holder: Option<&str>) -> bool {
        match self {
            ClaimFilter::Any => true,
            ClaimFilter::Unclaimed => holder.is_none(),
            ClaimFilter::Claimed => holder.is_some(),
            ClaimFilter::HeldBy(id) => holder == Some(id.as_str()),
            ClaimFilter::HeldByOther(id) => holder.is_some_and(|h| h != id),
        }
    }
}

/// Query against the job directory. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub state: Option<JobState>,
    pub archived: Option<bool>,
    pub claim: ClaimFilter,
    pub archive_started_before: Option<DateTime<Utc>>,
    pub archived_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn done() -> Self {
        Self {
            state: Some(JobState::Done),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(str::to_string);
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn claim(mut self, claim: ClaimFilter) -> Self {
        self.claim = claim;
        self
    }

    pub fn archive_started_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.archive_started_before = Some(cutoff);
        self
    }

    pub fn archived_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.archived_before = Some(cutoff);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.owner.as_deref().is_some_and(|o| o != job.owner) {
            return false;
        }
        if self.state.is_some_and(|s| s != job.state) {
            return false;
        }
        if self.archived.is_some_and(|a| a != job.is_archived()) {
            return false;
        }
        if !self.claim.matches(job.wrasse.as_deref()) {
            return false;
        }
        if let Some(cutoff) = self.archive_started_before {
            if !job.time_archive_started.is_some_and(|t| t <= cutoff) {
                return false;
            }
        }
        if let Some(cutoff) = self.archived_before {
            if !job.time_archive_done.is_some_and(|t| t <= cutoff) {
                return false;
            }
        }
        true
    }
}

/// Read access to job records and their result streams.
#[async_trait]
pub trait JobDirectory: Send + Sync {
    async fn list_jobs(&self, filter: &JobFilter) -> Result<RecordStream<Job>>;

    async fn fetch_job(&self, job_id: &str) -> Result<Job>;

    /// Fetch one page of a result stream, resuming at `marker`.
    ///
    /// Backends may redeliver the record whose id equals `marker`.
    async fn fetch_stream(
        &self,
        job_id: &str,
        stream: ResultStream,
        marker: Option<u64>,
    ) -> Result<RecordStream<StreamEntry>>;

    /// Stamp `time_archive_done` and return the updated record.
    async fn archive_done(&self, job_id: &str) -> Result<Job>;

    /// Permanently delete a job record. Deleting an absent job succeeds.
    async fn delete_job(&self, job_id: &str) -> Result<()>;
}

/// Versioned ownership records keyed by job id.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn get_claim(&self, job_id: &str) -> Result<Claim>;

    /// Compare-and-swap the claim holder.
    ///
    /// Succeeds only if the stored version equals `expected_version`,
    /// otherwise fails with [`ClaimConflict`](crate::error::ArchiverError::ClaimConflict).
    /// Setting a holder stamps `updated_at`; clearing it leaves the stamp.
    async fn put_claim(
        &self,
        job_id: &str,
        holder: Option<&str>,
        expected_version: u64,
    ) -> Result<Claim>;
}
