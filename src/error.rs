use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Claim conflict on job {job_id}: expected version {expected}, found {actual}")]
    ClaimConflict {
        job_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Claim on job {0} was lost during archival")]
    ClaimLost(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Directory does not exist: {0}")]
    DirectoryNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Job directory error: {0}")]
    Directory(String),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Identity service error: {0}")]
    Identity(String),

    #[error("Export of {stream} for job {job_id} stalled at {seen} of {expected} records")]
    ExportIncomplete {
        job_id: String,
        stream: String,
        seen: u64,
        expected: u64,
    },

    #[error("Work queue is closed")]
    QueueClosed,

    #[error("Invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchiverError {
    /// A lost compare-and-swap race. Expected under contention, never alarming.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, ArchiverError::ClaimConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArchiverError::JobNotFound(_) | ArchiverError::ObjectNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ArchiverError>;
