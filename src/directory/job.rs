use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::Claim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            other => Err(format!("unknown job state {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
}

impl Phase {
    pub fn map(exec: &str) -> Self {
        Self {
            kind: "map".to_string(),
            exec: Some(exec.to_string()),
        }
    }

    pub fn reduce(exec: &str) -> Self {
        Self {
            kind: "reduce".to_string(),
            exec: Some(exec.to_string()),
        }
    }
}

/// Credentials the job was submitted with; needed to write into the
/// owner's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAuth {
    pub login: String,
    #[serde(default)]
    pub token: String,
}

/// A job record as held by the job directory.
///
/// The daemon only reads the record, except for the claim fields
/// (`wrasse`, `time_archive_started`, `claim_version`) which move through
/// [`ClaimStore`](crate::directory::ClaimStore) compare-and-swap, and
/// `time_archive_done` which is set once by
/// [`JobDirectory::archive_done`](crate::directory::JobDirectory::archive_done).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub owner: String,
    pub state: JobState,
    #[serde(default)]
    pub phases: Vec<Phase>,
    pub auth: JobAuth,
    pub time_created: DateTime<Utc>,
    #[serde(default)]
    pub time_done: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_archive_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_archive_done: Option<DateTime<Utc>>,
    /// Identity of the daemon instance currently holding the claim.
    #[serde(default)]
    pub wrasse: Option<String>,
    #[serde(default)]
    pub claim_version: u64,
}

impl Job {
    pub fn new(job_id: &str, owner: &str, login: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: None,
            owner: owner.to_string(),
            state: JobState::Running,
            phases: vec![Phase::map("wc")],
            auth: JobAuth {
                login: login.to_string(),
                token: String::new(),
            },
            time_created: Utc::now(),
            time_done: None,
            time_archive_started: None,
            time_archive_done: None,
            wrasse: None,
            claim_version: 0,
        }
    }

    /// Mark the job finished, as the compute layer would.
    pub fn done(mut self) -> Self {
        self.state = JobState::Done;
        self.time_done = Some(Utc::now());
        self
    }

    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.auth.token = token.to_string();
        self
    }

    pub fn is_archived(&self) -> bool {
        self.time_archive_done.is_some()
    }

    /// Index of the phase whose outputs are the job's outputs.
    pub fn output_phase(&self) -> Option<usize> {
        self.phases.len().checked_sub(1)
    }

    pub fn claim(&self) -> Claim {
        Claim {
            job_id: self.job_id.clone(),
            holder: self.wrasse.clone(),
            updated_at: self.time_archive_started,
            version: self.claim_version,
        }
    }

    /// Public view uploaded into the owner's namespace.
    pub fn manifest(&self) -> JobManifest {
        JobManifest {
            id: self.job_id.clone(),
            name: self.name.clone().unwrap_or_default(),
            state: self.state,
            cancelled: false,
            input_done: true,
            phases: self.phases.clone(),
            time_created: self.time_created,
            time_done: self.time_done,
            time_archive_started: self.time_archive_started,
            time_archive_done: self.time_archive_done,
        }
    }

    /// Full record with the auth token stripped, for the admin archive.
    pub fn redacted(&self) -> Job {
        let mut job = self.clone();
        job.auth.token.clear();
        job
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub id: String,
    pub name: String,
    pub state: JobState,
    pub cancelled: bool,
    pub input_done: bool,
    pub phases: Vec<Phase>,
    pub time_created: DateTime<Utc>,
    pub time_done: Option<DateTime<Utc>>,
    pub time_archive_started: Option<DateTime<Utc>>,
    pub time_archive_done: Option<DateTime<Utc>>,
}
