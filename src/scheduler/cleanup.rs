use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::directory::{ClaimFilter, Job, JobDirectory, JobFilter};
use crate::error::Result;
use crate::scheduler::sweep_jobs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: u64,
}

/// Purges job records archived at least `linger` ago by this instance.
pub struct CleanupSweeper {
    directory: Arc<dyn JobDirectory>,
    identity: String,
    owner: Option<String>,
    linger: Duration,
    limit: usize,
}

impl CleanupSweeper {
    pub fn new(directory: Arc<dyn JobDirectory>, identity: &str, linger: Duration) -> Self {
        Self {
            directory,
            identity: identity.to_string(),
            owner: None,
            linger,
            limit: 10,
        }
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn filter(&self, now: DateTime<Utc>) -> JobFilter {
        JobFilter::done()
            .owner(self.owner.as_deref())
            .archived(true)
            .claim(ClaimFilter::HeldBy(self.identity.clone()))
            .archived_before(now - self.linger)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        tracing::debug!("Cleanup sweep started");
        let jobs = self.directory.list_jobs(&self.filter(now)).await?;
        let deleted = Arc::new(AtomicUsize::new(0));

        let snapshot = sweep_jobs("cleanup", self.limit, jobs, {
            let directory = self.directory.clone();
            let deleted = deleted.clone();
            move |job: Job| {
                let directory = directory.clone();
                let deleted = deleted.clone();
                async move {
                    directory.delete_job(&job.job_id).await?;
                    tracing::info!(job_id = %job.job_id, "Purged archived job");
                    deleted.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }
        })
        .await?;

        let report = CleanupReport {
            deleted: deleted.load(Ordering::Relaxed),
            failed: snapshot.failed,
        };
        tracing::debug!(?report, "Cleanup sweep done");
        Ok(report)
    }
}
