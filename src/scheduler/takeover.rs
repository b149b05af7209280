use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::directory::{ClaimFilter, ClaimStore, Job, JobDirectory, JobFilter};
use crate::error::Result;
use crate::scheduler::claim::{reset_stale_claim, ResetOutcome};
use crate::scheduler::sweep_jobs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakeoverReport {
    /// Unarchived jobs whose stale claim was cleared for anyone to find.
    pub released: usize,
    /// Archived, uncleaned jobs whose stale claim moved to this instance.
    pub reclaimed: usize,
    pub failed: u64,
}

/// Recovers jobs whose claim holder crashed or stalled.
///
/// Two disjoint sets are swept, both restricted to claims held by someone
/// else and not renewed within `takeover`:
///
/// - unarchived jobs: the claim is cleared, so the next find round of any
///   instance picks the job up again
/// - archived jobs that outlived `linger + takeover` without being purged:
///   the claim moves to this instance, whose cleanup sweep then purges them
pub struct TakeoverSweeper {
    directory: Arc<dyn JobDirectory>,
    claims: Arc<dyn ClaimStore>,
    identity: String,
    owner: Option<String>,
    takeover: Duration,
    linger: Duration,
    limit: usize,
}

impl TakeoverSweeper {
    pub fn new(
        directory: Arc<dyn JobDirectory>,
        claims: Arc<dyn ClaimStore>,
        identity: &str,
        takeover: Duration,
        linger: Duration,
    ) -> Self {
        Self {
            directory,
            claims,
            identity: identity.to_string(),
            owner: None,
            takeover,
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

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<TakeoverReport> {
        tracing::debug!("Takeover sweep started");
        let (released, failed_release) = self.release_abandoned(now).await?;
        let (reclaimed, failed_reclaim) = self.reclaim_unpurged(now).await?;
        let report = TakeoverReport {
            released,
            reclaimed,
            failed: failed_release + failed_reclaim,
        };
        tracing::debug!(?report, "Takeover sweep done");
        Ok(report)
    }

    fn stale_claims(&self, now: DateTime<Utc>) -> JobFilter {
        JobFilter::done()
            .owner(self.owner.as_deref())
            .claim(ClaimFilter::HeldByOther(self.identity.clone()))
            .archive_started_before(now - self.takeover)
    }

    async fn release_abandoned(&self, now: DateTime<Utc>) -> Result<(usize, u64)> {
        let filter = self.stale_claims(now).archived(false);
        self.reset_each(filter, None, now).await
    }

    async fn reclaim_unpurged(&self, now: DateTime<Utc>) -> Result<(usize, u64)> {
        let filter = self
            .stale_claims(now)
            .archived(true)
            .archived_before(now - self.linger - self.takeover);
        self.reset_each(filter, Some(self.identity.clone()), now)
            .await
    }

    async fn reset_each(
        &self,
        filter: JobFilter,
        new_holder: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(usize, u64)> {
        let jobs = self.directory.list_jobs(&filter).await?;
        let reset = Arc::new(AtomicUsize::new(0));

        let snapshot = sweep_jobs("takeover", self.limit, jobs, {
            let claims = self.claims.clone();
            let identity = self.identity.clone();
            let takeover = self.takeover;
            let reset = reset.clone();
            move |job: Job| {
                let claims = claims.clone();
                let identity = identity.clone();
                let new_holder = new_holder.clone();
                let reset = reset.clone();
                async move {
                    // Only archived jobs may be handed to ourselves.
                    if new_holder.is_some() && job.time_archive_done.is_none() {
                        return Ok(());
                    }
                    let outcome = reset_stale_claim(
                        claims.as_ref(),
                        &job.job_id,
                        &identity,
                        new_holder.as_deref(),
                        takeover,
                        now,
                    )
                    .await;
                    match outcome {
                        Ok(ResetOutcome::Reset(claim)) => {
                            tracing::info!(
                                job_id = %job.job_id,
                                previous = ?job.wrasse,
                                holder = ?claim.holder,
                                "Took over stale claim"
                            );
                            reset.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                        Ok(_) => Ok(()),
                        Err(e) if e.is_not_found() => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            }
        })
        .await?;

        Ok((reset.load(Ordering::Relaxed), snapshot.failed))
    }
}
