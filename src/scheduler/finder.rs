use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio_stream::StreamExt;

use crate::directory::{Claim, ClaimStore, Job, JobDirectory, JobFilter};
use crate::error::Result;
use crate::scheduler::claim::{try_claim, ClaimOutcome};

/// A job this instance has claimed and must archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub claim: Claim,
}

impl ClaimedJob {
    pub fn new(mut job: Job, claim: Claim) -> Self {
        job.wrasse = claim.holder.clone();
        job.time_archive_started = claim.updated_at;
        job.claim_version = claim.version;
        Self { job, claim }
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

/// Ids of jobs this instance is currently archiving.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Returns false if the id was already present.
    pub fn insert(&self, job_id: &str) -> bool {
        self.0
            .lock()
            .map(|mut set| set.insert(job_id.to_string()))
            .unwrap_or(false)
    }

    pub fn remove(&self, job_id: &str) {
        if let Ok(mut set) = self.0.lock() {
            set.remove(job_id);
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.0
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct FindReport {
    pub claimed: Vec<ClaimedJob>,
    pub held: usize,
    pub lost: usize,
    pub in_flight: usize,
    pub errors: usize,
}

/// Discovers finished, unarchived jobs and claims them.
pub struct Finder {
    directory: Arc<dyn JobDirectory>,
    claims: Arc<dyn ClaimStore>,
    identity: String,
    owner: Option<String>,
    takeover: Duration,
    in_flight: InFlight,
    capacity: usize,
}

impl Finder {
    pub fn new(
        directory: Arc<dyn JobDirectory>,
        claims: Arc<dyn ClaimStore>,
        identity: &str,
        takeover: Duration,
        in_flight: InFlight,
    ) -> Self {
        Self {
            directory,
            claims,
            identity: identity.to_string(),
            owner: None,
            takeover,
            in_flight,
            capacity: usize::MAX,
        }
    }

    /// Cap the number of jobs in flight. A round claims only what fits.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn filter(&self) -> JobFilter {
        JobFilter::done()
            .owner(self.owner.as_deref())
            .archived(false)
    }

    /// One discovery round. Returns the jobs claimed this round; they are
    /// registered as in flight and must be removed once archived.
    ///
    /// A listing error ends the round early but keeps the claims already won.
    /// Nothing is claimed beyond the free capacity, so a claimed job never
    /// sits in a queue long enough for its claim to go stale.
    pub async fn find_and_claim(&self, now: DateTime<Utc>) -> Result<FindReport> {
        let mut report = FindReport::default();
        let budget = self.capacity.saturating_sub(self.in_flight.len());
        if budget == 0 {
            tracing::trace!(in_flight = self.in_flight.len(), "No free capacity, skipping round");
            return Ok(report);
        }
        let mut jobs = self.directory.list_jobs(&self.filter()).await?;

        while let Some(job) = jobs.next().await {
            if report.claimed.len() >= budget {
                break;
            }
            let job = match job {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(error = %e, "Job listing ended early");
                    report.errors += 1;
                    break;
                }
            };

            if self.in_flight.contains(&job.job_id) {
                report.in_flight += 1;
                continue;
            }
            // Cheap pre-check on the listed record before touching the claim store.
            let listed = job.claim();
            if let Some(holder) = &listed.holder {
                if !listed.is_expired(now, self.takeover) {
                    tracing::trace!(job_id = %job.job_id, holder = %holder, "Job claimed elsewhere");
                    report.held += 1;
                    continue;
                }
            }

            match try_claim(
                self.claims.as_ref(),
                &job.job_id,
                &self.identity,
                self.takeover,
                now,
            )
            .await
            {
                Ok(ClaimOutcome::Claimed(claim)) => {
                    if self.in_flight.insert(&job.job_id) {
                        tracing::info!(job_id = %job.job_id, version = claim.version, "Claimed job");
                        report.claimed.push(ClaimedJob::new(job, claim));
                    }
                }
                Ok(ClaimOutcome::Held { .. }) => report.held += 1,
                Ok(ClaimOutcome::Lost) => report.lost += 1,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(job_id = %job.job_id, "Job vanished before claim");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.job_id, error = %e, "Unable to claim job");
                    report.errors += 1;
                }
            }
        }

        tracing::debug!(
            claimed = report.claimed.len(),
            held = report.held,
            lost = report.lost,
            "Find round complete"
        );
        Ok(report)
    }
}
