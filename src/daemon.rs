use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::directory::{ClaimStore, JobDirectory};
use crate::error::Result;
use crate::identity::IdentityService;
use crate::scheduler::{
    ClaimedJob, CleanupSweeper, Finder, InFlight, QueueSnapshot, TakeoverSweeper, WorkQueue,
};
use crate::status::{run_status_server, ArchiverStats, StatusState};
use crate::worker::{Archiver, ArchiverSettings};

/// External collaborators the daemon talks to.
#[derive(Clone)]
pub struct Services {
    pub directory: Arc<dyn JobDirectory>,
    pub claims: Arc<dyn ClaimStore>,
    pub store: Arc<dyn crate::store::ObjectStore>,
    pub identity: Arc<dyn IdentityService>,
}

/// One archiver instance.
pub struct Daemon {
    config: Arc<DaemonConfig>,
    services: Services,
    stats: Arc<ArchiverStats>,
    in_flight: InFlight,
}

impl Daemon {
    pub fn new(config: DaemonConfig, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services,
            stats: Arc::new(ArchiverStats::default()),
            in_flight: InFlight::default(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ArchiverStats> {
        self.stats.clone()
    }

    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    pub fn finder(&self) -> Finder {
        Finder::new(
            self.services.directory.clone(),
            self.services.claims.clone(),
            &self.config.identity,
            self.config.takeover_time(),
            self.in_flight.clone(),
        )
        .with_owner(self.config.job_owner.clone())
        .with_capacity(self.config.queue_limit)
    }

    pub fn takeover_sweeper(&self) -> TakeoverSweeper {
        TakeoverSweeper::new(
            self.services.directory.clone(),
            self.services.claims.clone(),
            &self.config.identity,
            self.config.takeover_time(),
            self.config.linger_time(),
        )
        .with_owner(self.config.job_owner.clone())
        .with_limit(self.config.queue_limit)
    }

    pub fn cleanup_sweeper(&self) -> CleanupSweeper {
        CleanupSweeper::new(
            self.services.directory.clone(),
            &self.config.identity,
            self.config.linger_time(),
        )
        .with_owner(self.config.job_owner.clone())
        .with_limit(self.config.queue_limit)
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::new(
            &self.config.identity,
            self.services.directory.clone(),
            self.services.claims.clone(),
            self.services.store.clone(),
            self.services.identity.clone(),
            ArchiverSettings::from(self.config.as_ref()),
        )
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Starts the find, takeover and cleanup loops plus the optional status
    /// server. Each loop repeats every poll interval whether or not its last
    /// round failed. On shutdown the loops stop, the archive queue is closed
    /// and the jobs already dispatched are allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<QueueSnapshot> {
        tracing::info!(
            identity = %self.config.identity,
            owner = ?self.config.job_owner,
            poll_ms = self.config.poll_interval_ms,
            takeover_ms = self.config.takeover_time_ms,
            linger_ms = self.config.linger_time_ms,
            "Starting archiver"
        );

        let archiver = Arc::new(self.archiver());
        let queue = WorkQueue::new("archive", self.config.queue_limit, {
            let in_flight = self.in_flight.clone();
            let stats = self.stats.clone();
            move |claimed: ClaimedJob| {
                let archiver = archiver.clone();
                let in_flight = in_flight.clone();
                let stats = stats.clone();
                async move {
                    let job_id = claimed.job_id().to_string();
                    let result = archiver.archive(claimed).await;
                    in_flight.remove(&job_id);
                    match result {
                        Ok(_) => {
                            ArchiverStats::add(&stats.archived, 1);
                            Ok(())
                        }
                        Err(e) => {
                            ArchiverStats::add(&stats.failed, 1);
                            Err(e)
                        }
                    }
                }
            }
        });

        let mut tasks = JoinSet::new();

        if let Some(addr) = self.config.status_addr {
            let state = StatusState {
                config: self.config.clone(),
                stats: self.stats.clone(),
                queue: queue.stats(),
                in_flight: self.in_flight.clone(),
            };
            tasks.spawn(run_status_server(addr, state, shutdown.clone()));
        }

        let interval = self.config.poll_interval();

        let takeover = Arc::new(self.takeover_sweeper());
        let stats = self.stats.clone();
        tasks.spawn(poll_loop("takeover", interval, shutdown.clone(), move || {
            let takeover = takeover.clone();
            let stats = stats.clone();
            async move {
                match takeover.sweep(Utc::now()).await {
                    Ok(report) => {
                        let moved = (report.released + report.reclaimed) as u64;
                        ArchiverStats::add(&stats.takeovers, moved);
                    }
                    Err(e) => tracing::warn!(error = %e, "Takeover sweep failed"),
                }
            }
        }));

        let cleanup = Arc::new(self.cleanup_sweeper());
        let stats = self.stats.clone();
        tasks.spawn(poll_loop("cleanup", interval, shutdown.clone(), move || {
            let cleanup = cleanup.clone();
            let stats = stats.clone();
            async move {
                match cleanup.sweep(Utc::now()).await {
                    Ok(report) => ArchiverStats::add(&stats.cleanups, report.deleted as u64),
                    Err(e) => tracing::warn!(error = %e, "Cleanup sweep failed"),
                }
            }
        }));

        // The find loop runs here since it feeds the queue this task owns.
        let finder = self.finder();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.find_round(&finder, &queue).await,
            }
        }

        tracing::info!(in_flight = self.in_flight.len(), "Shutting down, draining archive queue");
        let snapshot = queue.drained().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Daemon task panicked");
            }
        }
        tracing::info!(
            completed = snapshot.completed,
            failed = snapshot.failed,
            "Archiver stopped"
        );
        Ok(snapshot)
    }

    async fn find_round(&self, finder: &Finder, queue: &WorkQueue<ClaimedJob>) {
        let report = match finder.find_and_claim(Utc::now()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Find round failed");
                return;
            }
        };

        ArchiverStats::add(&self.stats.claims_won, report.claimed.len() as u64);
        ArchiverStats::add(&self.stats.claims_lost, report.lost as u64);
        for claimed in report.claimed {
            let job_id = claimed.job_id().to_string();
            if let Err(e) = queue.push(claimed) {
                // Claim stays put and goes stale; takeover recovers it.
                tracing::warn!(job_id = %job_id, error = %e, "Unable to dispatch claimed job");
                self.in_flight.remove(&job_id);
            }
        }
    }
}

/// Call `round` every `interval` until `shutdown` fires.
async fn poll_loop<F, Fut>(name: &'static str, interval: Duration, shutdown: CancellationToken, mut round: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => round().await,
        }
    }
    tracing::debug!(loop_name = name, "Poll loop stopped");
}
