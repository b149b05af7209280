//! Shared fixtures for archiver integration tests.
//!
//! Builds in-memory job directories and object stores, seeds jobs with
//! result streams, and wires archivers and daemons against them.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use wrasse::config::DaemonConfig;
use wrasse::daemon::{Daemon, Services};
use wrasse::directory::{ClaimStore, Job, MemoryDirectory, ResultStream};
use wrasse::identity::StaticIdentity;
use wrasse::scheduler::{try_claim, ClaimOutcome, ClaimedJob};
use wrasse::store::{bytes_body, MemoryObjectStore, ObjectStore, PutOptions};
use wrasse::worker::{Archiver, ArchiverSettings};

/// Config with timings short enough for tests.
pub fn test_config(identity: &str, scratch: &TempDir) -> DaemonConfig {
    let mut config = DaemonConfig::new(identity).with_account("U1", "U1");
    config.poll_interval_ms = 20;
    config.heartbeat_interval_ms = 20;
    config.heartbeat_retries = 2;
    config.queue_limit = 4;
    config.scratch_dir = scratch.path().join(identity);
    config
}

/// One shared job directory and object store, as several instances see them.
pub struct TestEnv {
    pub directory: Arc<MemoryDirectory>,
    pub store: Arc<MemoryObjectStore>,
    pub scratch: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            directory: Arc::new(MemoryDirectory::with_page_size(page_size)),
            store: Arc::new(MemoryObjectStore::new()),
            scratch: tempfile::tempdir().expect("create scratch root"),
        }
    }

    pub fn config(&self, identity: &str) -> DaemonConfig {
        test_config(identity, &self.scratch)
    }

    pub fn services(&self, config: &DaemonConfig) -> Services {
        Services {
            directory: self.directory.clone(),
            claims: self.directory.clone(),
            store: self.store.clone(),
            identity: Arc::new(StaticIdentity::new(config.accounts.clone())),
        }
    }

    pub fn daemon(&self, identity: &str) -> Daemon {
        let config = self.config(identity);
        Daemon::new(config.clone(), self.services(&config))
    }

    pub fn archiver(&self, identity: &str) -> Archiver {
        let config = self.config(identity);
        let services = self.services(&config);
        Archiver::new(
            identity,
            services.directory,
            services.claims,
            services.store,
            services.identity,
            ArchiverSettings::from(&config),
        )
    }

    /// Insert a finished job for owner `U1` with the given inputs and
    /// outputs, and create its owner directory with a live marker.
    pub async fn seed_job(&self, job_id: &str, inputs: &[&str], outputs: &[&str]) {
        self.directory
            .insert_job(Job::new(job_id, "U1", "U1").done().with_token("tok"))
            .await;
        self.directory
            .append_records(job_id, ResultStream::Inputs, inputs.iter().copied())
            .await;
        self.directory
            .append_records(
                job_id,
                ResultStream::Outputs { phase: 0 },
                outputs.iter().copied(),
            )
            .await;

        let root = format!("/U1/jobs/{}", job_id);
        self.store.mkdir(&root).await.expect("mkdir job root");
        self.store
            .put(
                &format!("{}/live", root),
                bytes_body(Vec::new()),
                PutOptions::new("text/plain"),
            )
            .await
            .expect("put live marker");
    }

    /// Claim `job_id` for `identity` right now.
    pub async fn claim(&self, job_id: &str, identity: &str) -> ClaimedJob {
        let claims: &dyn ClaimStore = self.directory.as_ref();
        let outcome = try_claim(
            claims,
            job_id,
            identity,
            chrono::Duration::minutes(30),
            Utc::now(),
        )
        .await
        .expect("claim job");
        match outcome {
            ClaimOutcome::Claimed(claim) => {
                let job = self.directory.job(job_id).await.expect("job exists");
                ClaimedJob::new(job, claim)
            }
            other => panic!("unable to claim {}: {:?}", job_id, other),
        }
    }

    pub async fn object_lines(&self, path: &str) -> Vec<String> {
        self.store
            .get(path)
            .await
            .unwrap_or_else(|| panic!("missing object {}", path))
            .lines()
    }
}

/// Wait for a condition to become true, with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout_duration;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
    condition().await
}

pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
