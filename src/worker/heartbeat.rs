use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::directory::{Claim, ClaimStore};
use crate::error::Result;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Renews a job claim while the job is being archived.
///
/// The first renewal is awaited by [`start`](Heartbeater::start), so a claim
/// that went stale before archival began is reported to the caller. Later
/// renewals run once per interval in the background. Each renewal is a
/// compare-and-swap from the last version written, tried up to `retries`
/// times. Once running, a failed renewal or a lost claim stops the
/// heartbeat without escalating and the claim is left to go stale.
pub struct Heartbeater {
    job_id: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<u64>>,
}

impl Heartbeater {
    /// Renew once, then keep renewing in the background.
    ///
    /// Fails with the renewal error if the claim was taken over, the job is
    /// gone, or every attempt failed.
    pub async fn start(
        store: Arc<dyn ClaimStore>,
        claim: &Claim,
        identity: &str,
        interval: Duration,
        retries: u32,
    ) -> Result<Self> {
        let first = renew(store.as_ref(), &claim.job_id, identity, claim.version, retries).await?;
        let cancel = CancellationToken::new();
        let job_id = claim.job_id.clone();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let job_id = job_id.clone();
            let identity = identity.to_string();
            async move {
                let renewals = beat(
                    store.as_ref(),
                    &job_id,
                    &identity,
                    first.version,
                    interval,
                    retries,
                    cancel,
                )
                .await;
                renewals + 1
            }
        });

        Ok(Self {
            job_id,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the timer and wait for any renewal in progress.
    ///
    /// No renewal is issued after this returns. Returns how many renewals
    /// succeeded.
    pub async fn stop(mut self) -> u64 {
        self.cancel.cancel();
        let renewals = match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        };
        tracing::debug!(job_id = %self.job_id, renewals, "Heartbeat stopped");
        renewals
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn beat(
    store: &dyn ClaimStore,
    job_id: &str,
    identity: &str,
    mut version: u64,
    interval: Duration,
    retries: u32,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut renewals = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match renew(store, job_id, identity, version, retries).await {
            Ok(claim) => {
                version = claim.version;
                renewals += 1;
            }
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Heartbeat gave up, claim will go stale");
                break;
            }
        }
    }

    renewals
}

async fn renew(
    store: &dyn ClaimStore,
    job_id: &str,
    identity: &str,
    version: u64,
    retries: u32,
) -> Result<Claim> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.put_claim(job_id, Some(identity), version).await {
            Ok(claim) => return Ok(claim),
            Err(e) if e.is_claim_conflict() || e.is_not_found() => return Err(e),
            Err(e) if attempt >= retries.max(1) => return Err(e),
            Err(e) => {
                tracing::trace!(job_id, attempt, error = %e, "Heartbeat attempt failed");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::directory::{Job, JobDirectory, MemoryDirectory};
    use crate::error::ArchiverError;

    /// Claim store whose writes fail while `failures` is above zero.
    struct FlakyClaims {
        inner: Arc<MemoryDirectory>,
        failures: AtomicU32,
    }

    impl FlakyClaims {
        fn fail_next(&self, n: u32) {
            self.failures.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ClaimStore for FlakyClaims {
        async fn get_claim(&self, job_id: &str) -> Result<Claim> {
            self.inner.get_claim(job_id).await
        }

        async fn put_claim(
            &self,
            job_id: &str,
            holder: Option<&str>,
            expected_version: u64,
        ) -> Result<Claim> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ArchiverError::Directory("connection reset".to_string()));
            }
            self.inner.put_claim(job_id, holder, expected_version).await
        }
    }

    async fn flaky() -> (Arc<FlakyClaims>, Claim) {
        let (dir, claim) = claimed().await;
        let store = Arc::new(FlakyClaims {
            inner: dir,
            failures: AtomicU32::new(0),
        });
        (store, claim)
    }

    async fn claimed() -> (Arc<MemoryDirectory>, Claim) {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;
        let claim = dir.put_claim("J1", Some("a"), 0).await.unwrap();
        (dir, claim)
    }

    #[tokio::test]
    async fn renews_until_stopped() {
        let (dir, claim) = claimed().await;
        let heartbeat = Heartbeater::start(dir.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(heartbeat.is_running());
        let renewals = heartbeat.stop().await;
        assert!(renewals >= 2, "expected several renewals, got {renewals}");

        let after_stop = dir.get_claim("J1").await.unwrap();
        assert_eq!(after_stop.version, claim.version + renewals);
        assert!(after_stop.is_held_by("a"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(dir.get_claim("J1").await.unwrap().version, after_stop.version);
    }

    #[tokio::test]
    async fn stops_when_claim_is_taken_over() {
        let (dir, claim) = claimed().await;
        let heartbeat = Heartbeater::start(dir.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Retry until our write lands between two renewals.
        loop {
            let current = dir.get_claim("J1").await.unwrap();
            if dir.put_claim("J1", Some("b"), current.version).await.is_ok() {
                break;
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!heartbeat.is_running());
        assert!(dir.get_claim("J1").await.unwrap().is_held_by("b"));
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn stops_when_job_disappears() {
        let (dir, claim) = claimed().await;
        let heartbeat = Heartbeater::start(dir.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .unwrap();
        dir.delete_job("J1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!heartbeat.is_running());
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn start_fails_when_claim_already_taken_over() {
        let (dir, claim) = claimed().await;
        dir.put_claim("J1", Some("b"), claim.version).await.unwrap();

        let err = Heartbeater::start(dir.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .err()
            .unwrap();
        assert!(err.is_claim_conflict());
        assert!(dir.get_claim("J1").await.unwrap().is_held_by("b"));
    }

    #[tokio::test]
    async fn start_fails_when_job_is_gone() {
        let (dir, claim) = claimed().await;
        dir.delete_job("J1").await.unwrap();

        let err = Heartbeater::start(dir.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn start_retries_transient_errors() {
        let (store, claim) = flaky().await;
        store.fail_next(2);
        let heartbeat = Heartbeater::start(store.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .unwrap();
        assert!(store.get_claim("J1").await.unwrap().version > claim.version);
        heartbeat.stop().await;

        let (store, claim) = flaky().await;
        store.fail_next(3);
        let err = Heartbeater::start(store.clone(), &claim, "a", Duration::from_millis(10), 3)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ArchiverError::Directory(_)));
        assert_eq!(store.get_claim("J1").await.unwrap().version, claim.version);
    }

    #[tokio::test]
    async fn survives_fewer_failures_than_retries() {
        let (store, claim) = flaky().await;
        let heartbeat = Heartbeater::start(store.clone(), &claim, "a", Duration::from_millis(20), 3)
            .await
            .unwrap();
        store.fail_next(2);

        // Two failed attempts back off 100ms then 200ms before the third lands.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(heartbeat.is_running());
        let before = store.get_claim("J1").await.unwrap().version;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get_claim("J1").await.unwrap().version > before);
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn stops_after_retries_exhausted() {
        let (store, claim) = flaky().await;
        let heartbeat = Heartbeater::start(store.clone(), &claim, "a", Duration::from_millis(20), 3)
            .await
            .unwrap();
        store.fail_next(3);

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(!heartbeat.is_running());
        let stale = store.get_claim("J1").await.unwrap();
        assert!(stale.is_held_by("a"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get_claim("J1").await.unwrap().version, stale.version);
        heartbeat.stop().await;
    }
}
