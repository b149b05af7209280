//! Job discovery, claim recovery and purging.
//!
//! - [`Finder`]: claims finished, unarchived jobs for this instance
//! - [`TakeoverSweeper`]: recovers jobs whose claim holder went quiet
//! - [`CleanupSweeper`]: purges job records once the linger time passed
//! - [`WorkQueue`]: bounded-concurrency dispatcher used by all of the above
//!   and by the archival pipeline

pub mod claim;
pub mod cleanup;
pub mod finder;
pub mod queue;
pub mod takeover;

use std::future::Future;

use tokio_stream::StreamExt;

use crate::directory::{Job, RecordStream};
use crate::error::Result;

pub use claim::{try_claim, ClaimOutcome};
pub use cleanup::{CleanupReport, CleanupSweeper};
pub use finder::{ClaimedJob, FindReport, Finder, InFlight};
pub use queue::{QueueSnapshot, QueueStats, WorkQueue};
pub use takeover::{TakeoverReport, TakeoverSweeper};

/// Run `worker` over every listed job through a bounded queue.
///
/// Jobs pushed before a listing error still run to completion; the listing
/// error is returned after the queue drains.
pub(crate) async fn sweep_jobs<F, Fut>(
    name: &'static str,
    limit: usize,
    mut jobs: RecordStream<Job>,
    worker: F,
) -> Result<QueueSnapshot>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let queue = WorkQueue::new(name, limit, worker);
    let mut listing = Ok(());

    while let Some(job) = jobs.next().await {
        match job {
            Ok(job) => queue.push(job)?,
            Err(e) => {
                listing = Err(e);
                break;
            }
        }
    }

    let snapshot = queue.drained().await;
    listing.map(|_| snapshot)
}
