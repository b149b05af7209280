//! Ownership-claim protocol.
//!
//! All claim writes are compare-and-swap against the version read just
//! before, so racing instances never both win. A lost race is an expected
//! outcome, reported as [`ClaimOutcome::Lost`] rather than an error.

use chrono::{DateTime, Duration, Utc};

use crate::directory::{Claim, ClaimStore};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This instance now holds the claim.
    Claimed(Claim),
    /// Someone holds a live claim.
    Held { holder: String },
    /// Another writer got there between our read and our write.
    Lost,
}

/// Claim a job for `identity` if it is unclaimed or its claim expired.
pub async fn try_claim(
    store: &dyn ClaimStore,
    job_id: &str,
    identity: &str,
    takeover: Duration,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome> {
    let current = store.get_claim(job_id).await?;
    if let Some(holder) = &current.holder {
        if !current.is_expired(now, takeover) {
            return Ok(ClaimOutcome::Held {
                holder: holder.clone(),
            });
        }
        tracing::debug!(job_id, holder = %holder, "Claim expired, taking over");
    }

    match store
        .put_claim(job_id, Some(identity), current.version)
        .await
    {
        Ok(claim) => Ok(ClaimOutcome::Claimed(claim)),
        Err(e) if e.is_claim_conflict() => {
            tracing::debug!(job_id, "Lost claim race");
            Ok(ClaimOutcome::Lost)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset(Claim),
    /// Claim is unowned, ours, or still live; nothing written.
    NotStale,
    Lost,
}

/// Move a stale claim held by someone other than `identity` to `new_holder`.
pub async fn reset_stale_claim(
    store: &dyn ClaimStore,
    job_id: &str,
    identity: &str,
    new_holder: Option<&str>,
    takeover: Duration,
    now: DateTime<Utc>,
) -> Result<ResetOutcome> {
    let current = store.get_claim(job_id).await?;
    let stale = current.holder.as_deref().is_some_and(|h| h != identity)
        && current.is_expired(now, takeover);
    if !stale {
        return Ok(ResetOutcome::NotStale);
    }

    match store.put_claim(job_id, new_holder, current.version).await {
        Ok(claim) => Ok(ResetOutcome::Reset(claim)),
        Err(e) if e.is_claim_conflict() => {
            tracing::debug!(job_id, "Lost claim reset race");
            Ok(ResetOutcome::Lost)
        }
        Err(e) => Err(e),
    }
}
