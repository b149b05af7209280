use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::directory::{
    Claim, ClaimStore, Job, JobDirectory, JobFilter, RecordStream, ResultStream, StreamEntry,
};
use crate::error::{ArchiverError, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<String, Job>,
    streams: HashMap<(String, ResultStream), Vec<(u64, String)>>,
    failing_streams: HashSet<ResultStream>,
    overstated_by: u64,
}

/// In-process job directory with embedded claims.
///
/// Pages after the first carry the marker record again in addition to
/// `page_size` new records, matching directories that resume inclusively.
#[derive(Debug)]
pub struct MemoryDirectory {
    state: RwLock<MemoryState>,
    page_size: usize,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            page_size: page_size.max(1),
        }
    }

    /// Insert or replace a job record.
    pub async fn insert_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.job_id.clone(), job);
    }

    /// Append records to a job's result stream, assigning increasing ids.
    pub async fn append_records<I, S>(&self, job_id: &str, stream: ResultStream, payloads: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write().await;
        let records = state
            .streams
            .entry((job_id.to_string(), stream))
            .or_default();
        for payload in payloads {
            let id = records.last().map(|(id, _)| id + 1).unwrap_or(1);
            records.push((id, payload.into()));
        }
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.jobs.is_empty()
    }

    /// Make every fetch of `stream` fail.
    pub async fn fail_stream(&self, stream: ResultStream) {
        self.state.write().await.failing_streams.insert(stream);
    }

    /// Report stream counts `extra` higher than what is delivered.
    pub async fn overstate_counts(&self, extra: u64) {
        self.state.write().await.overstated_by = extra;
    }
}

#[async_trait]
impl JobDirectory for MemoryDirectory {
    async fn list_jobs(&self, filter: &JobFilter) -> Result<RecordStream<Job>> {
        let state = self.state.read().await;
        let jobs: Vec<Result<Job>> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(jobs)))
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Job> {
        self.job(job_id)
            .await
            .ok_or_else(|| ArchiverError::JobNotFound(job_id.to_string()))
    }

    async fn fetch_stream(
        &self,
        job_id: &str,
        stream: ResultStream,
        marker: Option<u64>,
    ) -> Result<RecordStream<StreamEntry>> {
        let state = self.state.read().await;
        if !state.jobs.contains_key(job_id) {
            return Err(ArchiverError::JobNotFound(job_id.to_string()));
        }
        if state.failing_streams.contains(&stream) {
            return Err(ArchiverError::Directory(format!(
                "fetch of {} for {} failed",
                stream, job_id
            )));
        }

        let empty = Vec::new();
        let records = state
            .streams
            .get(&(job_id.to_string(), stream))
            .unwrap_or(&empty);

        let page: Vec<Result<StreamEntry>> = match marker {
            None => {
                let count = records.len() as u64 + state.overstated_by;
                records
                    .iter()
                    .take(self.page_size)
                    .map(|(id, payload)| {
                        Ok(StreamEntry {
                            id: *id,
                            payload: payload.clone(),
                            count: Some(count),
                        })
                    })
                    .collect()
            }
            Some(marker) => {
                let start = records.partition_point(|(id, _)| *id < marker);
                let redelivered = records.get(start).is_some_and(|(id, _)| *id == marker);
                records[start..]
                    .iter()
                    .take(self.page_size + usize::from(redelivered))
                    .map(|(id, payload)| {
                        Ok(StreamEntry {
                            id: *id,
                            payload: payload.clone(),
                            count: None,
                        })
                    })
                    .collect()
            }
        };

        Ok(Box::pin(tokio_stream::iter(page)))
    }

    async fn archive_done(&self, job_id: &str) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ArchiverError::JobNotFound(job_id.to_string()))?;
        job.time_archive_done = Some(Utc::now());
        Ok(job.clone())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.jobs.remove(job_id);
        state.streams.retain(|(id, _), _| id != job_id);
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for MemoryDirectory {
    async fn get_claim(&self, job_id: &str) -> Result<Claim> {
        self.fetch_job(job_id).await.map(|job| job.claim())
    }

    async fn put_claim(
        &self,
        job_id: &str,
        holder: Option<&str>,
        expected_version: u64,
    ) -> Result<Claim> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ArchiverError::JobNotFound(job_id.to_string()))?;

        if job.claim_version != expected_version {
            return Err(ArchiverError::ClaimConflict {
                job_id: job_id.to_string(),
                expected: expected_version,
                actual: job.claim_version,
            });
        }

        job.wrasse = holder.map(str::to_string);
        if holder.is_some() {
            job.time_archive_started = Some(Utc::now());
        }
        job.claim_version += 1;
        Ok(job.claim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn collect(stream: RecordStream<StreamEntry>) -> Vec<StreamEntry> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn first_page_carries_count() {
        let dir = MemoryDirectory::with_page_size(2);
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;
        dir.append_records("J1", ResultStream::Inputs, ["a", "b", "c"])
            .await;

        let page = collect(dir.fetch_stream("J1", ResultStream::Inputs, None).await.unwrap()).await;
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|e| e.count == Some(3)));
        assert_eq!(page[0].id, 1);
        assert_eq!(page[1].payload, "b");
    }

    #[tokio::test]
    async fn later_pages_redeliver_the_marker() {
        let dir = MemoryDirectory::with_page_size(2);
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;
        dir.append_records("J1", ResultStream::Inputs, ["a", "b", "c", "d", "e"])
            .await;

        let page = collect(
            dir.fetch_stream("J1", ResultStream::Inputs, Some(2))
                .await
                .unwrap(),
        )
        .await;
        let ids: Vec<u64> = page.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(page.iter().all(|e| e.count.is_none()));
    }

    #[tokio::test]
    async fn put_claim_is_compare_and_swap() {
        let dir = MemoryDirectory::new();
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;

        let claim = dir.put_claim("J1", Some("a"), 0).await.unwrap();
        assert_eq!(claim.version, 1);
        assert!(claim.is_held_by("a"));
        assert!(claim.updated_at.is_some());

        let err = dir.put_claim("J1", Some("b"), 0).await.unwrap_err();
        assert!(err.is_claim_conflict());
        assert!(dir.get_claim("J1").await.unwrap().is_held_by("a"));
    }

    #[tokio::test]
    async fn clearing_a_claim_keeps_its_stamp() {
        let dir = MemoryDirectory::new();
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;
        let claimed = dir.put_claim("J1", Some("a"), 0).await.unwrap();

        let cleared = dir.put_claim("J1", None, claimed.version).await.unwrap();
        assert!(cleared.holder.is_none());
        assert_eq!(cleared.updated_at, claimed.updated_at);
        assert_eq!(cleared.version, 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = MemoryDirectory::new();
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;
        dir.delete_job("J1").await.unwrap();
        dir.delete_job("J1").await.unwrap();
        assert!(dir.is_empty().await);
        assert!(dir.fetch_job("J1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_respects_filter_and_limit() {
        let dir = MemoryDirectory::new();
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await;
        dir.insert_job(Job::new("J2", "U1", "u1").done()).await;
        dir.insert_job(Job::new("J3", "U1", "u1")).await;

        let jobs: Vec<Job> = dir
            .list_jobs(&JobFilter::done())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(jobs.len(), 2);

        let limited: Vec<Job> = dir
            .list_jobs(&JobFilter::done().limit(1))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(limited.len(), 1);
    }
}
