use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::directory::{
    Claim, ClaimFilter, ClaimStore, Job, JobDirectory, JobFilter, RecordStream, ResultStream,
    StreamEntry,
};
use crate::error::{ArchiverError, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  state TEXT NOT NULL,
  wrasse TEXT,
  time_archive_started_ms INTEGER,
  time_archive_done_ms INTEGER,
  claim_version INTEGER NOT NULL DEFAULT 0,
  time_created_ms INTEGER NOT NULL,
  body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
  job_id TEXT NOT NULL,
  stream TEXT NOT NULL,
  phase INTEGER NOT NULL,
  seq INTEGER NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (job_id, stream, phase, seq)
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_owner ON jobs(state, owner);
CREATE INDEX IF NOT EXISTS idx_jobs_wrasse ON jobs(wrasse);
"#;

const JOB_COLUMNS: &str =
    "body, wrasse, time_archive_started_ms, time_archive_done_ms, claim_version";

/// Job directory kept in a SQLite database.
///
/// Several daemons on one host can share the file; claim writes are
/// `UPDATE ... WHERE claim_version = ?` so concurrent claimers are
/// serialized by SQLite and exactly one of them sees its row change.
#[derive(Clone)]
pub struct SqliteDirectory {
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
}

impl SqliteDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| ArchiverError::Internal("sqlite connection poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ArchiverError::Internal(format!("sqlite task failed: {}", e)))?
    }

    /// Insert or replace a job record.
    pub async fn insert_job(&self, job: Job) -> Result<()> {
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&job)?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO jobs(job_id, owner, state, wrasse, time_archive_started_ms,
                    time_archive_done_ms, claim_version, time_created_ms, body)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    job.job_id,
                    job.owner,
                    job.state.to_string(),
                    job.wrasse,
                    job.time_archive_started.map(|t| t.timestamp_millis()),
                    job.time_archive_done.map(|t| t.timestamp_millis()),
                    job.claim_version as i64,
                    job.time_created.timestamp_millis(),
                    body
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Append records to a job's result stream, assigning increasing ids.
    pub async fn append_records(
        &self,
        job_id: &str,
        stream: ResultStream,
        payloads: Vec<String>,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let (name, phase) = stream_key(stream);
            let mut next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM records WHERE job_id = ?1 AND stream = ?2 AND phase = ?3",
                params![job_id, name, phase],
                |row| row.get(0),
            )?;
            for payload in payloads {
                next += 1;
                tx.execute(
                    "INSERT INTO records(job_id, stream, phase, seq, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![job_id, name, phase, next, payload],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn stream_key(stream: ResultStream) -> (&'static str, i64) {
    (stream.name(), stream.phase().map(|p| p as i64).unwrap_or(0))
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// The body holds the immutable record; claim columns are authoritative.
fn job_from_row(row: &Row<'_>) -> rusqlite::Result<(String, Option<String>, Option<i64>, Option<i64>, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_job(
    (body, wrasse, started_ms, done_ms, version): (String, Option<String>, Option<i64>, Option<i64>, i64),
) -> Result<Job> {
    let mut job: Job = serde_json::from_str(&body)?;
    job.wrasse = wrasse;
    job.time_archive_started = from_millis(started_ms);
    job.time_archive_done = from_millis(done_ms);
    job.claim_version = version as u64;
    Ok(job)
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Job> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS),
            params![job_id],
            job_from_row,
        )
        .optional()?;
    match row {
        Some(row) => decode_job(row),
        None => Err(ArchiverError::JobNotFound(job_id.to_string())),
    }
}

fn filter_clause(filter: &JobFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(owner) = &filter.owner {
        clauses.push("owner = ?");
        values.push(Value::Text(owner.clone()));
    }
    if let Some(state) = filter.state {
        clauses.push("state = ?");
        values.push(Value::Text(state.to_string()));
    }
    match filter.archived {
        Some(true) => clauses.push("time_archive_done_ms IS NOT NULL"),
        Some(false) => clauses.push("time_archive_done_ms IS NULL"),
        None => {}
    }
    match &filter.claim {
        ClaimFilter::Any => {}
        ClaimFilter::Unclaimed => clauses.push("wrasse IS NULL"),
        ClaimFilter::Claimed => clauses.push("wrasse IS NOT NULL"),
        ClaimFilter::HeldBy(id) => {
            clauses.push("wrasse = ?");
            values.push(Value::Text(id.clone()));
        }
        ClaimFilter::HeldByOther(id) => {
            clauses.push("wrasse IS NOT NULL AND wrasse != ?");
            values.push(Value::Text(id.clone()));
        }
    }
    if let Some(cutoff) = filter.archive_started_before {
        clauses.push("time_archive_started_ms <= ?");
        values.push(Value::Integer(cutoff.timestamp_millis()));
    }
    if let Some(cutoff) = filter.archived_before {
        clauses.push("time_archive_done_ms <= ?");
        values.push(Value::Integer(cutoff.timestamp_millis()));
    }

    let mut sql = format!("SELECT {} FROM jobs", JOB_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY time_created_ms, job_id");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(limit as i64));
    }
    (sql, values)
}

#[async_trait]
impl JobDirectory for SqliteDirectory {
    async fn list_jobs(&self, filter: &JobFilter) -> Result<RecordStream<Job>> {
        let (sql, values) = filter_clause(filter);
        let jobs = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values.iter()), job_from_row)?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row.map_err(ArchiverError::from).and_then(decode_job));
                }
                Ok(jobs)
            })
            .await?;
        Ok(Box::pin(tokio_stream::iter(jobs)))
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Job> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| load_job(conn, &job_id)).await
    }

    async fn fetch_stream(
        &self,
        job_id: &str,
        stream: ResultStream,
        marker: Option<u64>,
    ) -> Result<RecordStream<StreamEntry>> {
        let job_id = job_id.to_string();
        let page_size = self.page_size as i64;
        let entries = self
            .with_conn(move |conn| {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM jobs WHERE job_id = ?1",
                        params![job_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(ArchiverError::JobNotFound(job_id));
                }

                let (name, phase) = stream_key(stream);
                let count = match marker {
                    None => Some(conn.query_row(
                        "SELECT COUNT(*) FROM records WHERE job_id = ?1 AND stream = ?2 AND phase = ?3",
                        params![job_id, name, phase],
                        |row| row.get::<_, i64>(0),
                    )? as u64),
                    Some(_) => None,
                };
                // Resume inclusively: the marker record comes back on top of a full page.
                let (from, limit) = match marker {
                    None => (0, page_size),
                    Some(m) => (m as i64, page_size + 1),
                };

                let mut stmt = conn.prepare(
                    r#"
                    SELECT seq, payload FROM records
                    WHERE job_id = ?1 AND stream = ?2 AND phase = ?3 AND seq >= ?4
                    ORDER BY seq
                    LIMIT ?5
                    "#,
                )?;
                let rows = stmt.query_map(params![job_id, name, phase, from, limit], |row| {
                    Ok(StreamEntry {
                        id: row.get::<_, i64>(0)? as u64,
                        payload: row.get(1)?,
                        count,
                    })
                })?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row.map_err(ArchiverError::from));
                }
                Ok(entries)
            })
            .await?;
        Ok(Box::pin(tokio_stream::iter(entries)))
    }

    async fn archive_done(&self, job_id: &str) -> Result<Job> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET time_archive_done_ms = ?1 WHERE job_id = ?2",
                params![Utc::now().timestamp_millis(), job_id],
            )?;
            if changed == 0 {
                return Err(ArchiverError::JobNotFound(job_id));
            }
            load_job(conn, &job_id)
        })
        .await
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM records WHERE job_id = ?1", params![job_id])?;
            tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ClaimStore for SqliteDirectory {
    async fn get_claim(&self, job_id: &str) -> Result<Claim> {
        self.fetch_job(job_id).await.map(|job| job.claim())
    }

    async fn put_claim(
        &self,
        job_id: &str,
        holder: Option<&str>,
        expected_version: u64,
    ) -> Result<Claim> {
        let job_id = job_id.to_string();
        let holder = holder.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stamp = holder.as_ref().map(|_| Utc::now().timestamp_millis());
            let changed = tx.execute(
                r#"
                UPDATE jobs
                SET wrasse = ?1,
                    time_archive_started_ms = COALESCE(?2, time_archive_started_ms),
                    claim_version = claim_version + 1
                WHERE job_id = ?3 AND claim_version = ?4
                "#,
                params![holder, stamp, job_id, expected_version as i64],
            )?;

            if changed == 0 {
                let actual: Option<i64> = tx
                    .query_row(
                        "SELECT claim_version FROM jobs WHERE job_id = ?1",
                        params![job_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return match actual {
                    Some(actual) => Err(ArchiverError::ClaimConflict {
                        job_id,
                        expected: expected_version,
                        actual: actual as u64,
                    }),
                    None => Err(ArchiverError::JobNotFound(job_id)),
                };
            }

            let claim = load_job(&tx, &job_id)?.claim();
            tx.commit()?;
            Ok(claim)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn seeded() -> SqliteDirectory {
        let dir = SqliteDirectory::open_in_memory().unwrap().with_page_size(2);
        dir.insert_job(Job::new("J1", "U1", "u1").done()).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn round_trips_job_records() {
        let dir = seeded().await;
        let job = dir.fetch_job("J1").await.unwrap();
        assert_eq!(job.owner, "U1");
        assert!(job.wrasse.is_none());
        assert!(dir.fetch_job("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn claim_cas_and_conflict() {
        let dir = seeded().await;
        let claim = dir.put_claim("J1", Some("a"), 0).await.unwrap();
        assert_eq!(claim.version, 1);
        assert!(claim.is_held_by("a"));

        let err = dir.put_claim("J1", Some("b"), 0).await.unwrap_err();
        match err {
            ArchiverError::ClaimConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error {other}"),
        }

        let missing = dir.put_claim("J9", Some("a"), 0).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn filters_on_claim_columns() {
        let dir = seeded().await;
        dir.insert_job(Job::new("J2", "U1", "u1").done()).await.unwrap();
        dir.put_claim("J1", Some("a"), 0).await.unwrap();

        let held: Vec<Job> = dir
            .list_jobs(&JobFilter::done().claim(ClaimFilter::HeldByOther("b".into())))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].job_id, "J1");

        let unclaimed: Vec<Job> = dir
            .list_jobs(&JobFilter::done().claim(ClaimFilter::Unclaimed))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(unclaimed.len(), 1);
        assert_eq!(unclaimed[0].job_id, "J2");
    }

    #[tokio::test]
    async fn pages_redeliver_the_marker() {
        let dir = seeded().await;
        dir.append_records(
            "J1",
            ResultStream::Inputs,
            vec!["a".into(), "b".into(), "c".into()],
        )
        .await
        .unwrap();

        let first: Vec<StreamEntry> = dir
            .fetch_stream("J1", ResultStream::Inputs, None)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].count, Some(3));

        let second: Vec<StreamEntry> = dir
            .fetch_stream("J1", ResultStream::Inputs, Some(2))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        let ids: Vec<u64> = second.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn archive_done_and_delete() {
        let dir = seeded().await;
        let job = dir.archive_done("J1").await.unwrap();
        assert!(job.is_archived());

        dir.delete_job("J1").await.unwrap();
        dir.delete_job("J1").await.unwrap();
        assert!(dir.fetch_job("J1").await.unwrap_err().is_not_found());
    }
}
