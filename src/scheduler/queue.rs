use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{ArchiverError, Result};

/// Counters shared between a queue and its observers.
#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pushed: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    fn started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn finished(&self, ok: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Bounded-concurrency dispatcher.
///
/// Items are started in push order, at most `limit` at a time; completion
/// order is whatever the workers make it. A failing item is logged and
/// counted and does not affect the others. After [`close`](Self::close) no
/// new items are accepted, and [`drained`](Self::drained) resolves once
/// everything already pushed has finished.
pub struct WorkQueue<T> {
    name: &'static str,
    tx: Option<mpsc::UnboundedSender<T>>,
    stats: Arc<QueueStats>,
    dispatcher: JoinHandle<()>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new<F, Fut>(name: &'static str, limit: usize, worker: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let worker = Arc::new(worker);
        let stats = Arc::new(QueueStats::default());

        let dispatcher = tokio::spawn({
            let stats = stats.clone();
            async move {
                let mut tasks = JoinSet::new();

                while let Some(item) = rx.recv().await {
                    while let Some(joined) = tasks.try_join_next() {
                        report_join(name, joined);
                    }

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let worker = worker.clone();
                    let stats = stats.clone();
                    stats.started();
                    tasks.spawn(async move {
                        let result = worker(item).await;
                        stats.finished(result.is_ok());
                        if let Err(e) = result {
                            tracing::error!(queue = name, error = %e, "Work item failed");
                        }
                        drop(permit);
                    });
                }

                while let Some(joined) = tasks.join_next().await {
                    report_join(name, joined);
                }
                tracing::debug!(queue = name, "Work queue drained");
            }
        });

        Self {
            name,
            tx: Some(tx),
            stats,
            dispatcher,
        }
    }

    pub fn push(&self, item: T) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ArchiverError::QueueClosed)?;
        tx.send(item).map_err(|_| ArchiverError::QueueClosed)?;
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting items. Already queued items still run.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            tracing::debug!(queue = self.name, "Work queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    /// Close the queue and wait for every pushed item to finish.
    pub async fn drained(mut self) -> QueueSnapshot {
        self.close();
        if let Err(e) = (&mut self.dispatcher).await {
            tracing::error!(queue = self.name, error = %e, "Work queue dispatcher failed");
        }
        self.stats.snapshot()
    }
}

fn report_join(name: &'static str, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(queue = name, error = %e, "Work item panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_item_and_drains() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = WorkQueue::new("test", 3, {
            let seen = seen.clone();
            move |n: u32| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(n);
                    Ok(())
                }
            }
        });
        for n in 0..20 {
            queue.push(n).unwrap();
        }
        let snapshot = queue.drained().await;

        assert_eq!(snapshot.pushed, 20);
        assert_eq!(snapshot.completed, 20);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.in_flight, 0);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue = WorkQueue::new("test", 4, {
            let active = active.clone();
            let peak = peak.clone();
            move |_: u32| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        for n in 0..32 {
            queue.push(n).unwrap();
        }
        let snapshot = queue.drained().await;

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(snapshot.peak_in_flight <= 4);
        assert_eq!(snapshot.completed, 32);
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_items() {
        let queue = WorkQueue::new("test", 2, |n: u32| async move {
            if n % 2 == 0 {
                Err(ArchiverError::Internal(format!("item {n}")))
            } else {
                Ok(())
            }
        });
        for n in 0..10 {
            queue.push(n).unwrap();
        }
        let snapshot = queue.drained().await;
        assert_eq!(snapshot.completed, 5);
        assert_eq!(snapshot.failed, 5);
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let mut queue = WorkQueue::new("test", 1, |_: u32| async { Ok(()) });
        queue.push(1).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(queue.push(2), Err(ArchiverError::QueueClosed)));
        let snapshot = queue.drained().await;
        assert_eq!(snapshot.pushed, 1);
        assert_eq!(snapshot.completed, 1);
    }

    #[tokio::test]
    async fn empty_queue_drains_immediately() {
        let queue = WorkQueue::new("test", 1, |_: u32| async { Ok(()) });
        let snapshot = queue.drained().await;
        assert_eq!(snapshot, QueueSnapshot::default());
    }
}
