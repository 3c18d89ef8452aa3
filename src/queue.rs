//! Keyed work queues driving the reconcile functions.
//!
//! Each queue has a single consumer. Enqueues of a key already waiting or
//! in flight collapse into one future processing, so a burst of events for
//! one object costs at most one extra reconcile. On shutdown the pending
//! set is drained before [`WorkQueue::get`] reports the end.

use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::keys::ObjectKey;

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    queue: VecDeque<ObjectKey>,
    dirty: BTreeSet<ObjectKey>,
    processing: BTreeSet<ObjectKey>,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: BTreeSet::new(),
                processing: BTreeSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn add(&self, key: ObjectKey) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            debug!("queue is shutting down, not enqueuing {key}");
            return;
        }
        if !inner.dirty.insert(key.clone()) {
            return; // already waiting
        }
        if inner.processing.contains(&key) {
            return; // will be requeued by done()
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Next key to process, or `None` once shut down and drained. The key
    /// stays marked in-flight until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &ObjectKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(key);
        // events observed while in flight collapse into one reprocessing
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().unwrap().shutting_down
    }

    /// Stops accepting new keys; pending keys are still handed out.
    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reconcile failure, split by what the worker should do about it.
#[derive(Debug)]
pub enum SyncError {
    /// Transient: requeue the key with backoff.
    Retry(eyre::Report),
    /// The controller cannot make progress; surface and stop.
    Fatal(eyre::Report),
}

pub type SyncResult = std::result::Result<(), SyncError>;

fn backoff_delay(failures: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(200);
    const MAX: Duration = Duration::from_secs(60);
    BASE.saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(MAX)
}

/// The queue's single consumer: pops keys, runs the reconcile function,
/// requeues transient failures with exponential per-key backoff and
/// surfaces only fatal ones. Returns cleanly when the queue drains after
/// shutdown.
pub async fn run_worker<F, Fut>(
    queue: Arc<WorkQueue>,
    name: &'static str,
    mut sync: F,
) -> eyre::Result<()>
where
    F: FnMut(ObjectKey) -> Fut,
    Fut: Future<Output = SyncResult>,
{
    let mut failures: BTreeMap<ObjectKey, u32> = BTreeMap::new();

    while let Some(key) = queue.get().await {
        debug!("{name}: syncing {key}");
        match sync(key.clone()).await {
            Ok(()) => {
                failures.remove(&key);
            }
            Err(SyncError::Retry(err)) => {
                let count = failures.entry(key.clone()).or_default();
                *count += 1;
                let delay = backoff_delay(*count);
                warn!("{name}: requeuing {key} in {delay:?} (failure {count}): {err:#}");

                let queue = queue.clone();
                let retry_key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.add(retry_key);
                });
            }
            Err(SyncError::Fatal(err)) => {
                queue.done(&key);
                return Err(err);
            }
        }
        queue.done(&key);
    }

    debug!("{name}: queue drained, worker stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[tokio::test]
    async fn test_dedup_while_in_flight() {
        let queue = WorkQueue::new();

        queue.add(key("a"));
        let got = queue.get().await.unwrap();
        assert_eq!(got, key("a"));

        // burst of updates while "a" is being processed
        for _ in 0..5 {
            queue.add(key("a"));
        }
        assert!(queue.is_empty());

        queue.done(&got);
        assert_eq!(queue.len(), 1);

        // exactly one reprocessing
        let again = queue.get().await.unwrap();
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dedup_while_waiting() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("b"));
        queue.shut_down();

        // refused after shutdown
        queue.add(key("c"));

        let a = queue.get().await.unwrap();
        queue.done(&a);
        let b = queue.get().await.unwrap();
        queue.done(&b);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_with_backoff() {
        let queue = Arc::new(WorkQueue::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let worker = {
            let queue = queue.clone();
            let mut attempts = 0u32;
            tokio::spawn(run_worker(queue, "test", move |key| {
                attempts += 1;
                let tx = tx.clone();
                let attempt = attempts;
                async move {
                    tx.send((key, attempt)).unwrap();
                    if attempt < 3 {
                        Err(SyncError::Retry(eyre::format_err!("transient")))
                    } else {
                        Ok(())
                    }
                }
            }))
        };

        queue.add(key("a"));
        for expected in 1..=3 {
            let (k, attempt) = rx.recv().await.unwrap();
            assert_eq!(k, key("a"));
            assert_eq!(attempt, expected);
        }

        queue.shut_down();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_on_fatal() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(run_worker(queue, "test", |_key| async {
                Err(SyncError::Fatal(eyre::format_err!("cannot continue")))
            }))
        };

        queue.add(key("a"));
        assert!(worker.await.unwrap().is_err());
    }
}
