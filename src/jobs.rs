//! In-process job queues with id deduplication, delayed delivery and
//! bounded retry.
//!
//! Queue semantics:
//! - Enqueues with an id already queued or running collapse into the existing
//!   job, so work for one key is serialized.
//! - Delayed enqueue reserves the id immediately; the job becomes runnable
//!   after the delay (this is how resolve debounce works).
//! - A failing handler is retried with exponential backoff up to
//!   `max_attempts`; afterwards the job is dropped and logged.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, warn};

/// One runnable unit handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob<T> {
    pub id: String,
    pub payload: T,
    /// Zero-based attempt counter.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl<T> QueuedJob<T> {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

struct QueueState<T> {
    ready: VecDeque<QueuedJob<T>>,
    /// Ids currently queued, delayed or running.
    active_ids: HashSet<String>,
}

struct QueueInner<T> {
    name: &'static str,
    max_attempts: u32,
    base_backoff: Duration,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

/// Cloneable handle to a named in-process queue.
pub struct JobQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> JobQueue<T> {
    pub fn new(name: &'static str, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name,
                max_attempts: max_attempts.max(1),
                base_backoff,
                state: Mutex::new(QueueState {
                    ready: VecDeque::new(),
                    active_ids: HashSet::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueue a job. Returns false when an identical job id is already
    /// queued or running and the enqueue collapsed.
    pub fn enqueue(&self, id: impl Into<String>, payload: T) -> bool {
        let id = id.into();
        let mut state = self.inner.state.lock();
        if !state.active_ids.insert(id.clone()) {
            return false;
        }
        state.ready.push_back(QueuedJob {
            id,
            payload,
            attempt: 0,
            max_attempts: self.inner.max_attempts,
        });
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Enqueue with a delivery delay. The id is reserved immediately so
    /// further enqueues during the delay collapse.
    pub fn enqueue_delayed(&self, id: impl Into<String>, payload: T, delay: Duration) -> bool {
        let id = id.into();
        {
            let mut state = self.inner.state.lock();
            if !state.active_ids.insert(id.clone()) {
                return false;
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = inner.state.lock();
            state.ready.push_back(QueuedJob {
                id,
                payload,
                attempt: 0,
                max_attempts: inner.max_attempts,
            });
            drop(state);
            inner.notify.notify_one();
        });
        true
    }

    /// Number of jobs currently queued (not counting running ones).
    pub fn depth(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    async fn pop(&self) -> QueuedJob<T> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(job) = state.ready.pop_front() {
                    return job;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    fn release(&self, id: &str) {
        self.inner.state.lock().active_ids.remove(id);
    }

    fn schedule_retry(&self, job: QueuedJob<T>, delay: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = inner.state.lock();
            state.ready.push_back(job);
            drop(state);
            inner.notify.notify_one();
        });
    }

    /// Spawn `worker_count` workers running `handler`. Handler errors trigger
    /// queue-managed retries; the job id stays reserved across retries so
    /// duplicate enqueues keep collapsing.
    pub fn run_workers<F, Fut>(&self, worker_count: usize, handler: F)
    where
        F: Fn(QueuedJob<T>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        for worker in 0..worker_count.max(1) {
            let queue = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let job = queue.pop().await;
                    let job_id = job.id.clone();
                    let attempt = job.attempt;
                    let retry_payload = job.payload.clone();

                    match handler(job).await {
                        Ok(()) => queue.release(&job_id),
                        Err(e) => {
                            if attempt + 1 < queue.inner.max_attempts {
                                let delay = queue.inner.base_backoff * 2u32.pow(attempt);
                                warn!(
                                    queue = queue.inner.name,
                                    worker,
                                    job = %job_id,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %e,
                                    "job failed, scheduling retry"
                                );
                                queue.schedule_retry(
                                    QueuedJob {
                                        id: job_id,
                                        payload: retry_payload,
                                        attempt: attempt + 1,
                                        max_attempts: queue.inner.max_attempts,
                                    },
                                    delay,
                                );
                            } else {
                                error!(
                                    queue = queue.inner.name,
                                    worker,
                                    job = %job_id,
                                    attempt,
                                    error = %e,
                                    "job failed on final attempt, dropping"
                                );
                                queue.release(&job_id);
                            }
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_dedup_collapses_same_id() {
        let queue: JobQueue<u32> = JobQueue::new("test", 3, Duration::from_millis(1));
        assert!(queue.enqueue("job-1", 1));
        assert!(!queue.enqueue("job-1", 2));
        assert!(queue.enqueue("job-2", 3));
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_workers_drain_and_release_ids() {
        let queue: JobQueue<u32> = JobQueue::new("test", 3, Duration::from_millis(1));
        let seen = Arc::new(AtomicU32::new(0));

        let seen_handler = seen.clone();
        queue.run_workers(2, move |job| {
            let seen = seen_handler.clone();
            async move {
                seen.fetch_add(job.payload, Ordering::SeqCst);
                Ok(())
            }
        });

        queue.enqueue("a", 1);
        queue.enqueue("b", 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        // Ids must be reusable after completion.
        assert!(queue.enqueue("a", 4));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_retry_until_max_attempts() {
        let queue: JobQueue<u32> = JobQueue::new("test", 3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_handler = calls.clone();
        queue.run_workers(1, move |_job| {
            let calls = calls_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always fails")
            }
        });

        queue.enqueue("doomed", 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Dropped after the final attempt; the id is free again.
        assert!(queue.enqueue("doomed", 0));
    }

    #[tokio::test]
    async fn test_delayed_enqueue_reserves_id() {
        let queue: JobQueue<u32> = JobQueue::new("test", 3, Duration::from_millis(1));
        assert!(queue.enqueue_delayed("later", 1, Duration::from_millis(30)));
        assert!(!queue.enqueue("later", 2));
        assert_eq!(queue.depth(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.depth(), 1);
    }
}
