//! Bounded-concurrency execution of deferred jobs.
//!
//! [`JobQueue`] runs caller-supplied jobs with a fixed parallelism bound.
//! Jobs start in submission order, but completions are raced, so one slow job
//! never holds back the slot its siblings could use. Results of successful
//! jobs are fanned out to registered callbacks in completion order, failures
//! go to a separate set of observers, and [`JobQueue::wait`] suspends until
//! nothing is queued or running.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// A deferred, argumentless unit of work.
///
/// While a job sits in the queue it is deduplicated by identity
/// ([`Arc::ptr_eq`]), so the same value can be submitted repeatedly without
/// running twice. Once it starts, it no longer counts as queued and a
/// resubmission schedules a fresh run.
pub type Job<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Builds a [`Job`] from an async closure.
pub fn job<T, F, Fut>(f: F) -> Job<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

type FinishedCallback<T> = Box<dyn Fn(&T) + Send + Sync>;
type FailedCallback = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

/// The two phases of the driver loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// No driver task is running.
    Idle,
    /// A driver task is draining the queue.
    Running,
}

struct QueueState<T> {
    pending: VecDeque<Job<T>>,
    phase: Phase,
}

struct QueueInner<T> {
    parallel: usize,
    state: Mutex<QueueState<T>>,
    on_finished: Mutex<Vec<FinishedCallback<T>>>,
    on_failed: Mutex<Vec<FailedCallback>>,
    /// Queued plus in-flight jobs; [`JobQueue::wait`] blocks on this
    /// reaching zero.
    outstanding: watch::Sender<usize>,
    /// Wakes the driver when new work arrives while all slots are taken.
    wakeup: Notify,
}

/// A queue of deferred jobs, drained with bounded parallelism.
///
/// Cheap to clone; clones share the same queue.
pub struct JobQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> JobQueue<T> {
    /// Creates a queue running at most `parallel` jobs at once.
    ///
    /// A bound of zero could never make progress and is clamped to one.
    pub fn new(parallel: usize) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                parallel: parallel.max(1),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    phase: Phase::Idle,
                }),
                on_finished: Mutex::new(Vec::new()),
                on_failed: Mutex::new(Vec::new()),
                outstanding,
                wakeup: Notify::new(),
            }),
        }
    }

    /// Enqueues jobs, skipping any that are already queued.
    ///
    /// Starts the driver if none is running. Must be called within a Tokio
    /// runtime.
    pub fn add<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job<T>>,
    {
        let mut state = self.inner.state.lock().unwrap();
        for job in jobs {
            if state.pending.iter().any(|queued| Arc::ptr_eq(queued, &job)) {
                continue;
            }
            state.pending.push_back(job);
            self.inner.outstanding.send_modify(|n| *n += 1);
        }

        if state.phase == Phase::Idle && !state.pending.is_empty() {
            state.phase = Phase::Running;
            tokio::spawn(Self::run(Arc::clone(&self.inner)));
        }
        drop(state);

        self.inner.wakeup.notify_one();
    }

    /// Number of jobs queued but not yet started.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Registers a callback receiving every successful result, in completion
    /// order.
    ///
    /// Callbacks run on the driver task and should return quickly.
    pub fn on_job_finished(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        self.inner.on_finished.lock().unwrap().push(Box::new(callback));
    }

    /// Registers an observer for failed jobs. Panicking jobs are reported
    /// here as well.
    pub fn on_job_failed(&self, callback: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        self.inner.on_failed.lock().unwrap().push(Box::new(callback));
    }

    /// Suspends until no job is queued or in flight.
    ///
    /// Returns immediately on an idle queue. Work added while waiting extends
    /// the wait.
    pub async fn wait(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = outstanding.wait_for(|&n| n == 0).await;
    }

    async fn run(inner: Arc<QueueInner<T>>) {
        let mut in_flight: FuturesUnordered<JoinHandle<anyhow::Result<T>>> =
            FuturesUnordered::new();

        loop {
            // Fill free slots in submission order.
            while in_flight.len() < inner.parallel {
                let Some(job) = inner.state.lock().unwrap().pending.pop_front() else {
                    break;
                };
                in_flight.push(tokio::spawn(job()));
            }

            if in_flight.is_empty() {
                let mut state = inner.state.lock().unwrap();
                if state.pending.is_empty() {
                    state.phase = Phase::Idle;
                    return;
                }
                continue;
            }

            tokio::select! {
                completed = in_flight.next() => {
                    match completed {
                        Some(Ok(Ok(result))) => {
                            for callback in inner.on_finished.lock().unwrap().iter() {
                                callback(&result);
                            }
                        }
                        Some(Ok(Err(error))) => Self::report_failure(&inner, &error),
                        Some(Err(join_error)) => {
                            let error = anyhow::anyhow!("job panicked: {join_error}");
                            Self::report_failure(&inner, &error);
                        }
                        None => continue,
                    }
                    inner.outstanding.send_modify(|n| *n -= 1);
                }
                _ = inner.wakeup.notified() => {}
            }
        }
    }

    fn report_failure(inner: &QueueInner<T>, error: &anyhow::Error) {
        tracing::warn!(error = format!("{error:#}"), "job failed");
        for callback in inner.on_failed.lock().unwrap().iter() {
            callback(error);
        }
    }
}
