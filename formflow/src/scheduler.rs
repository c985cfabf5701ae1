//! Bounded-concurrency task queue.
//!
//! Tasks are admitted in FIFO order and at most `max_concurrent` of them run at
//! the same time. A failing or panicking task is logged and swallowed so the
//! queue keeps draining; callers surface their own errors.

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures_signals::signal::{Mutable, Signal, SignalExt};
use shared::SchedulerStatus;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

/// How a queued task ended, as seen by whoever awaits its [`Completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked,
    /// Removed by [`Scheduler::clear`] before it started.
    Dropped,
}

struct QueuedTask {
    task: BoxFuture<'static, anyhow::Result<()>>,
    done: oneshot::Sender<TaskOutcome>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<QueuedTask>,
    running: usize,
}

struct SchedulerInner {
    name: &'static str,
    max_concurrent: usize,
    queue: Mutex<Queue>,
    status: Mutable<SchedulerStatus>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// `name` only shows up in log lines.
    pub fn new(name: &'static str, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                name,
                max_concurrent,
                queue: Mutex::new(Queue::default()),
                status: Mutable::new(SchedulerStatus {
                    queued: 0,
                    running: 0,
                    max_concurrent,
                }),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Enqueue a task. Must be called from within a tokio runtime.
    ///
    /// The returned [`Completion`] can be awaited or dropped; dropping it does
    /// not cancel the task.
    pub fn add<F>(&self, task: F) -> Completion
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        {
            let mut queue = self.lock();
            queue.pending.push_back(QueuedTask {
                task: task.boxed(),
                done,
            });
            self.publish(&queue);
        }
        self.pump();
        Completion { receiver }
    }

    /// Drops tasks that have not started yet. Running tasks are left alone.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.pending.len();
        queue.pending.clear();
        self.publish(&queue);
        if dropped > 0 {
            log::debug!("[scheduler:{}] cleared {} queued task(s)", self.inner.name, dropped);
        }
        dropped
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.get().is_running()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.status.get()
    }

    pub fn status_signal(&self) -> impl Signal<Item = SchedulerStatus> + use<> {
        self.inner.status.signal()
    }

    /// Resolves once nothing is queued and nothing is running.
    pub async fn wait_for_completion(&self) {
        self.inner
            .status
            .signal_ref(|status| status.is_running())
            .wait_for(false)
            .await;
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A poisoned queue still holds consistent counters: every mutation is
        // a single push/pop/increment.
        self.inner.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, queue: &Queue) {
        self.inner.status.set_neq(SchedulerStatus {
            queued: queue.pending.len(),
            running: queue.running,
            max_concurrent: self.inner.max_concurrent,
        });
    }

    fn pump(&self) {
        loop {
            let next = {
                let mut queue = self.lock();
                if queue.running >= self.inner.max_concurrent {
                    return;
                }
                let Some(next) = queue.pending.pop_front() else {
                    return;
                };
                queue.running += 1;
                self.publish(&queue);
                next
            };
            self.spawn(next);
        }
    }

    fn spawn(&self, queued: QueuedTask) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let QueuedTask { task, done } = queued;
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(error)) => {
                    log::error!("[scheduler:{}] task failed: {:#}", scheduler.inner.name, error);
                    TaskOutcome::Failed(format!("{:#}", error))
                }
                Err(_) => {
                    log::error!("[scheduler:{}] task panicked", scheduler.inner.name);
                    TaskOutcome::Panicked
                }
            };
            let _ = done.send(outcome);
            scheduler.finish();
        });
    }

    fn finish(&self) {
        {
            let mut queue = self.lock();
            queue.running = queue.running.saturating_sub(1);
            self.publish(&queue);
        }
        self.pump();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Resolves with the [`TaskOutcome`] of one queued task.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl Future for Completion {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(TaskOutcome::Dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_concurrent() {
        let scheduler = Scheduler::new("test", 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..10u64 {
            let running = running.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            scheduler.add(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(10 + i)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(scheduler.status().running, 3);
        assert_eq!(scheduler.status().queued, 7);

        scheduler.wait_for_completion().await;

        assert_eq!(finished.load(Ordering::SeqCst), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let scheduler = Scheduler::new("test", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            scheduler.add(async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        scheduler.wait_for_completion().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stall_queue() {
        let scheduler = Scheduler::new("test", 1);

        let failed = scheduler.add(async { Err::<(), _>(anyhow::anyhow!("boom")) });
        let panicked = scheduler.add(async {
            if true {
                panic!("handler panicked");
            }
            Ok(())
        });
        let completed = scheduler.add(async { Ok(()) });

        assert_eq!(failed.await, TaskOutcome::Failed("boom".to_string()));
        assert_eq!(panicked.await, TaskOutcome::Panicked);
        assert_eq!(completed.await, TaskOutcome::Completed);
        scheduler.wait_for_completion().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_only_queued_tasks() {
        let scheduler = Scheduler::new("test", 1);
        let ran = Arc::new(AtomicUsize::new(0));

        let first = scheduler.add({
            let ran = ran.clone();
            async move {
                sleep(Duration::from_millis(20)).await;
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let second = scheduler.add({
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(scheduler.clear(), 1);
        assert_eq!(second.await, TaskOutcome::Dropped);
        assert_eq!(first.await, TaskOutcome::Completed);
        scheduler.wait_for_completion().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_completion_when_idle() {
        let scheduler = Scheduler::new("test", 2);
        scheduler.wait_for_completion().await;
        assert_eq!(
            scheduler.status(),
            SchedulerStatus {
                queued: 0,
                running: 0,
                max_concurrent: 2
            }
        );
    }
}
