//! Bounded executor for the asynchronous half of lifecycle operations.
//!
//! Request handlers answer as soon as admission succeeds and hand the slow
//! part (backend calls, store writes) to this queue. A fixed pool of workers
//! drains it, so a burst of requests queues up instead of fanning out into
//! unbounded concurrent backend calls.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, error};

use crate::error::{RunnerError, RunnerResult};

struct Task {
    name: &'static str,
    future: BoxFuture<'static, ()>,
}

#[derive(Debug, Default)]
struct Backlog {
    pending: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
    backlog: Arc<Backlog>,
}

impl TaskQueue {
    /// Start `workers` workers behind a queue holding at most `capacity`
    /// waiting tasks. Must be called inside a tokio runtime.
    pub fn start(capacity: usize, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>(capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let backlog = Arc::new(Backlog::default());

        for worker in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let backlog = Arc::clone(&backlog);
            tokio::spawn(async move {
                loop {
                    let task = receiver.lock().await.recv().await;
                    let Some(task) = task else { break };

                    debug!(worker, task = task.name, "running task");
                    if AssertUnwindSafe(task.future).catch_unwind().await.is_err() {
                        error!(worker, task = task.name, "task panicked");
                    }
                    backlog.finish();
                }
                debug!(worker, "task worker stopped");
            });
        }

        Self { sender, backlog }
    }

    /// Queue `future`, waiting for room if the queue is full.
    pub async fn submit<F>(&self, name: &'static str, future: F) -> RunnerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.backlog.pending.fetch_add(1, Ordering::SeqCst);
        let task = Task {
            name,
            future: future.boxed(),
        };
        if self.sender.send(task).await.is_err() {
            self.backlog.finish();
            return Err(RunnerError::QueueClosed);
        }
        Ok(())
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.backlog.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.backlog.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
