//! Per-connection FIFO task queue.
//!
//! One queue exists per (connection key, belong id) pair and is the sole
//! ordering mechanism for writes and destroys against a socket handle:
//! tasks run strictly one at a time in submission order, so a destroy
//! submitted after the queue drained can never overtake a pending write.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, watch};

/// A task stuck longer than this is treated as failed; the owning belong id
/// is torn down by the caller. Bounds memory growth from a wedged logical
/// connection.
pub const REPLY_TASK_TIMEOUT: Duration = Duration::from_secs(120);

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task execution timed out")]
    Timeout,
    #[error("queue worker stopped")]
    Closed,
    #[error("task failed: {0}")]
    Task(anyhow::Error),
}

/// Completion handle for one submitted task.
pub struct TaskHandle {
    done: oneshot::Receiver<Result<(), QueueError>>,
}

impl TaskHandle {
    pub async fn wait(self) -> Result<(), QueueError> {
        self.done.await.map_err(|_| QueueError::Closed)?
    }
}

pub struct TaskQueue {
    tx: mpsc::UnboundedSender<BoxTask>,
    depth: Arc<watch::Sender<usize>>,
    task_timeout: Duration,
}

impl TaskQueue {
    pub fn new(task_timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxTask>();
        let (depth_tx, _) = watch::channel(0usize);
        let depth = Arc::new(depth_tx);

        let worker_depth = depth.clone();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
                worker_depth.send_modify(|d| *d = d.saturating_sub(1));
            }
        });

        Self { tx, depth, task_timeout }
    }

    /// Enqueues `fut` immediately; the returned handle resolves once the task
    /// has run. The task timeout starts when the task begins executing, not
    /// while it sits in the queue.
    pub fn submit<F>(&self, fut: F) -> TaskHandle
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let task_timeout = self.task_timeout;
        self.depth.send_modify(|d| *d += 1);

        let task: BoxTask = Box::pin(async move {
            let result = match tokio::time::timeout(task_timeout, fut).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(QueueError::Task(e)),
                Err(_) => Err(QueueError::Timeout),
            };
            done_tx.send(result).ok();
        });

        if self.tx.send(task).is_err() {
            self.depth.send_modify(|d| *d = d.saturating_sub(1));
        }
        TaskHandle { done: done_rx }
    }

    /// Submits `fut` and waits for it to complete.
    pub async fn run<F>(&self, fut: F) -> Result<(), QueueError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit(fut).wait().await
    }

    pub fn is_idle(&self) -> bool {
        *self.depth.borrow() == 0
    }

    /// Resolves once every queued task has completed. New tasks submitted
    /// after this resolves are not waited for.
    pub async fn wait_idle(&self) {
        let mut rx = self.depth.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(REPLY_TASK_TIMEOUT)
    }
}

/// Lazily created reply queues of one transport instance, keyed by belong
/// id. A queue appears on the first CONNECTION/MESSAGE for its belong id
/// and is removed only after the DESTROYED task has drained.
#[derive(Clone, Default)]
pub struct QueueMap {
    inner: Arc<parking_lot::RwLock<std::collections::HashMap<crate::BelongId, Arc<TaskQueue>>>>,
}

impl QueueMap {
    pub fn get_or_create(&self, belong_id: &crate::BelongId) -> Arc<TaskQueue> {
        if let Some(queue) = self.inner.read().get(belong_id) {
            return queue.clone();
        }
        self.inner.write().entry(belong_id.clone()).or_insert_with(|| Arc::new(TaskQueue::default())).clone()
    }

    pub fn get(&self, belong_id: &crate::BelongId) -> Option<Arc<TaskQueue>> {
        self.inner.read().get(belong_id).cloned()
    }

    pub fn remove(&self, belong_id: &crate::BelongId) {
        self.inner.write().remove(belong_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use test_log::test;

    #[test(tokio::test)]
    async fn tasks_run_in_submission_order() {
        let queue = TaskQueue::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..32u32 {
            let seen = seen.clone();
            handles.push(queue.submit(async move {
                // Later tasks finish faster; order must still hold.
                tokio::time::sleep(Duration::from_millis((32 - i) as u64 % 7)).await;
                seen.lock().push(i);
                Ok(())
            }));
        }
        for handle in handles {
            handle.wait().await.expect("task should pass");
        }
        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test(tokio::test)]
    async fn run_reports_task_failure() {
        let queue = TaskQueue::default();
        let res = queue.run(async { Err(anyhow::anyhow!("boom")) }).await;
        assert!(matches!(res, Err(QueueError::Task(_))));
    }

    #[test(tokio::test)]
    async fn stuck_task_times_out() {
        let queue = TaskQueue::new(Duration::from_millis(50));
        let res = queue
            .run(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(QueueError::Timeout)));
        queue.wait_idle().await;
        assert!(queue.is_idle());
    }

    #[test(tokio::test)]
    async fn wait_idle_flushes_pending_tasks() {
        let queue = TaskQueue::default();
        let counter = Arc::new(Mutex::new(0u32));

        for _ in 0..8 {
            let counter = counter.clone();
            queue.submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                *counter.lock() += 1;
                Ok(())
            });
        }

        queue.wait_idle().await;
        assert_eq!(*counter.lock(), 8);
        assert!(queue.is_idle());
    }
}
