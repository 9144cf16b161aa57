//! Bounded task queue shared by the producer and every executor of a run
//!
//! The fixed capacity caps memory and the number of calls in flight however
//! far an org fans out. Every blocking operation is bounded by a deadline and
//! aborts as soon as the run is cancelled.
//!
//! The queue also counts outstanding work. A successful push adds one, and
//! [`TaskQueue::task_done`] removes one once a popped task has been fully
//! handled. When the producer has finished and the count drops to zero the
//! queue is drained and idle consumers are released.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PopError, PushError};
use crate::task::Task;

pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
    capacity: usize,
    cancel: CancellationToken,
    outstanding: AtomicUsize,
    producer_done: AtomicBool,
    drained: CancellationToken,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` tasks, bound to the run's
    /// cancellation signal. A zero capacity is raised to one.
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            cancel,
            outstanding: AtomicUsize::new(0),
            producer_done: AtomicBool::new(false),
            drained: CancellationToken::new(),
        }
    }

    /// Enqueue, waiting as long as it takes for room. Only cancellation stops it.
    pub async fn push(&self, task: Task) -> Result<(), PushError> {
        self.send(task, None).await
    }

    /// Enqueue, giving up with [`PushError::Full`] once `wait` has elapsed
    pub async fn push_timeout(&self, task: Task, wait: Duration) -> Result<(), PushError> {
        self.send(task, Some(wait)).await
    }

    async fn send(&self, task: Task, wait: Option<Duration>) -> Result<(), PushError> {
        let reserve = async {
            match wait {
                Some(wait) => timeout(wait, self.tx.reserve()).await.ok(),
                None => Some(self.tx.reserve().await),
            }
        };

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PushError::Cancelled(task)),
            permit = reserve => permit,
        };

        match permit {
            Some(Ok(permit)) => {
                // Count before the task becomes visible so an ack can never
                // run ahead of it.
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                permit.send(task);
                Ok(())
            }
            // The receiver lives as long as the queue, so a closed channel
            // only happens while tearing down.
            Some(Err(_)) => Err(PushError::Cancelled(task)),
            None => Err(PushError::Full(task)),
        }
    }

    /// Dequeue the next task, waiting at most `idle`.
    ///
    /// Returns [`PopError::Drained`] once no work is outstanding, so consumers
    /// don't have to guess completion from a quiet queue.
    pub async fn pop(&self, idle: Duration) -> Result<Task, PopError> {
        if self.cancel.is_cancelled() {
            return Err(PopError::Cancelled);
        }

        let next = async { self.rx.lock().await.recv().await };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PopError::Cancelled),
            task = next => task.ok_or(PopError::Drained),
            _ = self.drained.cancelled() => Err(PopError::Drained),
            _ = sleep(idle) => Err(PopError::Idle),
        }
    }

    /// Acknowledge a popped task after it and anything it ran inline are done
    pub fn task_done(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "task_done called more often than tasks were queued");
        if previous == 1 && self.producer_done.load(Ordering::SeqCst) {
            self.mark_drained();
        }
    }

    /// The producer will push nothing more
    pub fn producer_finished(&self) {
        self.producer_done.store(true, Ordering::SeqCst);
        if self.outstanding.load(Ordering::SeqCst) == 0 {
            self.mark_drained();
        }
    }

    fn mark_drained(&self) {
        if !self.drained.is_cancelled() {
            debug!("task queue drained");
            self.drained.cancel();
        }
    }

    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tasks queued or being worked on
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Tasks currently sitting in the buffer
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Acknowledges one popped task when dropped, including when the executor
/// handling it unwinds from a panic.
pub struct TaskDone<'a> {
    queue: &'a TaskQueue,
}

impl<'a> TaskDone<'a> {
    pub fn new(queue: &'a TaskQueue) -> Self {
        Self { queue }
    }
}

impl Drop for TaskDone<'_> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("outstanding", &self.outstanding())
            .field("drained", &self.is_drained())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatformClient;
    use crate::task::SyncTarget;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Instant;

    fn task(repo: &str) -> Task {
        let target = Arc::new(SyncTarget::new(
            "gitee",
            vec!["OWNERS".to_string()],
            Arc::new(MockPlatformClient::new()),
        ));
        Task::list_branches(target, "o", repo)
    }

    #[tokio::test]
    async fn test_fifo_push_pop() {
        let queue = TaskQueue::new(4, CancellationToken::new());

        queue.push(task("a")).await.unwrap();
        queue.push(task("b")).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.outstanding(), 2);

        let first = queue.pop(Duration::from_millis(50)).await.unwrap();
        let second = queue.pop(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.repo(), Some("a"));
        assert_eq!(second.repo(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_timeout_on_full_queue_returns_task() {
        let queue = TaskQueue::new(1, CancellationToken::new());
        queue.push(task("a")).await.unwrap();

        let err = queue
            .push_timeout(task("b"), Duration::from_millis(10))
            .await
            .unwrap_err();

        assert_matches!(&err, PushError::Full(_));
        assert_eq!(err.into_task().repo(), Some("b"));
        assert_eq!(queue.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_pop_idle_then_drained() {
        let queue = TaskQueue::new(2, CancellationToken::new());

        assert_matches!(queue.pop(Duration::from_millis(10)).await, Err(PopError::Idle));

        queue.push(task("a")).await.unwrap();
        queue.producer_finished();
        assert!(!queue.is_drained());

        let popped = queue.pop(Duration::from_millis(10)).await;
        assert!(popped.is_ok());
        queue.task_done();

        assert!(queue.is_drained());
        assert_matches!(queue.pop(Duration::from_secs(5)).await, Err(PopError::Drained));
    }

    #[tokio::test]
    async fn test_producer_finished_with_nothing_queued_drains() {
        let queue = TaskQueue::new(2, CancellationToken::new());
        queue.producer_finished();
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn test_requeue_keeps_queue_undrained() {
        let queue = TaskQueue::new(2, CancellationToken::new());
        queue.push(task("a")).await.unwrap();
        queue.producer_finished();

        let popped = queue.pop(Duration::from_millis(10)).await.unwrap();
        queue
            .push_timeout(popped.retried(), Duration::from_millis(10))
            .await
            .unwrap();
        queue.task_done();

        assert!(!queue.is_drained());
        assert_eq!(queue.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_blocked_push_and_pop() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(TaskQueue::new(1, cancel.clone()));
        queue.push(task("a")).await.unwrap();

        let blocked_push = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(task("b")).await })
        };

        let empty = Arc::new(TaskQueue::new(1, cancel.clone()));
        let blocked_pop = {
            let empty = empty.clone();
            tokio::spawn(async move { empty.pop(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        cancel.cancel();

        assert_matches!(blocked_push.await.unwrap(), Err(PushError::Cancelled(_)));
        assert_matches!(blocked_pop.await.unwrap(), Err(PopError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_done_guard_acknowledges_on_panic() {
        let queue = Arc::new(TaskQueue::new(2, CancellationToken::new()));
        queue.push(task("a")).await.unwrap();
        queue.producer_finished();

        let popped = queue.pop(Duration::from_millis(50)).await.unwrap();
        let worker = queue.clone();
        let result = tokio::spawn(async move {
            let _done = TaskDone::new(&worker);
            panic!("client blew up on {}", popped);
        })
        .await;

        assert!(result.unwrap_err().is_panic());
        assert_eq!(queue.outstanding(), 0);
        assert!(queue.is_drained());
        assert_matches!(queue.pop(Duration::from_millis(50)).await, Err(PopError::Drained));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue = TaskQueue::new(0, CancellationToken::new());
        assert_eq!(queue.capacity(), 1);
    }
}
