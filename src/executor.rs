//! Task executor - pops tasks, calls the platform, expands results
//!
//! Every instance runs its own loop against the shared queue. Expanding a
//! task pushes its children with a short deadline; when the queue stays full
//! the child is run right here instead, so fan-out never outgrows the queue
//! and nothing is dropped. Failed tasks are requeued with a higher retry
//! count, or retried in place when the queue is full, until the retry
//! ceiling is reached.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PopError, PushError};
use crate::platform::BranchInfo;
use crate::queue::{TaskDone, TaskQueue};
use crate::run::{AbandonedTask, RunSettings, RunStats};
use crate::task::{RepoFilter, Task, TaskKind};

pub struct TaskExecutor {
    id: usize,
    queue: Arc<TaskQueue>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
    max_retries: u32,
    idle_timeout: Duration,
    push_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        id: usize,
        queue: Arc<TaskQueue>,
        stats: Arc<RunStats>,
        settings: &RunSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            stats,
            cancel,
            max_retries: settings.max_retries.max(1),
            idle_timeout: settings.idle_timeout,
            push_timeout: settings.push_timeout,
        }
    }

    /// Work until the queue is drained or the run is cancelled
    pub async fn run(self) {
        loop {
            match self.queue.pop(self.idle_timeout).await {
                Ok(task) => {
                    let _done = TaskDone::new(&self.queue);
                    self.execute(task).await;
                }
                Err(PopError::Idle) => {
                    debug!(
                        executor = self.id,
                        outstanding = self.queue.outstanding(),
                        "queue idle, waiting for outstanding tasks"
                    );
                }
                Err(PopError::Drained) => {
                    info!(executor = self.id, "executor exits");
                    break;
                }
                Err(PopError::Cancelled) => {
                    info!(executor = self.id, "executor exits on cancellation");
                    break;
                }
            }
        }
    }

    /// Run a task to completion: success, requeue, abandonment or
    /// cancellation. Retries that can't be requeued loop here rather than
    /// recursing.
    fn execute(&self, task: Task) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut task = task;
            loop {
                let err = match self.attempt(&task).await {
                    Ok(()) => return,
                    Err(err) => err,
                };

                match self.after_failure(task, err).await {
                    Some(next) => task = next,
                    None => return,
                }
            }
        })
    }

    async fn attempt(&self, task: &Task) -> Result<()> {
        match task.kind() {
            TaskKind::ListRepos { org, filter } => self.list_repos(task, org, filter).await,
            TaskKind::ListBranches { org, repo } => self.list_branches(task, org, repo).await,
            TaskKind::SyncFiles { org, repo, branch } => self.sync_files(task, org, repo, branch).await,
        }
    }

    async fn list_repos(&self, task: &Task, org: &str, filter: &RepoFilter) -> Result<()> {
        let discovered = task
            .client()
            .list_repos(org)
            .await
            .with_context(|| format!("list repos of org:{}/{}", task.platform(), org))?;
        self.stats.record_repo_listing();

        let repos = filter.apply(discovered);
        debug!(platform = %task.platform(), org, repos = repos.len(), "listed repos");

        for repo in repos {
            let child = Task::list_branches(task.target().clone(), org, repo);
            if self.dispatch(child).await.is_break() {
                break;
            }
        }
        Ok(())
    }

    async fn list_branches(&self, task: &Task, org: &str, repo: &str) -> Result<()> {
        let branches = task
            .client()
            .list_branches_of_repo(org, repo)
            .await
            .with_context(|| format!("list branch of repo:{}/{}/{}", task.platform(), org, repo))?;
        self.stats.record_branch_listing();

        debug!(platform = %task.platform(), org, repo, branches = branches.len(), "listed branches");

        for branch in branches {
            let child = Task::sync_files(task.target().clone(), org, repo, branch);
            if self.dispatch(child).await.is_break() {
                break;
            }
        }
        Ok(())
    }

    async fn sync_files(&self, task: &Task, org: &str, repo: &str, branch: &BranchInfo) -> Result<()> {
        task.client()
            .sync_file_of_branch(org, repo, &branch.name, &branch.sha, task.files())
            .await
            .with_context(|| format!("sync file of repo:{}", task))?;
        self.stats.record_sync();

        debug!(
            platform = %task.platform(),
            org,
            repo,
            branch = %branch.name,
            "synced files"
        );
        Ok(())
    }

    /// Queue a child task, or run it inline when the queue stays full.
    /// Breaks only when the run is cancelled.
    async fn dispatch(&self, child: Task) -> ControlFlow<()> {
        match self.queue.push_timeout(child, self.push_timeout).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(PushError::Full(child)) if !self.cancel.is_cancelled() => {
                debug!(executor = self.id, task = %child, "queue full, executing child inline");
                self.stats.record_inline();
                self.execute(child).await;
                ControlFlow::Continue(())
            }
            Err(_) => ControlFlow::Break(()),
        }
    }

    /// Decide what happens after a failed attempt. Returns the task when it
    /// should be retried right away in this loop.
    async fn after_failure(&self, task: Task, err: anyhow::Error) -> Option<Task> {
        let task = task.retried();
        self.stats.record_failed_attempt();

        if task.retries() >= self.max_retries {
            error!(
                platform = %task.platform(),
                org = %task.org(),
                repo = task.repo().unwrap_or_default(),
                branch = task.branch().map(|b| b.name.as_str()).unwrap_or_default(),
                files = %task.files().join(", "),
                retries = task.retries(),
                error = %format!("{:#}", err),
                "exceed max retry, give up task"
            );
            self.stats.record_abandoned(AbandonedTask::new(&task, &err));
            return None;
        }

        warn!(task = %task, error = %format!("{:#}", err), "task attempt failed");

        match self.queue.push_timeout(task, self.push_timeout).await {
            Ok(()) => {
                self.stats.record_requeue();
                None
            }
            Err(PushError::Full(task)) if !self.cancel.is_cancelled() => {
                debug!(executor = self.id, task = %task, "queue full, retrying inline");
                Some(task)
            }
            Err(e) => {
                debug!(task = %e.into_task(), "run cancelled, dropping retry");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatformClient;
    use crate::run::RunSummary;
    use crate::task::SyncTarget;
    use anyhow::anyhow;
    use mockall::predicate::{always, eq};
    use mockall::Sequence;

    fn settings(max_retries: u32) -> RunSettings {
        RunSettings {
            queue_capacity: 1,
            executors: 1,
            max_retries,
            idle_timeout: Duration::from_millis(20),
            push_timeout: Duration::from_millis(1),
        }
    }

    fn executor(queue: &Arc<TaskQueue>, stats: &Arc<RunStats>, max_retries: u32) -> TaskExecutor {
        TaskExecutor::new(
            0,
            queue.clone(),
            stats.clone(),
            &settings(max_retries),
            CancellationToken::new(),
        )
    }

    fn target(client: MockPlatformClient) -> Arc<SyncTarget> {
        Arc::new(SyncTarget::new("p", vec!["OWNERS".to_string()], Arc::new(client)))
    }

    /// Leave the one-slot queue full so every push times out
    async fn fill(queue: &TaskQueue) {
        let filler = Task::list_branches(target(MockPlatformClient::new()), "filler", "filler");
        queue.push(filler).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_success() {
        let mut client = MockPlatformClient::new();
        client
            .expect_sync_file_of_branch()
            .with(eq("o"), eq("r"), eq("main"), eq("sha1"), always())
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let queue = Arc::new(TaskQueue::new(1, CancellationToken::new()));
        let stats = Arc::new(RunStats::default());
        let task = Task::sync_files(target(client), "o", "r", BranchInfo::new("main", "sha1"));

        executor(&queue, &stats, 3).execute(task).await;

        let summary = stats_snapshot(&stats);
        assert_eq!(summary.0, 1);
        assert_eq!(summary.1, 0);
    }

    #[tokio::test]
    async fn test_full_queue_expands_inline() {
        let mut client = MockPlatformClient::new();
        client
            .expect_list_repos()
            .with(eq("o"))
            .times(1)
            .returning(|_| Ok(vec!["a".to_string(), "b".to_string()]));
        client
            .expect_list_branches_of_repo()
            .with(eq("o"), eq("a"))
            .times(1)
            .returning(|_, _| Ok(vec![BranchInfo::new("main", "sha1"), BranchInfo::new("dev", "sha2")]));
        client
            .expect_sync_file_of_branch()
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));

        let queue = Arc::new(TaskQueue::new(1, CancellationToken::new()));
        fill(&queue).await;
        let stats = Arc::new(RunStats::default());

        let filter = Arc::new(RepoFilter::Deny(["b".to_string()].into_iter().collect()));
        let task = Task::list_repos(target(client), "o", filter);
        executor(&queue, &stats, 3).execute(task).await;

        // one branch listing plus two syncs ran inline; nothing was lost
        assert_eq!(stats_snapshot(&stats).0, 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_inline_until_success_when_queue_full() {
        let mut seq = Sequence::new();
        let mut client = MockPlatformClient::new();
        client
            .expect_list_branches_of_repo()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(anyhow!("unavailable")));
        client
            .expect_list_branches_of_repo()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Vec::new()));

        let queue = Arc::new(TaskQueue::new(1, CancellationToken::new()));
        fill(&queue).await;
        let stats = Arc::new(RunStats::default());

        let task = Task::list_branches(target(client), "o", "r");
        executor(&queue, &stats, 3).execute(task).await;

        let (_, failed, abandoned) = stats_snapshot(&stats);
        assert_eq!(failed, 2);
        assert_eq!(abandoned, 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_abandons_task() {
        let mut client = MockPlatformClient::new();
        client
            .expect_list_repos()
            .times(3)
            .returning(|_| Err(anyhow!("boom")));

        let queue = Arc::new(TaskQueue::new(1, CancellationToken::new()));
        fill(&queue).await;
        let stats = Arc::new(RunStats::default());

        let task = Task::list_repos(target(client), "o", Arc::new(RepoFilter::All));
        executor(&queue, &stats, 3).execute(task).await;

        let (_, failed, abandoned) = stats_snapshot(&stats);
        assert_eq!(failed, 3);
        assert_eq!(abandoned, 1);
    }

    #[tokio::test]
    async fn test_failed_task_is_requeued_with_higher_retry_count() {
        let mut client = MockPlatformClient::new();
        client
            .expect_list_branches_of_repo()
            .times(1)
            .returning(|_, _| Err(anyhow!("unavailable")));

        let queue = Arc::new(TaskQueue::new(1, CancellationToken::new()));
        let stats = Arc::new(RunStats::default());

        // One failure so far: a second one is still below the ceiling of 3
        let task = Task::list_branches(target(client), "o", "r").retried();
        executor(&queue, &stats, 3).execute(task).await;

        let requeued = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(requeued.retries(), 2);
        assert_eq!(requeued.repo(), Some("r"));
    }

    #[tokio::test]
    async fn test_task_at_ceiling_is_not_requeued() {
        let mut client = MockPlatformClient::new();
        client
            .expect_sync_file_of_branch()
            .times(1)
            .returning(|_, _, _, _, _| Err(anyhow!("rejected")));

        let queue = Arc::new(TaskQueue::new(1, CancellationToken::new()));
        let stats = Arc::new(RunStats::default());

        let task = Task::sync_files(target(client), "o", "r", BranchInfo::new("main", "sha1"))
            .retried()
            .retried();
        executor(&queue, &stats, 3).execute(task).await;

        assert!(queue.is_empty());
        assert_eq!(stats_snapshot(&stats).2, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_drops_retry() {
        let mut client = MockPlatformClient::new();
        client
            .expect_list_branches_of_repo()
            .times(1)
            .returning(|_, _| Err(anyhow!("unavailable")));

        let cancel = CancellationToken::new();
        let queue = Arc::new(TaskQueue::new(1, cancel.clone()));
        let stats = Arc::new(RunStats::default());
        let executor = TaskExecutor::new(0, queue.clone(), stats.clone(), &settings(3), cancel.clone());
        cancel.cancel();

        executor
            .execute(Task::list_branches(target(client), "o", "r"))
            .await;

        assert_eq!(stats_snapshot(&stats).2, 0);
        assert!(queue.is_empty());
    }

    fn stats_snapshot(stats: &RunStats) -> (usize, usize, usize) {
        let summary = RunSummary::compile(stats, 0, false, Duration::ZERO);
        (summary.synced_branches, summary.failed_attempts, summary.abandoned.len())
    }
}
