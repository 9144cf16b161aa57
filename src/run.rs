//! Run controller - wires one producer and a pool of executors to a shared
//! queue and a single cancellation signal
//!
//! A run is complete once the producer and every executor have returned. How
//! many leaf syncs failed doesn't change that; failures are reported in the
//! [`RunSummary`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncFileConfig;
use crate::executor::TaskExecutor;
use crate::platform::ClientRegistry;
use crate::producer::TaskProducer;
use crate::queue::TaskQueue;
use crate::task::Task;

/// Typed run tuning, see [`crate::config::RunConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub queue_capacity: usize,
    pub executors: usize,
    pub max_retries: u32,
    pub idle_timeout: Duration,
    pub push_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            executors: 3,
            max_retries: 3,
            idle_timeout: Duration::from_secs(3),
            push_timeout: Duration::from_millis(10),
        }
    }
}

/// A task given up on after reaching the retry ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedTask {
    pub level: &'static str,
    pub platform: String,
    pub org: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub branch_sha: Option<String>,
    pub files: Vec<String>,
    pub retries: u32,
    pub error: String,
}

impl AbandonedTask {
    pub fn new(task: &Task, error: &anyhow::Error) -> Self {
        Self {
            level: task.level(),
            platform: task.platform().to_string(),
            org: task.org().to_string(),
            repo: task.repo().map(str::to_string),
            branch: task.branch().map(|b| b.name.clone()),
            branch_sha: task.branch().map(|b| b.sha.clone()),
            files: task.files().to_vec(),
            retries: task.retries(),
            error: format!("{:#}", error),
        }
    }
}

/// Counters shared by the producer side and every executor
#[derive(Debug, Default)]
pub struct RunStats {
    repo_listings: AtomicUsize,
    branch_listings: AtomicUsize,
    synced_branches: AtomicUsize,
    failed_attempts: AtomicUsize,
    requeued_retries: AtomicUsize,
    inline_executions: AtomicUsize,
    abandoned: Mutex<Vec<AbandonedTask>>,
}

impl RunStats {
    pub fn record_repo_listing(&self) {
        self.repo_listings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_branch_listing(&self) {
        self.branch_listings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self) {
        self.synced_branches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeued_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inline(&self) {
        self.inline_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, abandoned: AbandonedTask) {
        match self.abandoned.lock() {
            Ok(mut list) => list.push(abandoned),
            Err(poisoned) => poisoned.into_inner().push(abandoned),
        }
    }

    fn abandoned(&self) -> Vec<AbandonedTask> {
        match self.abandoned.lock() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Results from a complete run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub produced_tasks: usize,
    pub repo_listings: usize,
    pub branch_listings: usize,
    pub synced_branches: usize,
    pub failed_attempts: usize,
    pub requeued_retries: usize,
    pub inline_executions: usize,
    pub abandoned: Vec<AbandonedTask>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl RunSummary {
    pub(crate) fn compile(stats: &RunStats, produced_tasks: usize, cancelled: bool, duration: Duration) -> Self {
        Self {
            produced_tasks,
            repo_listings: stats.repo_listings.load(Ordering::Relaxed),
            branch_listings: stats.branch_listings.load(Ordering::Relaxed),
            synced_branches: stats.synced_branches.load(Ordering::Relaxed),
            failed_attempts: stats.failed_attempts.load(Ordering::Relaxed),
            requeued_retries: stats.requeued_retries.load(Ordering::Relaxed),
            inline_executions: stats.inline_executions.load(Ordering::Relaxed),
            abandoned: stats.abandoned(),
            cancelled,
            duration,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && !self.cancelled
    }
}

/// Starts runs against an injected client registry
#[derive(Debug, Clone)]
pub struct RunController {
    registry: Arc<ClientRegistry>,
    settings: RunSettings,
}

impl RunController {
    pub fn new(registry: ClientRegistry, settings: RunSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Spawn the producer and the executors for one run. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, sync_files: Vec<SyncFileConfig>) -> RunHandle {
        let cancel = CancellationToken::new();
        let queue = Arc::new(TaskQueue::new(self.settings.queue_capacity, cancel.clone()));
        let stats = Arc::new(RunStats::default());

        info!(
            queue_capacity = self.settings.queue_capacity,
            executors = self.settings.executors,
            platforms = sync_files.len(),
            "start doing once"
        );

        let producer = TaskProducer::new(
            queue.clone(),
            self.registry.clone(),
            Arc::new(sync_files),
            cancel.clone(),
        );
        let producer = tokio::spawn(producer.run());

        let executors = (0..self.settings.executors.max(1))
            .map(|id| {
                let executor = TaskExecutor::new(
                    id,
                    queue.clone(),
                    stats.clone(),
                    &self.settings,
                    cancel.clone(),
                );
                tokio::spawn(executor.run())
            })
            .collect();

        RunHandle {
            cancel,
            producer,
            executors,
            stats,
            started: Instant::now(),
        }
    }

    /// Start a run and wait for it
    pub async fn run_once(&self, sync_files: Vec<SyncFileConfig>) -> RunSummary {
        self.start(sync_files).wait().await
    }
}

/// Cloneable handle that cancels a run
#[derive(Debug, Clone)]
pub struct RunCanceller(CancellationToken);

impl RunCanceller {
    pub fn cancel(&self) {
        if !self.0.is_cancelled() {
            info!("cancelling run");
        }
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// A run in progress
pub struct RunHandle {
    cancel: CancellationToken,
    producer: JoinHandle<usize>,
    executors: Vec<JoinHandle<()>>,
    stats: Arc<RunStats>,
    started: Instant,
}

impl RunHandle {
    /// Signal cancellation; every blocking queue operation aborts at its next
    /// check. Calls already in flight complete first.
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    pub fn canceller(&self) -> RunCanceller {
        RunCanceller(self.cancel.clone())
    }

    /// Wait until the producer and every executor have returned. A panic in
    /// any of them cancels the rest of the run.
    pub async fn wait(self) -> RunSummary {
        let cancel = self.cancel.clone();
        let producer_cancel = self.cancel.clone();
        let producer_handle = self.producer;
        let producer = async move {
            match producer_handle.await {
                Ok(produced) => produced,
                Err(e) => {
                    error!("task producer panicked: {}", e);
                    producer_cancel.cancel();
                    0
                }
            }
        };

        let mut executors: FuturesUnordered<JoinHandle<()>> = self.executors.into_iter().collect();
        let executors = async {
            while let Some(joined) = executors.next().await {
                if let Err(e) = joined {
                    error!("task executor panicked: {}", e);
                    cancel.cancel();
                }
            }
        };

        let (produced, ()) = tokio::join!(producer, executors);

        let summary = RunSummary::compile(
            &self.stats,
            produced,
            self.cancel.is_cancelled(),
            self.started.elapsed(),
        );

        if summary.abandoned.is_empty() {
            info!(
                "run finished in {:.2}s: {} tasks produced, {} branches synced",
                summary.duration.as_secs_f64(),
                summary.produced_tasks,
                summary.synced_branches
            );
        } else {
            warn!(
                "run finished in {:.2}s: {} tasks produced, {} branches synced, {} tasks abandoned",
                summary.duration.as_secs_f64(),
                summary.produced_tasks,
                summary.synced_branches,
                summary.abandoned.len()
            );
        }

        summary
    }
}
