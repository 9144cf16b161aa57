//! Task producer - seeds a run from the static sync configuration
//!
//! The producer never talks to a platform. It turns each org selector into
//! the first tasks of the run: one repo-listing task per org that needs
//! discovery, or one branch-listing task per explicitly named repo.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{OrgRepos, SyncFileConfig};
use crate::platform::ClientRegistry;
use crate::queue::TaskQueue;
use crate::task::{RepoFilter, SyncTarget, Task};

pub struct TaskProducer {
    queue: Arc<TaskQueue>,
    registry: Arc<ClientRegistry>,
    sync_files: Arc<Vec<SyncFileConfig>>,
    cancel: CancellationToken,
}

impl TaskProducer {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<ClientRegistry>,
        sync_files: Arc<Vec<SyncFileConfig>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            registry,
            sync_files,
            cancel,
        }
    }

    /// Push every seed task, blocking on a full queue until executors make
    /// room. Returns how many tasks were queued.
    pub async fn run(self) -> usize {
        let mut produced = 0;

        'configs: for item in self.sync_files.iter() {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(client) = self.registry.get(&item.platform) else {
                warn!(platform = %item.platform, "generate tasks, no client for platform");
                continue;
            };

            let target = Arc::new(SyncTarget::new(
                item.platform.clone(),
                item.file_names.clone(),
                client,
            ));

            for selector in &item.org_repos {
                if self.cancel.is_cancelled() {
                    break 'configs;
                }

                for task in seed_tasks(&target, selector) {
                    let level = task.level();
                    if self.queue.push(task).await.is_err() {
                        debug!("run cancelled while generating tasks");
                        break 'configs;
                    }
                    produced += 1;
                    debug!(platform = %item.platform, org = %selector.org, level, "generated task");
                }

                info!(platform = %item.platform, org = %selector.org, "generated tasks for org");
            }
        }

        self.queue.producer_finished();
        info!(produced, "generate tasks done");
        produced
    }
}

/// The first tasks of one selector
pub fn seed_tasks(target: &Arc<SyncTarget>, selector: &OrgRepos) -> Vec<Task> {
    match selector.filter() {
        RepoFilter::Allow(repos) if !selector.verify_repos => repos
            .into_iter()
            .map(|repo| Task::list_branches(target.clone(), selector.org.clone(), repo))
            .collect(),
        filter => vec![Task::list_repos(
            target.clone(),
            selector.org.clone(),
            Arc::new(filter),
        )],
    }
}
