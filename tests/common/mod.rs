/// Common test utilities and helpers for repo-file-sync tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use repo_file_sync::config::{OrgRepos, SyncFileConfig};
use repo_file_sync::{BranchInfo, PlatformClient, RunSettings};

/// One call observed by [`FakeSyncServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListRepos {
        org: String,
    },
    ListBranches {
        org: String,
        repo: String,
    },
    Sync {
        org: String,
        repo: String,
        branch: String,
        sha: String,
        files: Vec<String>,
    },
}

/// Scripted in-memory sync server that records every call
#[derive(Debug, Default)]
pub struct FakeSyncServer {
    repos: HashMap<String, Vec<String>>,
    branches: HashMap<(String, String), Vec<BranchInfo>>,
    sync_failures: Mutex<HashMap<(String, String), usize>>,
    failing_listings: Vec<String>,
    panic_on_sync: bool,
    latency: Duration,
    calls: Mutex<Vec<Call>>,
}

impl FakeSyncServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repos(mut self, org: &str, repos: &[&str]) -> Self {
        self.repos
            .insert(org.to_string(), repos.iter().map(|r| r.to_string()).collect());
        self
    }

    pub fn with_branches(mut self, org: &str, repo: &str, branches: &[(&str, &str)]) -> Self {
        self.branches.insert(
            (org.to_string(), repo.to_string()),
            branches
                .iter()
                .map(|(name, sha)| BranchInfo::new(*name, *sha))
                .collect(),
        );
        self
    }

    /// Fail the first `times` syncs of `repo`/`branch`
    pub fn failing_sync(self, repo: &str, branch: &str, times: usize) -> Self {
        self.sync_failures
            .lock()
            .unwrap()
            .insert((repo.to_string(), branch.to_string()), times);
        self
    }

    /// Every repo listing of `org` fails
    pub fn failing_listing(mut self, org: &str) -> Self {
        self.failing_listings.push(org.to_string());
        self
    }

    /// Every sync call panics, as a buggy client would
    pub fn panicking_on_sync(mut self) -> Self {
        self.panic_on_sync = true;
        self
    }

    /// Delay every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn list_repo_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::ListRepos { .. }))
            .count()
    }

    pub fn listed_branches_of(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ListBranches { repo, .. } => Some(repo),
                _ => None,
            })
            .collect()
    }

    /// `repo@branch` for every sync call, sorted
    pub fn synced(&self) -> Vec<String> {
        let mut synced: Vec<String> = self
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Sync { repo, branch, .. } => Some(format!("{}@{}", repo, branch)),
                _ => None,
            })
            .collect();
        synced.sort();
        synced
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl PlatformClient for FakeSyncServer {
    async fn list_repos(&self, org: &str) -> Result<Vec<String>> {
        self.record(Call::ListRepos {
            org: org.to_string(),
        });
        self.delay().await;

        if self.failing_listings.iter().any(|o| o == org) {
            return Err(anyhow!("list repos of {} unavailable", org));
        }
        Ok(self.repos.get(org).cloned().unwrap_or_default())
    }

    async fn list_branches_of_repo(&self, org: &str, repo: &str) -> Result<Vec<BranchInfo>> {
        self.record(Call::ListBranches {
            org: org.to_string(),
            repo: repo.to_string(),
        });
        self.delay().await;

        Ok(self
            .branches
            .get(&(org.to_string(), repo.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn sync_file_of_branch(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        branch_sha: &str,
        files: &[String],
    ) -> Result<()> {
        self.record(Call::Sync {
            org: org.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            sha: branch_sha.to_string(),
            files: files.to_vec(),
        });
        self.delay().await;

        if self.panic_on_sync {
            panic!("sync client bug on {}/{}", repo, branch);
        }

        let mut failures = self.sync_failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&(repo.to_string(), branch.to_string())) {
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("sync of {}/{} rejected", repo, branch));
            }
        }
        Ok(())
    }
}

/// One event seen by [`LogCapture`]
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn message(&self) -> &str {
        self.field("message").unwrap_or_default()
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

/// Tracing layer that records every event, for asserting on log output
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Capture events on this thread until the guard is dropped. Works with
    /// the current-thread runtime of `#[tokio::test]`, where spawned tasks run
    /// on the test thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.level == level)
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            fields,
        });
    }
}

/// Selector helper
pub fn selector(org: &str, repos: &[&str], excluded: &[&str]) -> OrgRepos {
    OrgRepos {
        org: org.to_string(),
        repos: repos.iter().map(|r| r.to_string()).collect(),
        excluded_repos: excluded.iter().map(|r| r.to_string()).collect(),
        verify_repos: false,
    }
}

pub fn sync_files(platform: &str, files: &[&str], org_repos: Vec<OrgRepos>) -> SyncFileConfig {
    SyncFileConfig {
        platform: platform.to_string(),
        file_names: files.iter().map(|f| f.to_string()).collect(),
        org_repos,
    }
}

/// Settings with short timeouts so tests finish quickly
pub fn fast_settings() -> RunSettings {
    RunSettings {
        queue_capacity: 16,
        executors: 3,
        max_retries: 3,
        idle_timeout: Duration::from_millis(50),
        push_timeout: Duration::from_millis(5),
    }
}
