//! Platform client abstraction
//!
//! Each hosting platform (gitee, github, gitlab, ...) is served by a remote
//! synchronization server. The core only needs three calls from it and only
//! cares whether they succeeded.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A branch captured at discovery time.
///
/// The SHA pins the later sync call to this exact revision, so a push that
/// lands during the run doesn't change what gets synced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub sha: String,
}

impl BranchInfo {
    pub fn new(name: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha: sha.into(),
        }
    }
}

/// Remote operations offered by a per-platform sync server.
///
/// Implementations are shared by every executor of a run and must be safe to
/// call concurrently. `sync_file_of_branch` is assumed idempotent: a retry may
/// repeat a call that actually reached the server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// List the repositories of an organization
    async fn list_repos(&self, org: &str) -> Result<Vec<String>>;

    /// List the branches of a repository together with their head commits
    async fn list_branches_of_repo(&self, org: &str, repo: &str) -> Result<Vec<BranchInfo>>;

    /// Write `files` into one branch, based on the commit `branch_sha`
    async fn sync_file_of_branch(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        branch_sha: &str,
        files: &[String],
    ) -> Result<()>;
}

/// Platform name to client mapping, built once per run and injected into the
/// run controller.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<dyn PlatformClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. An existing registration for the same platform is
    /// kept and `false` is returned.
    pub fn register(&mut self, platform: impl Into<String>, client: Arc<dyn PlatformClient>) -> bool {
        let platform = platform.into();
        if self.clients.contains_key(&platform) {
            return false;
        }
        self.clients.insert(platform, client);
        true
    }

    /// Builder-style variant of [`ClientRegistry::register`]
    pub fn with(mut self, platform: impl Into<String>, client: Arc<dyn PlatformClient>) -> Self {
        self.register(platform, client);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformClient>> {
        self.clients.get(platform).cloned()
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.clients.contains_key(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut platforms: Vec<&str> = self.platforms().collect();
        platforms.sort_unstable();
        f.debug_struct("ClientRegistry")
            .field("platforms", &platforms)
            .finish()
    }
}
