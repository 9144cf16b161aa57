//! Task data model
//!
//! A run expands work in three levels: listing the repos of an org, listing
//! the branches of a repo, and syncing files into one branch. Each level is
//! its own variant carrying only what that level needs.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::platform::{BranchInfo, PlatformClient};

/// What a run propagates and where: one entry of `sync_files` bound to the
/// client of its platform. Shared by every task descended from that entry.
pub struct SyncTarget {
    pub platform: String,
    pub files: Vec<String>,
    pub client: Arc<dyn PlatformClient>,
}

impl SyncTarget {
    pub fn new(platform: impl Into<String>, files: Vec<String>, client: Arc<dyn PlatformClient>) -> Self {
        Self {
            platform: platform.into(),
            files,
            client,
        }
    }
}

impl fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTarget")
            .field("platform", &self.platform)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

/// Which discovered repos of an org take part in a run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RepoFilter {
    #[default]
    All,
    /// Only these repos
    Allow(BTreeSet<String>),
    /// Everything except these repos
    Deny(BTreeSet<String>),
}

impl RepoFilter {
    /// Build a filter from the two config lists. Validation guarantees at most
    /// one of them is non-empty; if both are, the allow-list wins.
    pub fn from_lists(repos: &[String], excluded_repos: &[String]) -> Self {
        if !repos.is_empty() {
            RepoFilter::Allow(repos.iter().cloned().collect())
        } else if !excluded_repos.is_empty() {
            RepoFilter::Deny(excluded_repos.iter().cloned().collect())
        } else {
            RepoFilter::All
        }
    }

    pub fn allows(&self, repo: &str) -> bool {
        match self {
            RepoFilter::All => true,
            RepoFilter::Allow(repos) => repos.contains(repo),
            RepoFilter::Deny(repos) => !repos.contains(repo),
        }
    }

    /// Keep the discovered repos this filter allows, in discovery order and
    /// without duplicates.
    pub fn apply(&self, discovered: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        discovered
            .into_iter()
            .filter(|repo| self.allows(repo) && seen.insert(repo.clone()))
            .collect()
    }
}

/// The level-specific part of a task
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Enumerate the repos of `org` and keep those `filter` allows
    ListRepos { org: String, filter: Arc<RepoFilter> },
    /// Enumerate the branches of one repo
    ListBranches { org: String, repo: String },
    /// Sync the target's files into one branch, pinned to its discovered SHA
    SyncFiles {
        org: String,
        repo: String,
        branch: BranchInfo,
    },
}

/// A unit of work. Never mutated once queued; a retry is a new value with a
/// higher retry count.
#[derive(Debug, Clone)]
pub struct Task {
    target: Arc<SyncTarget>,
    kind: TaskKind,
    retries: u32,
}

impl Task {
    pub fn list_repos(target: Arc<SyncTarget>, org: impl Into<String>, filter: Arc<RepoFilter>) -> Self {
        Self {
            target,
            kind: TaskKind::ListRepos {
                org: org.into(),
                filter,
            },
            retries: 0,
        }
    }

    pub fn list_branches(target: Arc<SyncTarget>, org: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            target,
            kind: TaskKind::ListBranches {
                org: org.into(),
                repo: repo.into(),
            },
            retries: 0,
        }
    }

    pub fn sync_files(
        target: Arc<SyncTarget>,
        org: impl Into<String>,
        repo: impl Into<String>,
        branch: BranchInfo,
    ) -> Self {
        Self {
            target,
            kind: TaskKind::SyncFiles {
                org: org.into(),
                repo: repo.into(),
                branch,
            },
            retries: 0,
        }
    }

    /// The same task after one more failed attempt
    pub fn retried(self) -> Self {
        Self {
            retries: self.retries.saturating_add(1),
            ..self
        }
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn target(&self) -> &Arc<SyncTarget> {
        &self.target
    }

    pub fn client(&self) -> &dyn PlatformClient {
        self.target.client.as_ref()
    }

    pub fn platform(&self) -> &str {
        &self.target.platform
    }

    pub fn files(&self) -> &[String] {
        &self.target.files
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn org(&self) -> &str {
        match &self.kind {
            TaskKind::ListRepos { org, .. }
            | TaskKind::ListBranches { org, .. }
            | TaskKind::SyncFiles { org, .. } => org,
        }
    }

    pub fn repo(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::ListRepos { .. } => None,
            TaskKind::ListBranches { repo, .. } | TaskKind::SyncFiles { repo, .. } => Some(repo),
        }
    }

    pub fn branch(&self) -> Option<&BranchInfo> {
        match &self.kind {
            TaskKind::SyncFiles { branch, .. } => Some(branch),
            _ => None,
        }
    }

    /// Short name of the level, used as a log field
    pub fn level(&self) -> &'static str {
        match &self.kind {
            TaskKind::ListRepos { .. } => "list_repos",
            TaskKind::ListBranches { .. } => "list_branches",
            TaskKind::SyncFiles { .. } => "sync_files",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform:{}, org:{}", self.platform(), self.org())?;
        if let Some(repo) = self.repo() {
            write!(f, ", repo:{}", repo)?;
        }
        if let Some(branch) = self.branch() {
            write!(f, ", branch:{}, branch sha:{}", branch.name, branch.sha)?;
        }
        write!(f, ", files:{}, retries:{}", self.files().join(", "), self.retries)
    }
}
