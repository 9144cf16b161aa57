use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::platform::{BranchInfo, ClientRegistry, PlatformClient};

/// Client for one platform's synchronization server, speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpSyncFileClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ListRepoRequest<'a> {
    org: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListRepoResponse {
    #[serde(default)]
    repos: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ListBranchesOfRepoRequest<'a> {
    org: &'a str,
    repo: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListBranchesOfRepoResponse {
    #[serde(default)]
    branches: Vec<BranchInfo>,
}

#[derive(Debug, Serialize)]
struct Branch<'a> {
    org: &'a str,
    repo: &'a str,
    branch: &'a str,
    branch_sha: &'a str,
}

#[derive(Debug, Serialize)]
struct SyncRepoFileRequest<'a> {
    branch: Branch<'a>,
    file_names: &'a [String],
}

impl HttpSyncFileClient {
    /// Create a client for the sync server at `endpoint`. Every call is
    /// bounded by `timeout`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&endpoint)
            .with_context(|| format!("Invalid sync server endpoint: {}", endpoint))?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("repo-file-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            endpoint,
            timeout,
        })
    }

    /// Create a client from its config entry
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let timeout = config.timeout()?;
        Self::new(&config.endpoint, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.endpoint, path);
        debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Sync server rejected request to {}", url))?;

        Ok(response)
    }
}

#[async_trait]
impl PlatformClient for HttpSyncFileClient {
    async fn list_repos(&self, org: &str) -> Result<Vec<String>> {
        let response: ListRepoResponse = self
            .post("/v1/repos", &ListRepoRequest { org })
            .await?
            .json()
            .await
            .context("Failed to decode repo list")?;

        Ok(response.repos)
    }

    async fn list_branches_of_repo(&self, org: &str, repo: &str) -> Result<Vec<BranchInfo>> {
        let response: ListBranchesOfRepoResponse = self
            .post("/v1/branches", &ListBranchesOfRepoRequest { org, repo })
            .await?
            .json()
            .await
            .context("Failed to decode branch list")?;

        Ok(response.branches)
    }

    async fn sync_file_of_branch(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        branch_sha: &str,
        files: &[String],
    ) -> Result<()> {
        let request = SyncRepoFileRequest {
            branch: Branch {
                org,
                repo,
                branch,
                branch_sha,
            },
            file_names: files,
        };

        self.post("/v1/sync", &request).await?;
        Ok(())
    }
}

/// Build the platform registry from the `clients` config section.
///
/// A client that can't be created is skipped with a warning; its platform
/// then produces no tasks. The first entry for a platform wins.
pub fn registry_from_config(clients: &[ClientConfig]) -> ClientRegistry {
    let mut registry = ClientRegistry::new();

    for item in clients {
        if registry.contains(&item.platform) {
            warn!(platform = %item.platform, endpoint = %item.endpoint, "duplicate client config, ignored");
            continue;
        }

        match HttpSyncFileClient::from_config(item) {
            Ok(client) => {
                info!(platform = %item.platform, endpoint = %item.endpoint, "init sync file client");
                registry.register(item.platform.clone(), Arc::new(client));
            }
            Err(e) => {
                warn!(
                    platform = %item.platform,
                    endpoint = %item.endpoint,
                    "init sync file client failed: {:#}",
                    e
                );
            }
        }
    }

    registry
}
