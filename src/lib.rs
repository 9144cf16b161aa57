//! repo-file-sync - propagate configuration files to every branch of many repositories
//!
//! Each code-hosting platform runs a sync server that knows how to list an
//! organization's repositories, list a repository's branches, and write a set of
//! files to a branch. This crate drives those servers: it expands a declarative
//! list of organizations into one sync call per branch and runs them through a
//! bounded queue worked by a pool of executors.
//!
//! ## Core Features
//!
//! - **Three-level expansion**: org, then repo, then branch, with allow/deny repo filters
//! - **Backpressure**: bounded queue, executors run children inline when it is full
//! - **Retries**: failed tasks are requeued up to a retry ceiling, then reported
//! - **Cancellation**: one signal stops the producer and every executor
//! - **Scheduling**: daemon mode runs daily from a configured start time
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration and validation
//! - [`platform`]: the sync-server client trait and the per-platform registry
//! - [`client`]: HTTP implementation of the client trait
//! - [`task`], [`queue`]: work units and the shared bounded queue
//! - [`producer`], [`executor`]: seeding and processing tasks
//! - [`run`]: run lifecycle, cancellation and summaries
//! - [`daemon`]: scheduled runs

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod platform;
pub mod producer;
pub mod queue;
pub mod run;
pub mod task;

pub use client::{registry_from_config, HttpSyncFileClient};
pub use config::Config;
pub use daemon::{Daemon, Schedule};
pub use error::{ConfigError, PopError, PushError};
pub use platform::{BranchInfo, ClientRegistry, PlatformClient};
pub use run::{RunController, RunHandle, RunSettings, RunSummary};
pub use task::{RepoFilter, SyncTarget, Task, TaskKind};
