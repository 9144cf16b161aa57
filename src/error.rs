//! Typed errors for configuration validation and the task queue
//!
//! Everything that is only ever reported flows through `anyhow`; the enums
//! here exist because callers match on them.

use thiserror::Error;

use crate::task::Task;

/// Rejected configuration. Fatal to startup, never reaches a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync_files entry #{index} must set platform")]
    MissingPlatform { index: usize },

    #[error("sync_files entry for platform {platform} must set file_names")]
    MissingFileNames { platform: String },

    #[error("org_repos entry for platform {platform} must set org")]
    MissingOrg { platform: String },

    #[error("can't set repos and excluded_repos for org:{org} at same time")]
    ConflictingRepoFilters { org: String },

    #[error("client for platform {platform} must set endpoint")]
    MissingEndpoint { platform: String },

    #[error("client entry #{index} must set platform")]
    MissingClientPlatform { index: usize },

    #[error("{field} must be bigger than 0")]
    NotPositive { field: &'static str },

    #[error("invalid duration for {field}: {value:?} (use a format like '10ms', '3s', '30m', '24h')")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid start_time {value:?}, the format is HH:MM")]
    InvalidStartTime { value: String },
}

/// A push that did not enqueue. The task is handed back untouched.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("task queue is full")]
    Full(Task),

    #[error("run cancelled before the task could be queued")]
    Cancelled(Task),
}

impl PushError {
    /// Recover the task that was not queued
    pub fn into_task(self) -> Task {
        match self {
            PushError::Full(task) | PushError::Cancelled(task) => task,
        }
    }
}

/// Why a pop returned without a task
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived within the idle deadline; work may still be outstanding
    #[error("no task arrived before the idle deadline")]
    Idle,

    /// The producer finished and every queued task has been acknowledged
    #[error("all outstanding tasks are done")]
    Drained,

    #[error("run cancelled")]
    Cancelled,
}
