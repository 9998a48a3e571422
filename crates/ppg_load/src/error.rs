//! Failure taxonomy for one load run.
//!
//! Plumbing below the component traits (session queries, child processes,
//! environment parsing) reports `anyhow::Error`; each component folds those
//! into one `LoadFailure` variant so the orchestrator can decide recovery by
//! kind rather than by message.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::schema::IndexBackupRecord;

/// Exit status for invalid arguments or environment.
pub const EXIT_INVALID_CONFIGURATION: u8 = 2;
/// Exit status when schema objects could not be rebuilt.
pub const EXIT_REBUILD_FAILED: u8 = 3;
/// Exit status for every other failed run.
pub const EXIT_FAILURE: u8 = 1;

/// One backup record that failed to reapply during rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildFailure {
    pub record: IndexBackupRecord,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("partition resolution for '{base_table}' failed: {reason}")]
    ResolutionQuery { base_table: String, reason: String },

    #[error("no active partition recorded for base table '{base_table}'")]
    PartitionNotFound { base_table: String },

    #[error("timed out after {timeout:?} waiting for the load lock on '{table}'")]
    LockTimeout { table: String, timeout: Duration },

    #[error("lock on '{table}' could not be taken: {reason}")]
    LockConflict { table: String, reason: String },

    #[error("catalog introspection of '{table}' failed: {reason}")]
    SchemaIntrospection { table: String, reason: String },

    /// `dropped` lists objects already removed before the failing drop.
    #[error("dropping '{object}' on '{table}' failed: {reason}")]
    DropFailed {
        table: String,
        object: String,
        reason: String,
        dropped: Vec<IndexBackupRecord>,
    },

    #[error("table '{table}' has no primary key constraint")]
    PrimaryKeyAbsent { table: String },

    #[error("truncating '{table}' failed: {reason}")]
    TruncateFailed { table: String, reason: String },

    #[error("loading '{}' into '{table}' failed: {reason}", file.display())]
    Load {
        table: String,
        file: PathBuf,
        reason: String,
    },

    #[error("{} schema object(s) on '{table}' could not be rebuilt", failures.len())]
    RebuildFailed {
        table: String,
        failures: Vec<RebuildFailure>,
    },
}

impl LoadFailure {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Short, stable name of the failure kind for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration { .. } => "InvalidConfiguration",
            Self::ResolutionQuery { .. } => "ResolutionQueryError",
            Self::PartitionNotFound { .. } => "PartitionNotFound",
            Self::LockTimeout { .. } => "LockTimeout",
            Self::LockConflict { .. } => "LockConflict",
            Self::SchemaIntrospection { .. } => "SchemaIntrospectionError",
            Self::DropFailed { .. } => "DropFailed",
            Self::PrimaryKeyAbsent { .. } => "PrimaryKeyAbsent",
            Self::TruncateFailed { .. } => "TruncateFailed",
            Self::Load { .. } => "LoadError",
            Self::RebuildFailed { .. } => "RebuildFailed",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidConfiguration { .. } => EXIT_INVALID_CONFIGURATION,
            Self::RebuildFailed { .. } => EXIT_REBUILD_FAILED,
            _ => EXIT_FAILURE,
        }
    }
}

/// Formats an error chain on one line (`outer: inner: root`).
pub(crate) fn chain(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
