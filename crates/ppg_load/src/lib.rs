//! Batch loader for dynamically partitioned PostGIS write-ahead tables.
//!
//! A load run resolves the active `<base>_wa_<NNN>` partition from the
//! sequence-tracking table, takes a per-partition lock, drops secondary
//! indexes (and, in primary-key reset mode, the primary key), optionally
//! truncates, streams every `.tbl` file through `psql` COPY, then restores
//! exactly the captured definitions.
//!
//! The pieces meet at a handful of traits so the run can be driven against
//! fakes in tests:
//! - [`partition::PartitionResolver`] finds the target partition,
//! - [`lock::TableLockCoordinator`] serializes loaders per partition,
//! - [`schema::SchemaObjectManager`] captures, drops and rebuilds schema objects,
//! - [`bulk::BulkLoader`] copies one file in.
//!
//! [`orchestrator::LoadOrchestrator`] sequences them; [`cli`] wires the
//! PostgreSQL-backed implementations for the two binaries. With a container
//! configured, every database command (queries, DDL, locks and COPY) runs
//! through `docker exec` into that container.

pub mod bulk;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod files;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod partition;
pub mod psql_session;
pub mod schema;
pub mod session;

pub use config::{DbConfig, ExecutionTarget, LoaderConfig};
pub use error::{LoadFailure, RebuildFailure};
pub use orchestrator::{
    LoadMode, LoadOrchestrator, LoadPlan, LoadSummary, PrimaryKeyPolicy, RecoveryPolicy, RunFailure,
    RunPhase,
};
pub use partition::PartitionTarget;
pub use schema::IndexBackupRecord;
