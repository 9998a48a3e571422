//! Load run state machine.
//!
//! One run walks `Init -> Resolving -> Locking -> BackingUp ->
//! (DroppingPrimaryKey) -> (Cleaning) -> Loading -> (RebuildingPrimaryKey) ->
//! RebuildingIndexes -> (Verifying) -> Unlocking -> Done`, or ends in
//! `Failed`. Once the partition lock is taken it is released on every path
//! before the run reports its outcome, and every captured definition that is
//! not known to be rebuilt is logged as recovery DDL.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bulk::{BulkLoader, CopyFormat};
use crate::error::{LoadFailure, RebuildFailure};
use crate::lock::TableLockCoordinator;
use crate::partition::{PartitionResolver, PartitionTarget};
use crate::schema::{IndexBackupRecord, SchemaObjectManager};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Which schema objects are torn down around the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Secondary indexes only; the primary key is never touched.
    Standard,
    /// Also drops the primary key before the load and rebuilds it after.
    PrimaryKeyReset,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::PrimaryKeyReset => f.write_str("pk-reset"),
        }
    }
}

/// What PrimaryKeyReset mode does when the partition has no primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyPolicy {
    /// Log a warning and load without a key drop.
    #[default]
    SkipIfAbsent,
    /// Fail the run with `PrimaryKeyAbsent`.
    Require,
}

/// When captured definitions are reapplied after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryPolicy {
    /// Rebuild indexes and primary key even if a file failed to load.
    pub rebuild_on_load_failure: bool,
    /// Rebuild what was already dropped when a pre-load step fails.
    pub rebuild_on_prepare_failure: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            rebuild_on_load_failure: true,
            rebuild_on_prepare_failure: false,
        }
    }
}

/// Step of a run, recorded in [`LoadSummary::phases`] as it is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Resolving,
    Locking,
    BackingUp,
    DroppingPrimaryKey,
    Cleaning,
    Loading,
    RebuildingPrimaryKey,
    RebuildingIndexes,
    Verifying,
    Unlocking,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Resolving => "resolving",
            Self::Locking => "locking",
            Self::BackingUp => "backing_up",
            Self::DroppingPrimaryKey => "dropping_primary_key",
            Self::Cleaning => "cleaning",
            Self::Loading => "loading",
            Self::RebuildingPrimaryKey => "rebuilding_primary_key",
            Self::RebuildingIndexes => "rebuilding_indexes",
            Self::Verifying => "verifying",
            Self::Unlocking => "unlocking",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Immutable inputs of one run.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub mode: LoadMode,
    /// Logical table; the partition is resolved from it at run time.
    pub base_table: String,
    pub directory: PathBuf,
    /// Files in load order.
    pub input_files: Vec<PathBuf>,
    /// Truncate the partition before the first file.
    pub clean_before_load: bool,
    pub lock_timeout: Duration,
    pub recovery: RecoveryPolicy,
    pub primary_key_policy: PrimaryKeyPolicy,
    /// Stop loading at the first failed file instead of attempting the rest.
    pub fail_fast: bool,
    pub verify_row_count: bool,
    pub format: CopyFormat,
}

impl LoadPlan {
    /// Plan with the defaults of a plain run: clean, verified, rebuild on failure.
    pub fn new(
        mode: LoadMode,
        base_table: impl Into<String>,
        directory: impl Into<PathBuf>,
        input_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            mode,
            base_table: base_table.into(),
            directory: directory.into(),
            input_files,
            clean_before_load: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            recovery: RecoveryPolicy::default(),
            primary_key_policy: PrimaryKeyPolicy::default(),
            fail_fast: false,
            verify_row_count: true,
            format: CopyFormat::default(),
        }
    }

    /// Checks everything that can be checked without the database.
    pub fn validate(&self) -> Result<(), LoadFailure> {
        if self.base_table.trim().is_empty() {
            return Err(LoadFailure::invalid_configuration("table name is empty"));
        }
        if self.base_table.contains('\0') || self.base_table.trim() != self.base_table {
            return Err(LoadFailure::invalid_configuration(format!(
                "table name {:?} is not a valid identifier",
                self.base_table
            )));
        }
        if !self.directory.is_dir() {
            return Err(LoadFailure::invalid_configuration(format!(
                "directory {} does not exist",
                self.directory.display()
            )));
        }
        if self.input_files.is_empty() {
            return Err(LoadFailure::invalid_configuration(format!(
                "no .tbl files found in {}",
                self.directory.display()
            )));
        }
        if self.format.columns.is_empty() {
            return Err(LoadFailure::invalid_configuration("column list is empty"));
        }
        Ok(())
    }
}

/// Result of one file load.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file: PathBuf,
    /// Rows copied; `None` when the file failed.
    pub rows: Option<u64>,
    pub elapsed_ms: u64,
    /// Rendered load error, if any.
    pub error: Option<String>,
}

/// Mutable record of a run, returned on success and failure alike.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub mode: LoadMode,
    pub base_table: String,
    pub clean_before_load: bool,
    pub target: Option<PartitionTarget>,
    pub phases: Vec<RunPhase>,
    /// Every definition captured before a drop, in capture order.
    pub backups: Vec<IndexBackupRecord>,
    /// Names of captured objects successfully reapplied.
    pub rebuilt: Vec<String>,
    pub rebuild_attempted: bool,
    pub files: Vec<FileOutcome>,
    /// Row count read back after the rebuild, when verification ran.
    pub partition_rows: Option<u64>,
    pub elapsed_ms: u64,
}

impl LoadSummary {
    pub(crate) fn new(plan: &LoadPlan) -> Self {
        Self {
            mode: plan.mode,
            base_table: plan.base_table.clone(),
            clean_before_load: plan.clean_before_load,
            target: None,
            phases: Vec::new(),
            backups: Vec::new(),
            rebuilt: Vec::new(),
            rebuild_attempted: false,
            files: Vec::new(),
            partition_rows: None,
            elapsed_ms: 0,
        }
    }

    /// Captured definitions not known to be present on the table.
    pub fn pending_recovery(&self) -> Vec<&IndexBackupRecord> {
        self.backups
            .iter()
            .filter(|record| !self.rebuilt.contains(&record.index_name))
            .collect()
    }

    /// Rows copied by the files that loaded.
    pub fn rows_loaded(&self) -> u64 {
        self.files.iter().filter_map(|outcome| outcome.rows).sum()
    }

    /// Number of files whose copy failed.
    pub fn files_failed(&self) -> usize {
        self.files.iter().filter(|outcome| outcome.error.is_some()).count()
    }
}

/// A failed run: the failure, where it happened, and what was done.
/// A failed run: the outcome-determining error and where it happened.
#[derive(Debug, Error)]
#[error("load run failed during {phase}: {error}")]
pub struct RunFailure {
    #[source]
    pub error: LoadFailure,
    /// Phase that was active when the run failed.
    pub phase: RunPhase,
    /// Everything recorded up to the failure, including pending recovery.
    pub summary: LoadSummary,
}

struct RunState {
    current: RunPhase,
    failed_in: Option<RunPhase>,
    summary: LoadSummary,
}

impl RunState {
    fn enter(&mut self, phase: RunPhase) {
        info!(phase = %phase, "entering phase");
        self.current = phase;
        self.summary.phases.push(phase);
    }

    fn mark_failed(&mut self) {
        if self.failed_in.is_none() {
            self.failed_in = Some(self.current);
        }
    }
}

/// Sequences resolver, lock, schema manager and bulk loader for one run.
pub struct LoadOrchestrator {
    resolver: Arc<dyn PartitionResolver>,
    schema: Arc<dyn SchemaObjectManager>,
    locks: Arc<dyn TableLockCoordinator>,
    loader: Arc<dyn BulkLoader>,
}

impl LoadOrchestrator {
    /// Builds an orchestrator over the four components of a run.
    pub fn new(
        resolver: Arc<dyn PartitionResolver>,
        schema: Arc<dyn SchemaObjectManager>,
        locks: Arc<dyn TableLockCoordinator>,
        loader: Arc<dyn BulkLoader>,
    ) -> Self {
        Self {
            resolver,
            schema,
            locks,
            loader,
        }
    }

    /// Executes one load run end to end.
    ///
    /// The plan is validated before any database work. Once the partition
    /// lock is taken it is released on every path, and every dropped object
    /// is either rebuilt or listed in the failure's pending recovery.
    pub async fn run(&self, plan: &LoadPlan) -> Result<LoadSummary, RunFailure> {
        let started = Instant::now();
        info!(
            mode = %plan.mode,
            table = %plan.base_table,
            directory = %plan.directory.display(),
            files = plan.input_files.len(),
            clean = plan.clean_before_load,
            "load run starting"
        );

        let mut run = RunState {
            current: RunPhase::Init,
            failed_in: None,
            summary: LoadSummary::new(plan),
        };
        let result = self.drive(plan, &mut run).await;
        run.summary.elapsed_ms = started.elapsed().as_millis() as u64;
        log_report(&run.summary);

        match result {
            Ok(()) => {
                run.enter(RunPhase::Done);
                info!(elapsed_ms = run.summary.elapsed_ms, "load run completed");
                Ok(run.summary)
            }
            Err(error) => {
                let phase = run.failed_in.unwrap_or(run.current);
                run.enter(RunPhase::Failed);
                log_failure(&error, phase, &run.summary);
                Err(RunFailure {
                    error,
                    phase,
                    summary: run.summary,
                })
            }
        }
    }

    async fn drive(&self, plan: &LoadPlan, run: &mut RunState) -> Result<(), LoadFailure> {
        run.enter(RunPhase::Init);
        plan.validate().inspect_err(|_| run.mark_failed())?;

        run.enter(RunPhase::Resolving);
        let target = self
            .resolver
            .resolve(&plan.base_table)
            .await
            .inspect_err(|_| run.mark_failed())?;
        run.summary.target = Some(target.clone());

        run.enter(RunPhase::Locking);
        let handle = self
            .locks
            .acquire(&target, plan.lock_timeout)
            .await
            .inspect_err(|_| run.mark_failed())?;

        let outcome = self.mutate(plan, &target, run).await;
        if outcome.is_err() {
            run.mark_failed();
        }

        run.enter(RunPhase::Unlocking);
        self.locks.release(handle).await;
        outcome
    }

    /// Everything between taking and releasing the lock.
    async fn mutate(
        &self,
        plan: &LoadPlan,
        target: &PartitionTarget,
        run: &mut RunState,
    ) -> Result<(), LoadFailure> {
        run.enter(RunPhase::BackingUp);
        match self.schema.backup_and_drop_secondary_indexes(target).await {
            Ok(backups) => run.summary.backups.extend(backups),
            Err(err) => {
                if let LoadFailure::DropFailed { dropped, .. } = &err {
                    run.summary.backups.extend(dropped.iter().cloned());
                }
                run.mark_failed();
                return Err(self.recover_after_prepare_failure(plan, target, run, err).await);
            }
        }

        if plan.mode == LoadMode::PrimaryKeyReset {
            run.enter(RunPhase::DroppingPrimaryKey);
            match self.schema.drop_primary_key(target).await {
                Ok(record) => run.summary.backups.push(record),
                Err(LoadFailure::PrimaryKeyAbsent { table })
                    if plan.primary_key_policy == PrimaryKeyPolicy::SkipIfAbsent =>
                {
                    warn!(partition = %table, "no primary key to reset, continuing");
                }
                Err(err) => {
                    run.mark_failed();
                    return Err(self.recover_after_prepare_failure(plan, target, run, err).await);
                }
            }
        }

        if plan.clean_before_load {
            run.enter(RunPhase::Cleaning);
            if let Err(err) = self.schema.truncate(target).await {
                run.mark_failed();
                return Err(self.recover_after_prepare_failure(plan, target, run, err).await);
            }
        } else {
            info!(partition = %target.resolved_table, "keeping existing rows, appending");
        }

        run.enter(RunPhase::Loading);
        let load_failure = self.load_files(plan, target, run).await;
        if load_failure.is_some() {
            run.mark_failed();
            if !plan.recovery.rebuild_on_load_failure {
                warn!("rebuild after load failure disabled, schema objects stay dropped");
                return load_failure.map_or(Ok(()), Err);
            }
            warn!("load failed, rebuilding schema objects before reporting");
        }

        let rebuild = self.rebuild_all(target, run).await;

        if load_failure.is_none() && rebuild.is_ok() && plan.verify_row_count {
            run.enter(RunPhase::Verifying);
            self.verify_row_count(plan, target, run).await;
        }

        match (load_failure, rebuild) {
            (load_failure, Err(rebuild_failure)) => {
                if let Some(load_failure) = load_failure {
                    error!(error = %load_failure, "load also failed before the rebuild");
                }
                Err(rebuild_failure)
            }
            (Some(load_failure), Ok(())) => Err(load_failure),
            (None, Ok(())) => Ok(()),
        }
    }

    async fn load_files(
        &self,
        plan: &LoadPlan,
        target: &PartitionTarget,
        run: &mut RunState,
    ) -> Option<LoadFailure> {
        let total = plan.input_files.len();
        let mut first_failure = None;

        for (idx, file) in plan.input_files.iter().enumerate() {
            info!(
                file = %file.display(),
                position = idx + 1,
                total,
                partition = %target.resolved_table,
                "loading file"
            );
            let started = Instant::now();
            let result = self.loader.load(target, file, &plan.format).await;
            let elapsed = started.elapsed();
            let elapsed_ms = elapsed.as_millis() as u64;

            match result {
                Ok(rows) => {
                    info!(
                        file = %file.display(),
                        rows,
                        elapsed_ms,
                        rows_per_sec = rows_per_sec(rows, elapsed),
                        "file loaded"
                    );
                    run.summary.files.push(FileOutcome {
                        file: file.clone(),
                        rows: Some(rows),
                        elapsed_ms,
                        error: None,
                    });
                }
                Err(err) => {
                    error!(file = %file.display(), error = %err, "file load failed");
                    run.summary.files.push(FileOutcome {
                        file: file.clone(),
                        rows: None,
                        elapsed_ms,
                        error: Some(err.to_string()),
                    });
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                    if plan.fail_fast {
                        warn!(skipped = total - idx - 1, "fail-fast set, skipping remaining files");
                        break;
                    }
                }
            }
        }
        first_failure
    }

    /// Reapplies every captured definition: primary key first, then indexes.
    async fn rebuild_all(
        &self,
        target: &PartitionTarget,
        run: &mut RunState,
    ) -> Result<(), LoadFailure> {
        run.summary.rebuild_attempted = true;
        let (primary, secondary): (Vec<_>, Vec<_>) = run
            .summary
            .backups
            .iter()
            .cloned()
            .partition(|record| record.is_primary_key);

        let mut failures = Vec::new();
        if !primary.is_empty() {
            run.enter(RunPhase::RebuildingPrimaryKey);
            let result = self.schema.rebuild(target, &primary).await;
            absorb_rebuild(&mut run.summary, &primary, result, &mut failures);
        }

        run.enter(RunPhase::RebuildingIndexes);
        if !secondary.is_empty() {
            let result = self.schema.rebuild(target, &secondary).await;
            absorb_rebuild(&mut run.summary, &secondary, result, &mut failures);
        }

        if failures.is_empty() {
            info!(
                partition = %target.resolved_table,
                rebuilt = run.summary.rebuilt.len(),
                "schema objects restored"
            );
            Ok(())
        } else {
            Err(LoadFailure::RebuildFailed {
                table: target.resolved_table.clone(),
                failures,
            })
        }
    }

    async fn recover_after_prepare_failure(
        &self,
        plan: &LoadPlan,
        target: &PartitionTarget,
        run: &mut RunState,
        err: LoadFailure,
    ) -> LoadFailure {
        if !plan.recovery.rebuild_on_prepare_failure || run.summary.backups.is_empty() {
            return err;
        }
        warn!(error = %err, "preparation failed, restoring dropped schema objects");
        match self.rebuild_all(target, run).await {
            Ok(()) => err,
            Err(rebuild_failure) => {
                error!(error = %err, "preparation failure preceded the failed rebuild");
                rebuild_failure
            }
        }
    }

    async fn verify_row_count(&self, plan: &LoadPlan, target: &PartitionTarget, run: &mut RunState) {
        let loaded = run.summary.rows_loaded();
        match self.schema.count_rows(target).await {
            Ok(count) => {
                run.summary.partition_rows = Some(count);
                if count == loaded {
                    info!(partition = %target.resolved_table, rows = count, "row count verified");
                } else if plan.clean_before_load {
                    warn!(
                        partition = %target.resolved_table,
                        table_rows = count,
                        loaded_rows = loaded,
                        "row count differs from rows loaded"
                    );
                } else {
                    info!(
                        partition = %target.resolved_table,
                        table_rows = count,
                        loaded_rows = loaded,
                        "partition keeps earlier rows"
                    );
                }
            }
            Err(err) => warn!(error = %format!("{err:#}"), "row count verification failed"),
        }
    }
}

fn absorb_rebuild(
    summary: &mut LoadSummary,
    set: &[IndexBackupRecord],
    result: Result<(), LoadFailure>,
    failures: &mut Vec<RebuildFailure>,
) {
    match result {
        Ok(()) => summary
            .rebuilt
            .extend(set.iter().map(|record| record.index_name.clone())),
        Err(LoadFailure::RebuildFailed {
            failures: failed, ..
        }) => {
            summary.rebuilt.extend(
                set.iter()
                    .filter(|record| !failed.iter().any(|f| f.record.index_name == record.index_name))
                    .map(|record| record.index_name.clone()),
            );
            failures.extend(failed);
        }
        Err(other) => {
            let reason = other.to_string();
            failures.extend(set.iter().map(|record| RebuildFailure {
                record: record.clone(),
                reason: reason.clone(),
            }));
        }
    }
}

fn rows_per_sec(rows: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (rows as f64 / secs) as u64
    } else {
        0
    }
}

fn log_report(summary: &LoadSummary) {
    let succeeded = summary.files.len() - summary.files_failed();
    let copy_ms = summary
        .files
        .iter()
        .filter(|outcome| outcome.error.is_none())
        .map(|outcome| outcome.elapsed_ms)
        .sum::<u64>();
    let rows = summary.rows_loaded();
    let avg_ms_per_file = if succeeded > 0 {
        copy_ms / succeeded as u64
    } else {
        0
    };
    info!(
        table = %summary.base_table,
        partition = summary
            .target
            .as_ref()
            .map(|target| target.resolved_table.as_str())
            .unwrap_or("unresolved"),
        elapsed_ms = summary.elapsed_ms,
        files_ok = succeeded,
        files_failed = summary.files_failed(),
        rows,
        copy_ms,
        avg_ms_per_file,
        rows_per_sec = rows_per_sec(rows, Duration::from_millis(copy_ms)),
        partition_rows = summary.partition_rows,
        "load report"
    );
}

fn log_failure(error: &LoadFailure, phase: RunPhase, summary: &LoadSummary) {
    error!(kind = error.kind(), phase = %phase, error = %error, "load run failed");
    if let LoadFailure::RebuildFailed { failures, .. } = error {
        for failure in failures {
            error!(
                object = %failure.record.index_name,
                reason = %failure.reason,
                "rebuild error"
            );
        }
    }
    let pending = summary.pending_recovery();
    if pending.is_empty() {
        return;
    }
    error!(
        count = pending.len(),
        "schema objects missing from the partition; reapply the DDL below manually"
    );
    for record in pending {
        error!(
            object = %record.index_name,
            primary_key = record.is_primary_key,
            "recovery DDL: {};",
            record.definition_ddl
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LoadPlan::new(LoadMode::Standard, "performance", dir.path(), Vec::new());
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, LoadFailure::InvalidConfiguration { .. }));

        let plan = LoadPlan::new(
            LoadMode::Standard,
            " ",
            dir.path(),
            vec![dir.path().join("a.tbl")],
        );
        assert!(plan.validate().is_err());

        let plan = LoadPlan::new(
            LoadMode::Standard,
            "performance",
            dir.path().join("absent"),
            vec![dir.path().join("a.tbl")],
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn pending_recovery_excludes_rebuilt_objects() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LoadPlan::new(LoadMode::PrimaryKeyReset, "performance", dir.path(), Vec::new());
        let mut summary = LoadSummary::new(&plan);
        summary.backups = vec![
            IndexBackupRecord::secondary("idx_dtg", "CREATE INDEX idx_dtg ON t (dtg)"),
            IndexBackupRecord::primary_key("t_pkey", "ALTER TABLE t ADD CONSTRAINT t_pkey PRIMARY KEY (fid)"),
        ];
        summary.rebuilt = vec!["t_pkey".to_string()];

        let pending = summary.pending_recovery();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index_name, "idx_dtg");
    }

    #[test]
    fn absorb_rebuild_splits_partial_failures() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LoadPlan::new(LoadMode::Standard, "performance", dir.path(), Vec::new());
        let mut summary = LoadSummary::new(&plan);
        let set = vec![
            IndexBackupRecord::secondary("idx_a", "CREATE INDEX idx_a ON t (a)"),
            IndexBackupRecord::secondary("idx_b", "CREATE INDEX idx_b ON t (b)"),
        ];
        let result = Err(LoadFailure::RebuildFailed {
            table: "t".to_string(),
            failures: vec![RebuildFailure {
                record: set[1].clone(),
                reason: "out of disk".to_string(),
            }],
        });

        let mut failures = Vec::new();
        absorb_rebuild(&mut summary, &set, result, &mut failures);
        assert_eq!(summary.rebuilt, vec!["idx_a".to_string()]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].record.index_name, "idx_b");
    }

    #[test]
    fn throughput_is_zero_for_instant_loads() {
        assert_eq!(rows_per_sec(100, Duration::ZERO), 0);
        assert_eq!(rows_per_sec(100, Duration::from_millis(500)), 200);
    }
}
