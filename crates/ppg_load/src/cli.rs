//! Shared command-line entry point for both loader binaries.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use crate::bulk::PsqlCopyLoader;
use crate::config::LoaderConfig;
use crate::error::{chain, LoadFailure, EXIT_FAILURE, EXIT_INVALID_CONFIGURATION};
use crate::exec::executor_for;
use crate::files::discover_input_files;
use crate::lock::AdvisoryLockCoordinator;
use crate::logging;
use crate::orchestrator::{LoadMode, LoadOrchestrator, LoadPlan, LoadSummary, PrimaryKeyPolicy};
use crate::partition::SequencePartitionResolver;
use crate::schema::CatalogSchemaManager;
use crate::session::open_session;

/// Loads every `.tbl` file of a directory into the active partition of a base table.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct LoadArgs {
    /// Base table name; the active partition is resolved from it.
    #[arg(short = 'f', long = "table")]
    pub table: String,

    /// Directory holding the `.tbl` input files.
    #[arg(short = 'd', long)]
    pub directory: PathBuf,

    /// Truncate the resolved partition before loading (default).
    #[arg(long, overrides_with = "no_clean")]
    pub clean: bool,

    /// Keep existing rows and append.
    #[arg(long, overrides_with = "clean")]
    pub no_clean: bool,

    /// How long to wait for another loader to release the partition.
    /// Overrides PPG_LOAD_LOCK_TIMEOUT_SECS.
    #[arg(long)]
    pub lock_timeout: Option<humantime::Duration>,

    /// Stop loading at the first failed file.
    #[arg(long)]
    pub fail_fast: bool,

    /// Leave dropped indexes and keys dropped when a file fails to load.
    #[arg(long)]
    pub no_rebuild_on_load_failure: bool,

    /// Restore already-dropped objects when backup, key drop or truncate fails.
    #[arg(long)]
    pub rebuild_on_prepare_failure: bool,

    /// Fail instead of continuing when the partition has no primary key.
    #[arg(long)]
    pub require_primary_key: bool,

    /// Skip the row count check after the rebuild.
    #[arg(long)]
    pub skip_verify: bool,

    /// Write the run summary as JSON to this path.
    #[arg(long)]
    pub report_json: Option<PathBuf>,
}

impl LoadArgs {
    pub fn clean_before_load(&self) -> bool {
        !self.no_clean
    }

    /// Builds the run plan from arguments, configuration and discovered files.
    pub fn plan(&self, mode: LoadMode, config: &LoaderConfig, input_files: Vec<PathBuf>) -> LoadPlan {
        let mut plan = LoadPlan::new(mode, self.table.trim(), &self.directory, input_files);
        plan.clean_before_load = self.clean_before_load();
        plan.lock_timeout = self
            .lock_timeout
            .map(Into::into)
            .unwrap_or(config.lock_timeout);
        plan.recovery.rebuild_on_load_failure = !self.no_rebuild_on_load_failure;
        plan.recovery.rebuild_on_prepare_failure = self.rebuild_on_prepare_failure;
        plan.primary_key_policy = if self.require_primary_key {
            PrimaryKeyPolicy::Require
        } else {
            PrimaryKeyPolicy::SkipIfAbsent
        };
        plan.fail_fast = self.fail_fast;
        plan.verify_row_count = !self.skip_verify;
        plan
    }
}

/// Parses process arguments and runs one load in `mode`.
pub async fn run(mode: LoadMode) -> ExitCode {
    run_with_args(mode, LoadArgs::parse()).await
}

pub async fn run_with_args(mode: LoadMode, args: LoadArgs) -> ExitCode {
    // Logging is not up until the log directory is known.
    let config = match LoaderConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err:#}");
            return ExitCode::from(EXIT_INVALID_CONFIGURATION);
        }
    };
    let log_file = match logging::init(&config.log_dir) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("logging setup failed: {err:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    info!(log_file = %log_file.display(), mode = %mode, "ppg_load starting");

    match execute(mode, &args, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => ExitCode::from(failure.exit_code()),
    }
}

async fn execute(mode: LoadMode, args: &LoadArgs, config: &LoaderConfig) -> Result<(), LoadFailure> {
    let input_files = if args.directory.is_dir() {
        discover_input_files(&args.directory)
            .map_err(|err| LoadFailure::invalid_configuration(chain(&err)))?
    } else {
        Vec::new()
    };
    let plan = args.plan(mode, config, input_files);
    if let Err(failure) = plan.validate() {
        error!(kind = failure.kind(), error = %failure, "refusing to start");
        return Err(failure);
    }

    let executor = executor_for(config);
    info!(executor = %executor.describe(), "database commands run through psql");
    let session = open_session(config, executor.clone()).await.map_err(|err| {
        let failure = LoadFailure::ResolutionQuery {
            base_table: plan.base_table.clone(),
            reason: chain(&err),
        };
        error!(kind = failure.kind(), error = %failure, "database unreachable");
        failure
    })?;

    let orchestrator = LoadOrchestrator::new(
        Arc::new(SequencePartitionResolver::new(
            session.clone(),
            config.schema.clone(),
            config.sequence_table.clone(),
        )),
        Arc::new(CatalogSchemaManager::new(session.clone())),
        Arc::new(AdvisoryLockCoordinator::new(session.clone())),
        Arc::new(PsqlCopyLoader::new(executor, config.copy_guard)),
    );

    let outcome = orchestrator.run(&plan).await;
    drop(orchestrator);
    session.shutdown().await;

    let (summary, result) = match outcome {
        Ok(summary) => (summary, Ok(())),
        Err(failure) => (failure.summary, Err(failure.error)),
    };
    if let Some(path) = &args.report_json {
        match write_report(path, &summary) {
            Ok(()) => info!(path = %path.display(), "run report written"),
            Err(err) => error!(path = %path.display(), error = %format!("{err:#}"), "run report not written"),
        }
    }
    result
}

/// Serializes the run summary as pretty JSON, creating parent directories.
pub fn write_report(path: &Path, summary: &LoadSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize run report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
