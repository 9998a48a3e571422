//! Recording in-memory components for driving the orchestrator.
//!
//! All four fakes share one [`World`]: a journal of calls in order, a fake
//! catalog of the partition's schema objects, and the fault switches.
//! [`capture_logs`] collects what a run logs on the current thread.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use ppg_load::bulk::{BulkLoader, CopyFormat};
use ppg_load::lock::{lock_key, LockHandle, TableLockCoordinator};
use ppg_load::partition::{partition_table_name, PartitionResolver};
use ppg_load::schema::SchemaObjectManager;
use ppg_load::{
    IndexBackupRecord, LoadFailure, LoadMode, LoadOrchestrator, LoadPlan, PartitionTarget,
    RebuildFailure,
};
use tempfile::TempDir;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

pub const BASE_TABLE: &str = "performance";
pub const SEQUENCE_VALUE: i64 = 7;
pub const PARTITION: &str = "performance_wa_007";
pub const ROWS_PER_FILE: u64 = 100;

/// Fault switches; everything succeeds by default.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub partition_missing: bool,
    pub lock_timeout: bool,
    /// Drop this many indexes, then fail on the next one.
    pub drop_fails_after: Option<usize>,
    pub drop_pk_fails: bool,
    pub truncate_fails: bool,
    pub failing_files: Vec<String>,
    pub failing_rebuilds: Vec<String>,
}

/// Schema objects currently present on the fake partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub indexes: Vec<IndexBackupRecord>,
    pub primary_key: Option<IndexBackupRecord>,
    pub rows: u64,
}

impl Catalog {
    pub fn index_names(&self) -> Vec<String> {
        let mut names = self
            .indexes
            .iter()
            .map(|record| record.index_name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

pub fn default_catalog() -> Catalog {
    Catalog {
        indexes: vec![
            IndexBackupRecord::secondary(
                "performance_wa_007_dtg_idx",
                "CREATE INDEX performance_wa_007_dtg_idx ON public.performance_wa_007 USING btree (dtg)",
            ),
            IndexBackupRecord::secondary(
                "performance_wa_007_geom_idx",
                "CREATE INDEX performance_wa_007_geom_idx ON public.performance_wa_007 USING gist (geom)",
            ),
        ],
        primary_key: Some(IndexBackupRecord::primary_key(
            "performance_wa_007_pkey",
            "ALTER TABLE \"public\".\"performance_wa_007\" ADD CONSTRAINT \"performance_wa_007_pkey\" PRIMARY KEY (fid, dtg)",
        )),
        rows: 42,
    }
}

pub struct World {
    journal: Mutex<Vec<String>>,
    catalog: Mutex<Catalog>,
    faults: Mutex<Faults>,
    locked: Mutex<bool>,
}

impl World {
    fn record(&self, entry: impl Into<String>) {
        lock(&self.journal).push(entry.into());
    }

    /// Records a schema call, flagging it when made without the lock.
    fn record_ddl(&self, entry: impl Into<String>) {
        let entry = entry.into();
        if !*lock(&self.locked) {
            lock(&self.journal).push(format!("unlocked {entry}"));
        } else {
            lock(&self.journal).push(entry);
        }
    }

    fn faults(&self) -> Faults {
        lock(&self.faults).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Harness {
    pub world: Arc<World>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_catalog(default_catalog())
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            world: Arc::new(World {
                journal: Mutex::new(Vec::new()),
                catalog: Mutex::new(catalog),
                faults: Mutex::new(Faults::default()),
                locked: Mutex::new(false),
            }),
        }
    }

    pub fn faults(self, faults: Faults) -> Self {
        *lock(&self.world.faults) = faults;
        self
    }

    pub fn orchestrator(&self) -> LoadOrchestrator {
        LoadOrchestrator::new(
            Arc::new(MockResolver(self.world.clone())),
            Arc::new(MockSchema(self.world.clone())),
            Arc::new(MockLocks(self.world.clone())),
            Arc::new(MockLoader(self.world.clone())),
        )
    }

    pub fn journal(&self) -> Vec<String> {
        lock(&self.world.journal).clone()
    }

    pub fn catalog(&self) -> Catalog {
        lock(&self.world.catalog).clone()
    }

    pub fn is_locked(&self) -> bool {
        *lock(&self.world.locked)
    }
}

/// In-memory log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Routes this thread's events into a buffer until the guard drops.
pub fn capture_logs() -> (LogBuffer, DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_target(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

/// Temp directory with one small `.tbl` file per name, plus the plan over it.
pub fn plan_with_files(mode: LoadMode, names: &[&str]) -> Result<(TempDir, LoadPlan)> {
    let dir = tempfile::tempdir()?;
    let mut files = Vec::new();
    for name in names {
        let path = dir.path().join(name);
        std::fs::write(&path, "1|POINT(0 0)|2024-01-01 00:00:00|7\n")?;
        files.push(path);
    }
    let plan = LoadPlan::new(mode, BASE_TABLE, dir.path(), files);
    Ok((dir, plan))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct MockResolver(Arc<World>);

#[async_trait]
impl PartitionResolver for MockResolver {
    async fn resolve(&self, base_table: &str) -> Result<PartitionTarget, LoadFailure> {
        self.0.record(format!("resolve {base_table}"));
        if self.0.faults().partition_missing {
            return Err(LoadFailure::PartitionNotFound {
                base_table: base_table.to_string(),
            });
        }
        Ok(PartitionTarget::new(
            "public",
            base_table,
            partition_table_name(base_table, SEQUENCE_VALUE),
            SEQUENCE_VALUE,
        ))
    }
}

pub struct MockLocks(Arc<World>);

#[async_trait]
impl TableLockCoordinator for MockLocks {
    async fn acquire(
        &self,
        target: &PartitionTarget,
        timeout: Duration,
    ) -> Result<LockHandle, LoadFailure> {
        self.0.record(format!("acquire {}", target.resolved_table));
        if self.0.faults().lock_timeout {
            return Err(LoadFailure::LockTimeout {
                table: target.resolved_table.clone(),
                timeout,
            });
        }
        *lock(&self.0.locked) = true;
        Ok(LockHandle {
            key: lock_key(target),
            table: target.resolved_table.clone(),
            acquired_at: Instant::now(),
        })
    }

    async fn release(&self, handle: LockHandle) {
        self.0.record(format!("release {}", handle.table));
        *lock(&self.0.locked) = false;
    }
}

pub struct MockSchema(Arc<World>);

#[async_trait]
impl SchemaObjectManager for MockSchema {
    async fn backup_and_drop_secondary_indexes(
        &self,
        target: &PartitionTarget,
    ) -> Result<Vec<IndexBackupRecord>, LoadFailure> {
        self.0.record_ddl(format!("backup {}", target.resolved_table));
        let faults = self.0.faults();
        let mut catalog = lock(&self.0.catalog);
        let captured = catalog.indexes.clone();

        let mut dropped = Vec::new();
        for record in captured {
            if faults.drop_fails_after == Some(dropped.len()) {
                return Err(LoadFailure::DropFailed {
                    table: target.resolved_table.clone(),
                    object: record.index_name.clone(),
                    reason: "index is in use".to_string(),
                    dropped,
                });
            }
            catalog
                .indexes
                .retain(|present| present.index_name != record.index_name);
            dropped.push(record);
        }
        Ok(dropped)
    }

    async fn drop_primary_key(
        &self,
        target: &PartitionTarget,
    ) -> Result<IndexBackupRecord, LoadFailure> {
        self.0.record_ddl(format!("drop_pk {}", target.resolved_table));
        if self.0.faults().drop_pk_fails {
            return Err(LoadFailure::DropFailed {
                table: target.resolved_table.clone(),
                object: format!("{}_pkey", target.resolved_table),
                reason: "cannot drop constraint".to_string(),
                dropped: Vec::new(),
            });
        }
        lock(&self.0.catalog)
            .primary_key
            .take()
            .ok_or_else(|| LoadFailure::PrimaryKeyAbsent {
                table: target.resolved_table.clone(),
            })
    }

    async fn rebuild(
        &self,
        target: &PartitionTarget,
        backups: &[IndexBackupRecord],
    ) -> Result<(), LoadFailure> {
        let names = backups
            .iter()
            .map(|record| record.index_name.as_str())
            .collect::<Vec<_>>();
        self.0.record_ddl(format!("rebuild {}", names.join(",")));

        let faults = self.0.faults();
        let mut catalog = lock(&self.0.catalog);
        let mut failures = Vec::new();
        for record in backups {
            if faults.failing_rebuilds.contains(&record.index_name) {
                failures.push(RebuildFailure {
                    record: record.clone(),
                    reason: "could not create unique index".to_string(),
                });
            } else if record.is_primary_key {
                catalog.primary_key = Some(record.clone());
            } else {
                catalog.indexes.push(record.clone());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LoadFailure::RebuildFailed {
                table: target.resolved_table.clone(),
                failures,
            })
        }
    }

    async fn truncate(&self, target: &PartitionTarget) -> Result<(), LoadFailure> {
        self.0.record_ddl(format!("truncate {}", target.resolved_table));
        if self.0.faults().truncate_fails {
            return Err(LoadFailure::TruncateFailed {
                table: target.resolved_table.clone(),
                reason: "permission denied".to_string(),
            });
        }
        lock(&self.0.catalog).rows = 0;
        Ok(())
    }

    async fn count_rows(&self, target: &PartitionTarget) -> Result<u64> {
        self.0.record_ddl(format!("count {}", target.resolved_table));
        Ok(lock(&self.0.catalog).rows)
    }
}

pub struct MockLoader(Arc<World>);

#[async_trait]
impl BulkLoader for MockLoader {
    async fn load(
        &self,
        target: &PartitionTarget,
        file: &Path,
        _format: &CopyFormat,
    ) -> Result<u64, LoadFailure> {
        let name = file_name(file);
        self.0.record_ddl(format!("load {name}"));
        if self.0.faults().failing_files.contains(&name) {
            return Err(LoadFailure::Load {
                table: target.resolved_table.clone(),
                file: PathBuf::from(file),
                reason: "ERROR:  invalid input syntax for type timestamp".to_string(),
            });
        }
        lock(&self.0.catalog).rows += ROWS_PER_FILE;
        Ok(ROWS_PER_FILE)
    }
}
