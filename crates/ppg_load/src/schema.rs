//! Index and primary-key teardown/rebuild around the bulk copy.
//!
//! Definitions are captured from the catalog (`pg_get_indexdef`,
//! `pg_get_constraintdef`) immediately before each drop, so a rebuild
//! reproduces exactly what existed, including opclasses, predicates and
//! storage parameters. The same manager issues the partition-scoped
//! truncate and row count, which must run on the locked session too.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{chain, LoadFailure, RebuildFailure};
use crate::partition::PartitionTarget;
use crate::session::{quote_ident, SqlSession};

/// Captured reconstruction DDL for one dropped schema object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexBackupRecord {
    pub index_name: String,
    /// Statement that recreates the object verbatim.
    pub definition_ddl: String,
    pub is_primary_key: bool,
}

impl IndexBackupRecord {
    pub fn secondary(index_name: impl Into<String>, definition_ddl: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            definition_ddl: definition_ddl.into(),
            is_primary_key: false,
        }
    }

    pub fn primary_key(index_name: impl Into<String>, definition_ddl: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            definition_ddl: definition_ddl.into(),
            is_primary_key: true,
        }
    }
}

#[async_trait]
pub trait SchemaObjectManager: Send + Sync {
    /// Captures every secondary index definition, then drops each index.
    async fn backup_and_drop_secondary_indexes(
        &self,
        target: &PartitionTarget,
    ) -> Result<Vec<IndexBackupRecord>, LoadFailure>;

    /// Captures the primary-key constraint definition, then drops it.
    async fn drop_primary_key(
        &self,
        target: &PartitionTarget,
    ) -> Result<IndexBackupRecord, LoadFailure>;

    /// Reapplies captured definitions, primary key first, each exactly once.
    async fn rebuild(
        &self,
        target: &PartitionTarget,
        backups: &[IndexBackupRecord],
    ) -> Result<(), LoadFailure>;

    /// Removes every row of the resolved partition.
    async fn truncate(&self, target: &PartitionTarget) -> Result<(), LoadFailure>;

    async fn count_rows(&self, target: &PartitionTarget) -> Result<u64>;
}

/// Catalog-driven manager over the run's session.
pub struct CatalogSchemaManager {
    session: Arc<dyn SqlSession>,
}

impl CatalogSchemaManager {
    pub fn new(session: Arc<dyn SqlSession>) -> Self {
        Self { session }
    }

    async fn list_secondary_indexes(
        &self,
        target: &PartitionTarget,
    ) -> Result<Vec<IndexBackupRecord>> {
        // Constraint-owned indexes (unique/exclusion constraints) cannot be
        // removed with DROP INDEX and stay in place.
        let sql = "SELECT i.relname::text, pg_get_indexdef(ix.indexrelid)::text \
                   FROM pg_index ix \
                   JOIN pg_class t ON t.oid = ix.indrelid \
                   JOIN pg_class i ON i.oid = ix.indexrelid \
                   JOIN pg_namespace n ON n.oid = t.relnamespace \
                   WHERE n.nspname = $1 AND t.relname = $2 \
                   AND NOT ix.indisprimary \
                   AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid) \
                   ORDER BY i.relname";
        let rows = self
            .session
            .query_rows(sql, &[target.schema.as_str(), target.resolved_table.as_str()])
            .await
            .context("list secondary indexes")?;

        rows.into_iter()
            .map(|row| match row.as_slice() {
                [Some(name), Some(definition)] => {
                    Ok(IndexBackupRecord::secondary(name.clone(), definition.clone()))
                }
                other => Err(anyhow!("unexpected index catalog row: {other:?}")),
            })
            .collect()
    }

    async fn find_primary_key(&self, target: &PartitionTarget) -> Result<Option<(String, String)>> {
        let sql = "SELECT c.conname::text, pg_get_constraintdef(c.oid)::text \
                   FROM pg_constraint c \
                   JOIN pg_class t ON t.oid = c.conrelid \
                   JOIN pg_namespace n ON n.oid = t.relnamespace \
                   WHERE n.nspname = $1 AND t.relname = $2 AND c.contype = 'p'";
        let rows = self
            .session
            .query_rows(sql, &[target.schema.as_str(), target.resolved_table.as_str()])
            .await
            .context("look up primary key constraint")?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => match row.as_slice() {
                [Some(name), Some(definition)] => Ok(Some((name.clone(), definition.clone()))),
                other => Err(anyhow!("unexpected constraint catalog row: {other:?}")),
            },
            _ => Err(anyhow!("table reports {} primary keys", rows.len())),
        }
    }
}

#[async_trait]
impl SchemaObjectManager for CatalogSchemaManager {
    async fn backup_and_drop_secondary_indexes(
        &self,
        target: &PartitionTarget,
    ) -> Result<Vec<IndexBackupRecord>, LoadFailure> {
        let backups = self.list_secondary_indexes(target).await.map_err(|err| {
            LoadFailure::SchemaIntrospection {
                table: target.resolved_table.clone(),
                reason: chain(&err),
            }
        })?;
        if backups.is_empty() {
            info!(partition = %target.resolved_table, "no secondary indexes to drop");
            return Ok(backups);
        }

        let mut dropped = Vec::with_capacity(backups.len());
        for record in &backups {
            info!(index = %record.index_name, definition = %record.definition_ddl, "dropping index");
            let sql = format!(
                "DROP INDEX IF EXISTS {}.{}",
                quote_ident(&target.schema),
                quote_ident(&record.index_name)
            );
            if let Err(err) = self.session.execute(&sql).await {
                return Err(LoadFailure::DropFailed {
                    table: target.resolved_table.clone(),
                    object: record.index_name.clone(),
                    reason: chain(&err),
                    dropped,
                });
            }
            dropped.push(record.clone());
        }
        info!(
            partition = %target.resolved_table,
            count = dropped.len(),
            "secondary indexes dropped"
        );
        Ok(dropped)
    }

    async fn drop_primary_key(
        &self,
        target: &PartitionTarget,
    ) -> Result<IndexBackupRecord, LoadFailure> {
        let (name, definition) = self
            .find_primary_key(target)
            .await
            .map_err(|err| LoadFailure::SchemaIntrospection {
                table: target.resolved_table.clone(),
                reason: chain(&err),
            })?
            .ok_or_else(|| LoadFailure::PrimaryKeyAbsent {
                table: target.resolved_table.clone(),
            })?;

        let table = target.qualified_name();
        let record = IndexBackupRecord::primary_key(
            name.clone(),
            format!(
                "ALTER TABLE {table} ADD CONSTRAINT {} {definition}",
                quote_ident(&name)
            ),
        );
        info!(constraint = %name, definition = %definition, "dropping primary key");
        let sql = format!("ALTER TABLE {table} DROP CONSTRAINT {}", quote_ident(&name));
        self.session
            .execute(&sql)
            .await
            .map_err(|err| LoadFailure::DropFailed {
                table: target.resolved_table.clone(),
                object: name.clone(),
                reason: chain(&err),
                dropped: Vec::new(),
            })?;
        Ok(record)
    }

    async fn rebuild(
        &self,
        target: &PartitionTarget,
        backups: &[IndexBackupRecord],
    ) -> Result<(), LoadFailure> {
        let ordered = backups
            .iter()
            .filter(|record| record.is_primary_key)
            .chain(backups.iter().filter(|record| !record.is_primary_key));

        let mut failures = Vec::new();
        for record in ordered {
            let started = std::time::Instant::now();
            match self.session.execute(&record.definition_ddl).await {
                Ok(_) => info!(
                    object = %record.index_name,
                    primary_key = record.is_primary_key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "schema object rebuilt"
                ),
                Err(err) => {
                    error!(
                        object = %record.index_name,
                        ddl = %record.definition_ddl,
                        error = %chain(&err),
                        "schema object rebuild failed"
                    );
                    failures.push(RebuildFailure {
                        record: record.clone(),
                        reason: chain(&err),
                    });
                }
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
        let sql = format!("TRUNCATE TABLE {}", target.qualified_name());
        self.session
            .execute(&sql)
            .await
            .map_err(|err| LoadFailure::TruncateFailed {
                table: target.resolved_table.clone(),
                reason: chain(&err),
            })?;
        info!(partition = %target.resolved_table, "partition truncated");
        Ok(())
    }

    async fn count_rows(&self, target: &PartitionTarget) -> Result<u64> {
        let sql = format!("SELECT count(*)::text FROM {}", target.qualified_name());
        let rows = self.session.query_rows(&sql, &[]).await?;
        let raw = rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
            .ok_or_else(|| anyhow!("count query returned no value"))?;
        match raw.trim().parse::<u64>() {
            Ok(count) => Ok(count),
            Err(err) => {
                warn!(value = %raw, "row count is not an integer");
                Err(err).with_context(|| format!("parse row count {raw:?}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::testing::{Reply, ScriptedSession};

    const INDEX_QUERY: &str = "pg_get_indexdef";
    const PK_QUERY: &str = "pg_get_constraintdef";

    fn target() -> PartitionTarget {
        PartitionTarget::new("public", "performance", "performance_wa_007", 7)
    }

    fn index_rows() -> Reply {
        Reply::rows(&[
            &[
                "performance_wa_007_dtg_idx",
                "CREATE INDEX performance_wa_007_dtg_idx ON public.performance_wa_007 USING btree (dtg)",
            ],
            &[
                "performance_wa_007_geom_idx",
                "CREATE INDEX performance_wa_007_geom_idx ON public.performance_wa_007 USING gist (geom)",
            ],
        ])
    }

    #[tokio::test]
    async fn backup_captures_then_drops_each_index() {
        let session = Arc::new(ScriptedSession::default().on(INDEX_QUERY, vec![index_rows()]));
        let manager = CatalogSchemaManager::new(session.clone());

        let backups = manager
            .backup_and_drop_secondary_indexes(&target())
            .await
            .unwrap();

        assert_eq!(backups.len(), 2);
        assert!(backups.iter().all(|record| !record.is_primary_key));
        assert!(backups[1].definition_ddl.contains("USING gist (geom)"));
        let statements = session.statements();
        assert_eq!(
            statements[1..],
            [
                "DROP INDEX IF EXISTS \"public\".\"performance_wa_007_dtg_idx\"".to_string(),
                "DROP INDEX IF EXISTS \"public\".\"performance_wa_007_geom_idx\"".to_string(),
            ]
        );
        assert_eq!(
            session.params()[0],
            vec!["public".to_string(), "performance_wa_007".to_string()]
        );
    }

    #[tokio::test]
    async fn drop_failure_reports_already_dropped_indexes() {
        let session = Arc::new(
            ScriptedSession::default()
                .on(INDEX_QUERY, vec![index_rows()])
                .on(
                    "performance_wa_007_geom_idx\"",
                    vec![Reply::Fail("lock timeout".to_string())],
                ),
        );
        let manager = CatalogSchemaManager::new(session.clone());

        let err = manager
            .backup_and_drop_secondary_indexes(&target())
            .await
            .unwrap_err();
        match err {
            LoadFailure::DropFailed {
                object, dropped, ..
            } => {
                assert_eq!(object, "performance_wa_007_geom_idx");
                assert_eq!(dropped.len(), 1);
                assert_eq!(dropped[0].index_name, "performance_wa_007_dtg_idx");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn introspection_failure_drops_nothing() {
        let session = Arc::new(
            ScriptedSession::default()
                .on(INDEX_QUERY, vec![Reply::Fail("permission denied".to_string())]),
        );
        let manager = CatalogSchemaManager::new(session.clone());

        let err = manager
            .backup_and_drop_secondary_indexes(&target())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SchemaIntrospectionError");
        assert_eq!(session.statements().len(), 1);
    }

    #[tokio::test]
    async fn primary_key_backup_is_a_complete_add_constraint() {
        let session = Arc::new(ScriptedSession::default().on(
            PK_QUERY,
            vec![Reply::rows(&[&["performance_wa_007_pkey", "PRIMARY KEY (fid, dtg)"]])],
        ));
        let manager = CatalogSchemaManager::new(session.clone());

        let record = manager.drop_primary_key(&target()).await.unwrap();

        assert!(record.is_primary_key);
        assert_eq!(
            record.definition_ddl,
            "ALTER TABLE \"public\".\"performance_wa_007\" ADD CONSTRAINT \"performance_wa_007_pkey\" PRIMARY KEY (fid, dtg)"
        );
        assert_eq!(
            session.statements()[1],
            "ALTER TABLE \"public\".\"performance_wa_007\" DROP CONSTRAINT \"performance_wa_007_pkey\""
        );
    }

    #[tokio::test]
    async fn missing_primary_key_is_reported_distinctly() {
        let session = Arc::new(ScriptedSession::default());
        let manager = CatalogSchemaManager::new(session.clone());

        let err = manager.drop_primary_key(&target()).await.unwrap_err();
        assert!(matches!(err, LoadFailure::PrimaryKeyAbsent { .. }));
        assert_eq!(session.statements().len(), 1);
    }

    #[tokio::test]
    async fn rebuild_applies_primary_key_first_and_continues_past_failures() {
        let session = Arc::new(ScriptedSession::default().on(
            "CREATE INDEX idx_a",
            vec![Reply::Fail("could not create index".to_string())],
        ));
        let manager = CatalogSchemaManager::new(session.clone());
        let backups = vec![
            IndexBackupRecord::secondary("idx_a", "CREATE INDEX idx_a ON t (a)"),
            IndexBackupRecord::secondary("idx_b", "CREATE INDEX idx_b ON t (b)"),
            IndexBackupRecord::primary_key("t_pkey", "ALTER TABLE t ADD CONSTRAINT t_pkey PRIMARY KEY (fid)"),
        ];

        let err = manager.rebuild(&target(), &backups).await.unwrap_err();

        assert_eq!(
            session.statements(),
            vec![
                "ALTER TABLE t ADD CONSTRAINT t_pkey PRIMARY KEY (fid)".to_string(),
                "CREATE INDEX idx_a ON t (a)".to_string(),
                "CREATE INDEX idx_b ON t (b)".to_string(),
            ]
        );
        match err {
            LoadFailure::RebuildFailed { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].record.index_name, "idx_a");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncate_targets_resolved_partition_only() {
        let session = Arc::new(ScriptedSession::default());
        let manager = CatalogSchemaManager::new(session.clone());

        manager.truncate(&target()).await.unwrap();
        assert_eq!(
            session.statements(),
            vec!["TRUNCATE TABLE \"public\".\"performance_wa_007\"".to_string()]
        );
    }

    #[tokio::test]
    async fn count_rows_parses_text_count() {
        let session = Arc::new(
            ScriptedSession::default().on("count(*)", vec![Reply::rows(&[&["1200"]])]),
        );
        let manager = CatalogSchemaManager::new(session);
        assert_eq!(manager.count_rows(&target()).await.unwrap(), 1200);
    }
}
