//! Resolution of the partition currently active for writes.
//!
//! The partition manager records, per base table, the sequence value of the
//! write-ahead partition that accepts inserts. The physical table is named
//! `<base>_wa_<value padded to three digits>`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::{chain, LoadFailure};
use crate::session::{qualified, SqlSession};

const PARTITION_INFIX: &str = "_wa_";
const PARTITION_SUFFIX_WIDTH: usize = 3;
/// Largest sequence value that fits the three-digit partition suffix.
pub const MAX_SEQUENCE_VALUE: i64 = 999;

/// Concrete write target of one run. Produced once, never re-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTarget {
    pub schema: String,
    pub base_table: String,
    pub resolved_table: String,
    pub sequence_value: i64,
}

impl PartitionTarget {
    pub fn new(
        schema: impl Into<String>,
        base_table: impl Into<String>,
        resolved_table: impl Into<String>,
        sequence_value: i64,
    ) -> Self {
        Self {
            schema: schema.into(),
            base_table: base_table.into(),
            resolved_table: resolved_table.into(),
            sequence_value,
        }
    }

    /// Quoted `"schema"."resolved"` name.
    pub fn qualified_name(&self) -> String {
        qualified(&self.schema, &self.resolved_table)
    }

    /// Write-ahead parent (`<base>_wa`) that the partition belongs to.
    pub fn write_ahead_table(&self) -> String {
        format!("{}_wa", self.base_table)
    }
}

#[async_trait]
pub trait PartitionResolver: Send + Sync {
    async fn resolve(&self, base_table: &str) -> Result<PartitionTarget, LoadFailure>;
}

/// Resolver reading the sequence-tracking table over the run's session.
pub struct SequencePartitionResolver {
    session: Arc<dyn SqlSession>,
    schema: String,
    sequence_table: String,
}

impl SequencePartitionResolver {
    pub fn new(
        session: Arc<dyn SqlSession>,
        schema: impl Into<String>,
        sequence_table: impl Into<String>,
    ) -> Self {
        Self {
            session,
            schema: schema.into(),
            sequence_table: sequence_table.into(),
        }
    }
}

#[async_trait]
impl PartitionResolver for SequencePartitionResolver {
    async fn resolve(&self, base_table: &str) -> Result<PartitionTarget, LoadFailure> {
        let sql = format!(
            "SELECT value::text FROM {} WHERE type_name = $1",
            qualified(&self.schema, &self.sequence_table)
        );
        let rows = self
            .session
            .query_rows(&sql, &[base_table])
            .await
            .map_err(|err| LoadFailure::ResolutionQuery {
                base_table: base_table.to_string(),
                reason: chain(&err),
            })?;

        let malformed = |reason: String| LoadFailure::ResolutionQuery {
            base_table: base_table.to_string(),
            reason,
        };
        let value = match rows.as_slice() {
            [] => {
                return Err(LoadFailure::PartitionNotFound {
                    base_table: base_table.to_string(),
                })
            }
            [row] => row
                .first()
                .cloned()
                .flatten()
                .ok_or_else(|| malformed(format!("{} value is NULL", self.sequence_table)))?,
            _ => {
                return Err(malformed(format!(
                    "{} has {} rows for type_name '{base_table}', expected one",
                    self.sequence_table,
                    rows.len()
                )))
            }
        };

        let sequence_value = value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| (0..=MAX_SEQUENCE_VALUE).contains(v))
            .ok_or_else(|| {
                malformed(format!(
                    "{} value {value:?} is not a partition number (0..={MAX_SEQUENCE_VALUE})",
                    self.sequence_table
                ))
            })?;

        let target = PartitionTarget::new(
            self.schema.clone(),
            base_table,
            partition_table_name(base_table, sequence_value),
            sequence_value,
        );
        info!(
            base_table,
            partition = %target.resolved_table,
            sequence_value,
            "resolved write partition"
        );
        Ok(target)
    }
}

/// Builds the physical partition name for a sequence value.
///
/// Values are zero-padded to three digits; the resolver rejects anything
/// above [`MAX_SEQUENCE_VALUE`] before a name is built.
pub fn partition_table_name(base_table: &str, sequence_value: i64) -> String {
    format!(
        "{base_table}{infix}{sequence_value:0width$}",
        infix = PARTITION_INFIX,
        width = PARTITION_SUFFIX_WIDTH
    )
}
