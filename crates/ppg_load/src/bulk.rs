//! Bulk copy of one delimited file into the resolved partition.
//!
//! Each file is streamed into a `psql` child as a single transaction:
//! optional guard lock on the write-ahead parent, `COPY ... FROM STDIN`, the
//! raw file bytes, and the end-of-data marker. The file is never buffered
//! whole in memory.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tracing::debug;

use crate::error::{chain, LoadFailure};
use crate::exec::CommandExecutor;
use crate::partition::PartitionTarget;
use crate::session::{qualified, quote_ident, quote_literal};

const STREAM_CHUNK_BYTES: usize = 1024 * 1024;

/// Text COPY layout of the input files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFormat {
    pub delimiter: char,
    /// Text that stands for SQL NULL; empty by default.
    pub null_marker: String,
    /// Target columns in file field order.
    pub columns: Vec<String>,
}

impl Default for CopyFormat {
    fn default() -> Self {
        Self {
            delimiter: '|',
            null_marker: String::new(),
            columns: ["fid", "geom", "dtg", "taxi_id"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl CopyFormat {
    /// `COPY <table> (<columns>) FROM STDIN WITH (...)` for the target partition.
    pub fn copy_statement(&self, target: &PartitionTarget) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "COPY {} ({columns}) FROM STDIN WITH (FORMAT text, DELIMITER {}, NULL {})",
            target.qualified_name(),
            quote_literal(&self.delimiter.to_string()),
            quote_literal(&self.null_marker)
        )
    }
}

/// Copies one input file into the resolved partition.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Loads one file and returns the number of rows copied.
    async fn load(
        &self,
        target: &PartitionTarget,
        file: &Path,
        format: &CopyFormat,
    ) -> Result<u64, LoadFailure>;
}

/// Bulk loader driving `psql` through a [`CommandExecutor`].
pub struct PsqlCopyLoader {
    executor: Arc<dyn CommandExecutor>,
    copy_guard: bool,
}

impl PsqlCopyLoader {
    /// `copy_guard` adds a `SHARE UPDATE EXCLUSIVE` lock on the write-ahead
    /// parent inside each copy transaction.
    pub fn new(executor: Arc<dyn CommandExecutor>, copy_guard: bool) -> Self {
        Self {
            executor,
            copy_guard,
        }
    }

    /// Statements written before the file bytes.
    pub fn script_header(&self, target: &PartitionTarget, format: &CopyFormat) -> String {
        let mut header = String::from("BEGIN;\n");
        if self.copy_guard {
            // Keeps partition rolling off the parent while rows stream in.
            header.push_str(&format!(
                "LOCK TABLE {} IN SHARE UPDATE EXCLUSIVE MODE;\n",
                qualified(&target.schema, &target.write_ahead_table())
            ));
        }
        header.push_str(&format.copy_statement(target));
        header.push_str(";\n");
        header
    }

    async fn run_copy(
        &self,
        target: &PartitionTarget,
        file: &Path,
        format: &CopyFormat,
    ) -> Result<u64> {
        let mut source = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("open {}", file.display()))?;
        let header = self.script_header(target, format);

        let mut child = self
            .executor
            .psql(&["-X", "-v", "ON_ERROR_STOP=1"])
            .spawn()
            .with_context(|| format!("spawn {}", self.executor.describe()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("psql stdin was not piped"))?;

        let (streamed, output) = tokio::join!(
            stream_script(stdin, &header, &mut source),
            child.wait_with_output()
        );
        let output = output.context("wait for psql")?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let detail = if stderr.is_empty() {
                streamed
                    .err()
                    .map(|err| chain(&err))
                    .unwrap_or_else(|| "no diagnostics".to_string())
            } else {
                stderr
            };
            return Err(anyhow!("psql exited with {}: {detail}", output.status));
        }
        let counted = streamed.context("stream copy data")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rows = copy_tag_rows(&stdout).unwrap_or(counted);
        if rows != counted {
            debug!(reported = rows, counted, "COPY tag differs from counted lines");
        }
        Ok(rows)
    }
}

#[async_trait]
impl BulkLoader for PsqlCopyLoader {
    async fn load(
        &self,
        target: &PartitionTarget,
        file: &Path,
        format: &CopyFormat,
    ) -> Result<u64, LoadFailure> {
        self.run_copy(target, file, format)
            .await
            .map_err(|err| LoadFailure::Load {
                table: target.resolved_table.clone(),
                file: file.to_path_buf(),
                reason: chain(&err),
            })
    }
}

/// Writes header, file bytes and footer; returns the number of data lines.
async fn stream_script(
    mut stdin: ChildStdin,
    header: &str,
    source: &mut tokio::fs::File,
) -> Result<u64> {
    stdin
        .write_all(header.as_bytes())
        .await
        .context("write copy header")?;

    let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
    let mut lines = 0u64;
    let mut last_byte = None;
    loop {
        let read = source.read(&mut buf).await.context("read input file")?;
        if read == 0 {
            break;
        }
        let chunk = &buf[..read];
        lines += chunk.iter().filter(|byte| **byte == b'\n').count() as u64;
        last_byte = chunk.last().copied();
        stdin.write_all(chunk).await.context("write copy data")?;
    }
    // An unterminated last line would merge with the end-of-data marker.
    if matches!(last_byte, Some(byte) if byte != b'\n') {
        stdin.write_all(b"\n").await.context("write copy data")?;
        lines += 1;
    }

    stdin
        .write_all(b"\\.\nCOMMIT;\n")
        .await
        .context("write copy footer")?;
    stdin.shutdown().await.context("close psql stdin")?;
    Ok(lines)
}

/// Row count from psql's `COPY <n>` command tag, if printed.
pub fn copy_tag_rows(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("COPY "))
        .filter_map(|count| count.trim().parse::<u64>().ok())
        .last()
}
