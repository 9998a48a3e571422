//! [`SqlSession`] over one long-lived `psql` child.
//!
//! Container execution cannot assume the database port is reachable from
//! this host, so every statement of the run is written to a single
//! `docker exec -i <container> psql` process. One child means one backend,
//! which keeps session advisory locks and DDL on the same connection exactly
//! like the direct session.
//!
//! Each request is the statement followed by an `\echo` / `\warn` marker
//! pair carrying psql's `ERROR` and `ROW_COUNT` variables, so the reply on
//! stdout and the diagnostics on stderr can both be cut at the right place.
//! Needs psql 13 or newer. Result values must not contain newlines.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::exec::CommandExecutor;
use crate::session::{quote_literal, SqlSession, TextRow};

const FIELD_SEPARATOR: &str = "\u{1f}";
const NULL_MARKER: &str = "\u{1e}";
const END_MARKER: &str = "__ppg_load_end_";

struct PsqlIo {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
    requests: u64,
}

/// Output of one statement.
struct Reply {
    rows: Vec<String>,
    row_count: u64,
}

/// One `psql` child serving every statement of a run, in order.
pub struct PsqlSession {
    io: Mutex<PsqlIo>,
    target: String,
}

impl PsqlSession {
    /// Starts `psql` through `executor` and checks that it answers.
    pub async fn spawn(executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let null_display = format!("null={NULL_MARKER}");
        let target = executor.describe();
        let mut child = executor
            .psql(&[
                "-X",
                "-q",
                "-A",
                "-t",
                "-F",
                FIELD_SEPARATOR,
                "-P",
                &null_display,
                "-v",
                "VERBOSITY=terse",
            ])
            .spawn()
            .with_context(|| format!("spawn {target}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("psql stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("psql stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("psql stderr was not piped"))?;

        let session = Self {
            io: Mutex::new(PsqlIo {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                stderr: BufReader::new(stderr).lines(),
                requests: 0,
            }),
            target,
        };
        session
            .request("SELECT version()")
            .await
            .with_context(|| format!("open psql session via {}", session.target))?;
        debug!(via = %session.target, "psql session ready");
        Ok(session)
    }

    async fn request(&self, sql: &str) -> Result<Reply> {
        let mut io = self.io.lock().await;
        io.requests += 1;
        let marker = format!("{END_MARKER}{}", io.requests);
        let statement = sql.trim_end().trim_end_matches(';');
        let script = format!("{statement};\n\\echo {marker} :ERROR :ROW_COUNT\n\\warn {marker}\n");
        io.stdin
            .write_all(script.as_bytes())
            .await
            .context("write to psql")?;
        io.stdin.flush().await.context("flush psql stdin")?;

        let reply_prefix = format!("{marker} ");
        let mut rows = Vec::new();
        let status = loop {
            let line = io
                .stdout
                .next_line()
                .await
                .context("read psql output")?
                .ok_or_else(|| anyhow!("psql session ended"))?;
            if let Some(status) = line.strip_prefix(&reply_prefix) {
                break status.to_string();
            }
            rows.push(line);
        };

        let mut diagnostics = Vec::new();
        loop {
            let line = io
                .stderr
                .next_line()
                .await
                .context("read psql diagnostics")?
                .ok_or_else(|| anyhow!("psql session ended"))?;
            if line.trim_end() == marker {
                break;
            }
            diagnostics.push(line);
        }

        let mut fields = status.split_whitespace();
        let errored = fields.next() == Some("true")
            || diagnostics
                .iter()
                .any(|line| line.starts_with("ERROR:") || line.starts_with("FATAL:"));
        let row_count = fields
            .next()
            .and_then(|count| count.parse::<u64>().ok())
            .unwrap_or(rows.len() as u64);

        if errored {
            bail!("{}", diagnostics.join("; "));
        }
        for line in &diagnostics {
            debug!(message = %line, "psql notice");
        }
        Ok(Reply { rows, row_count })
    }
}

#[async_trait]
impl SqlSession for PsqlSession {
    async fn query_rows(&self, sql: &str, params: &[&str]) -> Result<Vec<TextRow>> {
        let bound = bind_literals(sql, params)?;
        debug!(sql = %bound, "query");
        let reply = self
            .request(&bound)
            .await
            .with_context(|| format!("query failed: {sql}"))?;
        Ok(reply
            .rows
            .iter()
            .map(|line| {
                line.split(FIELD_SEPARATOR)
                    .map(|cell| (cell != NULL_MARKER).then(|| cell.to_string()))
                    .collect()
            })
            .collect())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(sql, "execute");
        let reply = self
            .request(sql)
            .await
            .with_context(|| format!("statement failed: {sql}"))?;
        Ok(reply.row_count)
    }

    async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        if let Err(err) = io.stdin.write_all(b"\\q\n").await {
            debug!(error = %err, "psql stdin already closed");
        }
        if let Err(err) = io.stdin.shutdown().await {
            debug!(error = %err, "psql stdin already closed");
        }
        match io.child.wait().await {
            Ok(status) if status.success() => debug!(via = %self.target, "psql session closed"),
            Ok(status) => warn!(via = %self.target, %status, "psql session exited uncleanly"),
            Err(err) => warn!(via = %self.target, error = %err, "psql session did not exit"),
        }
    }
}

/// Inlines `$n` placeholders as quoted literals; psql has no bind step here.
fn bind_literals(sql: &str, params: &[&str]) -> Result<String> {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let mut digits = String::new();
        while let Some(digit) = chars.next_if(|c| c.is_ascii_digit()) {
            digits.push(digit);
        }
        if digits.is_empty() {
            out.push('$');
            continue;
        }
        let value = digits
            .parse::<usize>()
            .ok()
            .and_then(|idx| idx.checked_sub(1))
            .and_then(|idx| params.get(idx))
            .ok_or_else(|| {
                anyhow!(
                    "statement references ${digits} but {} parameter(s) were given",
                    params.len()
                )
            })?;
        out.push_str(&quote_literal(value));
    }
    Ok(out)
}
