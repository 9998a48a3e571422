//! Explicit database session shared by the resolver, schema manager, and lock
//! coordinator.
//!
//! Advisory locks are scoped to one PostgreSQL session, so every statement of
//! a run that must happen "under the lock" goes through the same
//! [`SqlSession`]. Queries return text cells; callers cast in SQL (`::text`)
//! and parse on this side.
//!
//! Host execution talks to the server directly with tokio-postgres. Container
//! execution keeps one `psql` child inside the container instead
//! ([`crate::psql_session::PsqlSession`]), so the database never has to be
//! reachable from this host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::config::{DbConfig, ExecutionTarget, LoaderConfig};
use crate::exec::CommandExecutor;
use crate::psql_session::PsqlSession;

/// One result row with every column rendered as optional text.
pub type TextRow = Vec<Option<String>>;

#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Runs a query whose columns are all text and returns every row.
    async fn query_rows(&self, sql: &str, params: &[&str]) -> Result<Vec<TextRow>>;

    /// Runs one statement without bind parameters, returning affected rows.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Ends the session. Locks still held are released by the server.
    async fn shutdown(&self) {}
}

/// Opens the run's session for the configured execution target.
pub async fn open_session(
    config: &LoaderConfig,
    executor: Arc<dyn CommandExecutor>,
) -> Result<Arc<dyn SqlSession>> {
    match &config.execution {
        ExecutionTarget::Host => Ok(Arc::new(PgSession::connect(&config.db).await?)),
        ExecutionTarget::Container { name } => {
            info!(container = %name, "database session runs inside the container");
            Ok(Arc::new(PsqlSession::spawn(executor).await?))
        }
    }
}

/// tokio-postgres backed session; the connection driver runs on its own task.
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Connects over TCP and spawns the connection driver.
    pub async fn connect(db: &DbConfig) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&db.host)
            .port(db.port)
            .user(&db.user)
            .dbname(&db.database)
            .application_name("ppg_load")
            .connect_timeout(Duration::from_secs(10));
        if !db.password.is_empty() {
            config.password(&db.password);
        }

        let (client, connection) = config.connect(NoTls).await.with_context(|| {
            format!(
                "connect to postgres at {}:{} as {} (db {})",
                db.host, db.port, db.user, db.database
            )
        })?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres session terminated");
            }
        });
        Ok(Self { client })
    }
}

#[async_trait]
impl SqlSession for PgSession {
    async fn query_rows(&self, sql: &str, params: &[&str]) -> Result<Vec<TextRow>> {
        debug!(sql, "query");
        let bound = params
            .iter()
            .map(|value| value as &(dyn ToSql + Sync))
            .collect::<Vec<_>>();
        let rows = self
            .client
            .query(sql, &bound)
            .await
            .with_context(|| format!("query failed: {sql}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let cell: Option<String> = row
                    .try_get(idx)
                    .with_context(|| format!("decode column {idx} as text"))?;
                cells.push(cell);
            }
            out.push(cells);
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(sql, "execute");
        self.client
            .execute(sql, &[])
            .await
            .with_context(|| format!("statement failed: {sql}"))
    }
}

/// Quotes one SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a schema-qualified relation name.
pub fn qualified(schema: &str, relation: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(relation))
}

/// Quotes one SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
