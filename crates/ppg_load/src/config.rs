//! Environment-driven configuration.
//!
//! Database connectivity keeps the `PG_*` variable names operators already
//! use for the PostGIS deployment; loader tuning lives under `PPG_LOAD_*`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Connection parameters for both the session and the `psql` child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbConfig {
    pub user: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// Where database command-line tools run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionTarget {
    /// `psql` on this host, reaching the server over TCP.
    Host,
    /// `psql` inside the named container via `docker exec`.
    Container { name: String },
}

/// Full loader configuration for one process.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub db: DbConfig,
    pub execution: ExecutionTarget,
    /// Schema holding the partitions and the sequence-tracking table.
    pub schema: String,
    /// Sequence-tracking table recording the active partition per base table.
    pub sequence_table: String,
    pub lock_timeout: Duration,
    pub log_dir: PathBuf,
    pub psql_bin: String,
    pub docker_bin: String,
    /// Take `SHARE UPDATE EXCLUSIVE` on the write-ahead parent around each COPY.
    pub copy_guard: bool,
}

impl LoaderConfig {
    /// Loads configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let db = DbConfig {
            user: text("PG_USER", "postgres"),
            database: text("PG_DB", "postgres"),
            host: text("PG_HOST", "localhost"),
            port: parse_port(lookup("PG_PORT"), 5432)?,
            // Passwords are taken verbatim; surrounding spaces may be significant.
            password: lookup("PG_PASSWORD").unwrap_or_default(),
        };

        let container = text("PG_CONTAINER_NAME", "");
        let execution = if container.is_empty() {
            ExecutionTarget::Host
        } else {
            ExecutionTarget::Container { name: container }
        };

        let lock_timeout_secs = parse_u64(lookup("PPG_LOAD_LOCK_TIMEOUT_SECS"), 300)?;

        Ok(Self {
            db,
            execution,
            schema: text("PPG_LOAD_SCHEMA", "public"),
            sequence_table: text("PPG_LOAD_SEQUENCE_TABLE", "geomesa_wa_seq"),
            lock_timeout: Duration::from_secs(lock_timeout_secs),
            log_dir: PathBuf::from(text("PPG_LOAD_LOG_DIR", "logs")),
            psql_bin: text("PPG_LOAD_PSQL_BIN", "psql"),
            docker_bin: text("PPG_LOAD_DOCKER_BIN", "docker"),
            copy_guard: parse_bool(lookup("PPG_LOAD_COPY_GUARD"), true)?,
        })
    }
}

fn parse_port(value: Option<String>, default_port: u16) -> Result<u16> {
    match value.filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port value: {raw}")),
        None => Ok(default_port),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value.filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value.filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .to_ascii_lowercase()
            .parse::<bool>()
            .with_context(|| format!("invalid bool value: {raw}")),
        None => Ok(default_value),
    }
}
