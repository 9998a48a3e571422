//! Where database command-line tools are executed.
//!
//! The host and container variants differ only in how a `psql` process is
//! launched; everything written to it and read from it is identical.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::config::{DbConfig, ExecutionTarget, LoaderConfig};

pub trait CommandExecutor: Send + Sync {
    /// Builds a `psql` invocation with connection arguments and `extra_args`.
    /// stdin/stdout/stderr are piped.
    fn psql(&self, extra_args: &[&str]) -> Command;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Runs `psql` on this host over TCP.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    psql_bin: String,
    db: DbConfig,
}

impl HostExecutor {
    pub fn new(psql_bin: impl Into<String>, db: DbConfig) -> Self {
        Self {
            psql_bin: psql_bin.into(),
            db,
        }
    }
}

impl CommandExecutor for HostExecutor {
    fn psql(&self, extra_args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.psql_bin);
        cmd.arg("-h")
            .arg(&self.db.host)
            .arg("-p")
            .arg(self.db.port.to_string())
            .arg("-U")
            .arg(&self.db.user)
            .arg("-d")
            .arg(&self.db.database)
            .args(extra_args);
        if !self.db.password.is_empty() {
            cmd.env("PGPASSWORD", &self.db.password);
        }
        piped(&mut cmd);
        cmd
    }

    fn describe(&self) -> String {
        format!("{} -h {} -p {}", self.psql_bin, self.db.host, self.db.port)
    }
}

/// Runs `psql` inside a container through `docker exec -i`.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    docker_bin: String,
    container: String,
    db: DbConfig,
}

impl ContainerExecutor {
    pub fn new(docker_bin: impl Into<String>, container: impl Into<String>, db: DbConfig) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            container: container.into(),
            db,
        }
    }
}

impl CommandExecutor for ContainerExecutor {
    fn psql(&self, extra_args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("exec").arg("-i");
        if !self.db.password.is_empty() {
            // `-e NAME` without a value forwards it from the docker client's
            // environment, keeping the password off the command line.
            cmd.arg("-e").arg("PGPASSWORD");
            cmd.env("PGPASSWORD", &self.db.password);
        }
        cmd.arg(&self.container)
            .arg("psql")
            .arg("-U")
            .arg(&self.db.user)
            .arg("-d")
            .arg(&self.db.database)
            .args(extra_args);
        piped(&mut cmd);
        cmd
    }

    fn describe(&self) -> String {
        format!("{} exec -i {} psql", self.docker_bin, self.container)
    }
}

fn piped(cmd: &mut Command) {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

/// Picks the executor for the configured execution target.
pub fn executor_for(config: &LoaderConfig) -> Arc<dyn CommandExecutor> {
    match &config.execution {
        ExecutionTarget::Host => Arc::new(HostExecutor::new(
            config.psql_bin.clone(),
            config.db.clone(),
        )),
        ExecutionTarget::Container { name } => Arc::new(ContainerExecutor::new(
            config.docker_bin.clone(),
            name.clone(),
            config.db.clone(),
        )),
    }
}
