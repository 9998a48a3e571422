//! Like `standard-load`, but also drops the partition's primary key before
//! loading and recreates it ahead of the secondary indexes.

use std::process::ExitCode;

use ppg_load::LoadMode;

#[tokio::main]
async fn main() -> ExitCode {
    ppg_load::cli::run(LoadMode::PrimaryKeyReset).await
}
