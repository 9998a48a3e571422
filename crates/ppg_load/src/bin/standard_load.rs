//! Loads `.tbl` files into the active partition, dropping and restoring
//! secondary indexes around the load.

use std::process::ExitCode;

use ppg_load::LoadMode;

#[tokio::main]
async fn main() -> ExitCode {
    ppg_load::cli::run(LoadMode::Standard).await
}
