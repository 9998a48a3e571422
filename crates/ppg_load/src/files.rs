//! Input discovery: `.tbl` files directly inside the load directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const INPUT_EXTENSION: &str = "tbl";

/// Lists `*.tbl` regular files in `dir` (non-recursive), sorted by file name.
pub fn discover_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list directory {}", dir.display()))?;
        let path = entry.path();
        let is_input = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(INPUT_EXTENSION));
        if is_input && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}
