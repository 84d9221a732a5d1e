use crate::config::SortPaths;
use crate::error::Result;

use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the chunk directory. With `everything`, also deletes the input and output files.
///
/// Missing paths are skipped. Returns what was actually deleted.
pub fn remove_leftovers(paths: &SortPaths, everything: bool) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if paths.chunk_dir.is_dir() {
        fs::remove_dir_all(&paths.chunk_dir)?;
        removed.push(paths.chunk_dir.clone());
    }
    if everything {
        for file in [&paths.input, &paths.output] {
            if remove_file_if_present(file)? {
                removed.push(file.clone());
            }
        }
    }
    for path in &removed {
        log::info!("Deleted {}", path.display());
    }
    Ok(removed)
}

fn remove_file_if_present(path: &Path) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    fs::remove_file(path)?;
    Ok(true)
}
