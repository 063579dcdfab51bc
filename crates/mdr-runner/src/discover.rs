use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Names of the immediate child directories of `root`, sorted by name.
///
/// Symlinks are not followed, so a link to a directory is not a job.
pub fn list_subdirectories(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry =
            entry.with_context(|| format!("failed to read directory {}", root.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
