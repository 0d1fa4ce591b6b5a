use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for `denote.db` (`~/.local/share/denote/` and
/// friends), created if missing.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "denote")
        .context("could not determine platform data directory")?;
    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}
