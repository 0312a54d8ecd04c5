use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::fs;

/// Creates the directory that will hold `file`, if it is missing.
/// Paths without a parent component (bare file names) need nothing.
pub async fn ensure_parent_directory<P: AsRef<Path>>(file: P) -> Result<()> {
    let Some(dir) = file.as_ref().parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    if let Err(e) = fs::create_dir_all(dir).await {
        error!("Failed to create directory at {:?}: {}", dir, e);
        return Err(e).with_context(|| format!("creating {}", dir.display()));
    }
    info!("Created directory at: {:?}", dir);
    Ok(())
}
