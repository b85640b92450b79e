use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

const TEMP_FILE_SUFFIX: &str = ".tmp";

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Fire-and-forget snapshot write; IO errors are logged, never propagated.
pub async fn write_atomic_async(path: PathBuf, bytes: Vec<u8>) {
    let _ = tokio::task::spawn_blocking(move || {
        if let Err(e) = write_atomic(&path, &bytes) {
            warn!("snapshot write failed: {}: {:?}", path.display(), e);
        }
    })
    .await;
}

/// Missing file is not an error: stores start empty on first run.
pub fn read_snapshot(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}
