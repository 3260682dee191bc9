//! Sweeps upload directories that outlived their request.
//!
//! Requests remove their own uploads, this only catches what was left behind
//! by aborted connections or a crashed server.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::request::upload_directory;

/// Starts the periodic cleanup of [`upload_directory`].
///
/// Runs [`cleanup_uploads`] every `max_age`, but at most every 8 hours and at
/// least once a minute.
pub fn start_cleanup_task(max_age: Duration) {
    let period = max_age.clamp(Duration::from_secs(60), Duration::from_secs(8 * 60 * 60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match cleanup_uploads(&upload_directory(), max_age).await {
                Ok(removed) if removed > 0 => log::info!(removed; "swept stale uploads"),
                Ok(_) => {}
                Err(e) => log::warn!(e:debug; "cleanup failed"),
            }
        }
    });
}

/// Removes the entries of `dir` not modified within `max_age`.
///
/// Age is determined by [`std::fs::Metadata::modified`]. A missing `dir`
/// has nothing to clean.
pub async fn cleanup_uploads(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = rd.next_entry().await? {
        let modified = entry
            .metadata()
            .await?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if now.duration_since(modified).unwrap_or(Duration::ZERO) <= max_age {
            continue;
        }
        let path: PathBuf = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        log::trace!(path:debug; "deleted stale upload");
        removed += 1;
    }
    Ok(removed)
}
