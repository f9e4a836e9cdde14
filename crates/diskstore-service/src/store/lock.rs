use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use tokio::task::JoinHandle;

use crate::config::LockConfig;

use super::error::{StoreError, StoreResult, catch_not_found};

/// Suffix appended to the record file name to form the sentinel directory.
const LOCK_SUFFIX: &str = ".lock";

/// A held per-entry lock.
///
/// The lock is a directory created atomically next to the record file. While
/// the guard lives, a background task refreshes the directory's mtime at half
/// the staleness threshold, so only locks of dead holders ever go stale.
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub(super) struct LockGuard {
    path: PathBuf,
    keepalive: JoinHandle<()>,
}

impl LockGuard {
    fn new(path: PathBuf, stale: Duration) -> Self {
        let keepalive = tokio::spawn(touch_periodically(path.clone(), stale / 2));
        Self { path, keepalive }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.keepalive.abort();
        // Best-effort removal; a leftover sentinel is reclaimed as stale.
        let _ = std::fs::remove_dir(&self.path);
    }
}

async fn touch_periodically(path: PathBuf, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        if filetime::set_file_mtime(&path, FileTime::now()).is_err() {
            break;
        }
    }
}

/// Acquires the lock guarding the record file `target`.
///
/// The schedule follows the configured parameters: poll every `poll_period`
/// for up to `wait`, then up to `retries` further rounds with `retry_wait`
/// pauses in between. A sentinel untouched for longer than `stale` is treated
/// as abandoned by a dead process and broken.
pub(super) async fn acquire(target: &Path, config: &LockConfig) -> StoreResult<LockGuard> {
    let path = lock_path(target);
    for round in 0..=config.retries {
        if round > 0 {
            tokio::time::sleep(config.retry_wait).await;
        }
        if let Some(guard) = poll_for_lock(&path, config).await? {
            return Ok(guard);
        }
    }
    Err(StoreError::Locked { path })
}

/// Polls for one acquisition window, breaking stale sentinels along the way.
async fn poll_for_lock(path: &Path, config: &LockConfig) -> StoreResult<Option<LockGuard>> {
    let deadline = tokio::time::Instant::now() + config.wait;
    loop {
        match tokio::fs::create_dir(path).await {
            Ok(()) => return Ok(Some(LockGuard::new(path.to_owned(), config.stale))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                break_if_stale(path, config.stale).await?;
            }
            Err(e) => return Err(e.into()),
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(config.poll_period).await;
    }
}

async fn break_if_stale(path: &Path, stale: Duration) -> StoreResult<()> {
    // The sentinel may be released between any two steps here, so every probe
    // tolerates it disappearing.
    let Some(metadata) = catch_not_found(tokio::fs::metadata(path).await)? else {
        return Ok(());
    };
    let age = metadata.modified()?.elapsed().unwrap_or_default();
    if age >= stale {
        tracing::warn!(path = %path.display(), "breaking stale entry lock");
        catch_not_found(tokio::fs::remove_dir(path).await)?;
    }
    Ok(())
}

fn lock_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(LOCK_SUFFIX);
    os.into()
}
