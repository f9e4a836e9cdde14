use std::path::Path;

use futures::future::BoxFuture;

use super::error::{StoreResult, catch_not_found};
use super::key::STORE_PREFIX;

/// Accumulated results of a [`clear`](super::DiskStore::clear) walk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearStats {
    /// Store files removed.
    pub removed_files: usize,
    /// Total size of the removed files in bytes.
    pub removed_bytes: u64,
    /// Foreign files left in place.
    pub retained_files: usize,
}

/// Removes the store's files below `path`, at most `depth` levels deep.
///
/// Only files whose names match the store's own naming scheme are touched;
/// anything else sharing the directory is left alone and tallied as retained.
/// Directories themselves are kept, empty or not.
pub(super) fn clear_path<'a>(
    path: &'a Path,
    depth: i32,
    stats: &'a mut ClearStats,
) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(async move {
        if depth < 0 {
            return Ok(());
        }

        let metadata = tokio::fs::metadata(path).await?;
        if metadata.is_dir() {
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let child = entry.path();
                clear_path(&child, depth - 1, &mut *stats).await?;
            }
        } else if is_store_file(path) {
            if catch_not_found(tokio::fs::remove_file(path).await)?.is_some() {
                stats.removed_files += 1;
                stats.removed_bytes += metadata.len();
            }
        } else {
            stats.retained_files += 1;
        }
        Ok(())
    })
}

/// Says whether `path` names one of the store's own files.
///
/// Record files are `<stem>.json`, payload files `<stem>-<index>.bin`, both
/// optionally with a trailing `.gz`. The stem is the full `diskstore-<hex>`
/// name for flat entries, or a bare hex digest remainder inside a
/// `diskstore-<hex>` shard directory.
fn is_store_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    let base = name.strip_suffix(".gz").unwrap_or(name);
    let stem = if let Some(stem) = base.strip_suffix(".json") {
        stem
    } else if let Some(stem) = strip_payload_suffix(base) {
        stem
    } else {
        return false;
    };

    if let Some(digest) = stem.strip_prefix(STORE_PREFIX) {
        return is_hex(digest);
    }

    let parent_is_shard = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(STORE_PREFIX))
        .is_some_and(is_hex);
    parent_is_shard && is_hex(stem)
}

/// Strips a `-<index>.bin` suffix, returning the stem in front of it.
fn strip_payload_suffix(name: &str) -> Option<&str> {
    let rest = name.strip_suffix(".bin")?;
    let (stem, index) = rest.rsplit_once('-')?;
    (!index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())).then_some(stem)
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognizes_store_files() {
        // Flat entries in the root.
        assert!(is_store_file(Path::new("cache/diskstore-18f6b0.json")));
        assert!(is_store_file(Path::new("cache/diskstore-18f6b0.json.gz")));
        assert!(is_store_file(Path::new("cache/diskstore-18f6b0-0.bin")));
        assert!(is_store_file(Path::new("cache/diskstore-18f6b0-12.bin.gz")));

        // Sharded entries, hex stem under a shard directory.
        assert!(is_store_file(Path::new("cache/diskstore-18f/6b02aa.json")));
        assert!(is_store_file(Path::new("cache/diskstore-18f/6b02aa-3.bin")));
    }

    #[test]
    fn test_preserves_foreign_files() {
        assert!(!is_store_file(Path::new("cache/readme.txt")));
        assert!(!is_store_file(Path::new("cache/other.json")));
        assert!(!is_store_file(Path::new("cache/diskstore-xyz.json")));
        assert!(!is_store_file(Path::new("cache/diskstore-18f6b0.bin")));
        assert!(!is_store_file(Path::new("cache/diskstore-18f/notes.txt")));
        assert!(!is_store_file(Path::new("cache/subdir/6b02aa.json")));
        assert!(!is_store_file(Path::new("cache/diskstore-18f/6b02-x.bin")));
    }
}
