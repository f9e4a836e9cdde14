//! An on-disk key/value store with expiry, sharding, and per-entry locks.
//!
//! Every key is hashed and its record written as a small JSON file below the
//! configured root, either flat (`<root>/diskstore-<digest>.json`) or sharded
//! by digest prefix (`<root>/diskstore-<d[..3]>/<d[3..]>.json`). Large byte
//! payloads inside a value do not live in the record itself but in numbered
//! `-<index>.bin` files next to it, and both kinds of file can optionally be
//! compressed, gaining a `.gz` suffix.
//!
//! Records carry their own expiry timestamp and the key they were written
//! under. Reads treat an expired record as a miss (and clean it up in the
//! background) and a record written under a colliding key as a miss as well.
//! Concurrent access to a single entry is coordinated through an advisory
//! lock directory next to the record file, see [`lock`] for the schedule.
//!
//! The store never maintains an index. Every operation goes straight to the
//! file system, which is also what makes [`clear`](DiskStore::clear) careful:
//! it only removes files matching the store's own naming scheme and leaves
//! foreign files in the same directories alone.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::config::StoreConfig;

mod clear;
mod codec;
mod error;
mod key;
mod lock;
mod value;

#[cfg(test)]
mod tests;

pub use clear::ClearStats;
pub use error::{StoreError, StoreResult};
pub use value::Value;

use codec::Record;
use error::catch_not_found;

/// The store handle.
///
/// Cheap to clone; clones share the same configuration and root directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    config: StoreConfig,
}

impl DiskStore {
    /// Opens the store, creating the root directory if it does not exist.
    pub fn new(config: StoreConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        Ok(Self { config })
    }

    /// The file system location a key's record lives at, without extension.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        key::entry_path(&self.config.path, key, self.config.subdirs)
    }

    /// Looks up the value stored under `key`.
    ///
    /// Expired entries and entries written under a digest-colliding key count
    /// as misses. A record that exists but cannot be decoded is an error, not
    /// a miss.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.read_record(key).await?.map(|record| record.val))
    }

    /// Whether a live value is stored under `key`.
    pub async fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Stores `value` under `key`.
    ///
    /// `ttl` overrides the configured default for this entry. The write
    /// happens under the entry lock, so concurrent writers to the same key
    /// serialize instead of interleaving their files.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let base = self.entry_path(key);
        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let ttl = ttl.unwrap_or(self.config.ttl);
        let record = Record {
            expire_time: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
            key: key.to_owned(),
            val: value,
        };

        let _lock = self.lock_entry(&base).await?;
        codec::write(&base, record, self.config.zip).await
    }

    /// Removes the entry stored under `key`.
    ///
    /// Returns whether an entry was there to remove.
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let base = self.entry_path(key);

        if self.config.subdirs {
            // No shard directory, nothing was ever written for this key.
            let Some(shard) = base.parent() else {
                return Ok(false);
            };
            let Some(metadata) = catch_not_found(tokio::fs::metadata(shard).await)? else {
                return Ok(false);
            };
            if metadata.permissions().readonly() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("shard directory is not writable: `{}`", shard.display()),
                )
                .into());
            }
        }

        let _lock = self.lock_entry(&base).await?;
        match codec::delete(&base, self.config.zip).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes all of the store's files below the root.
    ///
    /// Walks the root and its shard directories, deleting record and payload
    /// files by name. Foreign files and the directories themselves survive.
    pub async fn clear(&self) -> StoreResult<ClearStats> {
        let mut stats = ClearStats::default();
        clear::clear_path(&self.config.path, 2, &mut stats).await?;
        tracing::debug!(
            removed_files = stats.removed_files,
            removed_bytes = stats.removed_bytes,
            retained_files = stats.retained_files,
            "cleared store"
        );
        Ok(stats)
    }

    async fn lock_entry(&self, base: &Path) -> StoreResult<lock::LockGuard> {
        lock::acquire(&codec::primary_path(base, self.config.zip), &self.config.lock).await
    }

    async fn read_record(&self, key: &str) -> StoreResult<Option<Record>> {
        let base = self.entry_path(key);
        let record = match codec::read(&base, self.config.zip).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(first) => {
                // The record may be mid-write. Take the entry lock and look
                // again before giving up; a writer finishing in between turns
                // the broken read into a clean one.
                tracing::debug!(key, error = %first, "record read failed, retrying under lock");
                let _lock = self.lock_entry(&base).await?;
                match codec::read(&base, self.config.zip).await {
                    Ok(record) => record,
                    Err(e) if e.is_not_found() => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
        };

        if record.expire_time <= Utc::now().timestamp_millis() {
            // Expired. Clean up in the background; the outcome is discarded
            // because a failed cleanup must not fail this read.
            let store = self.clone();
            let key = key.to_owned();
            tokio::spawn(async move {
                if let Err(error) = store.delete(&key).await {
                    tracing::debug!(%key, %error, "cleanup of expired entry failed");
                }
            });
            return Ok(None);
        }

        if record.key != key {
            // Same digest, different key. The entry belongs to someone else
            // and stays untouched.
            tracing::warn!(key, stored_key = %record.key, "digest collision");
            return Ok(None);
        }

        Ok(Some(record))
    }
}
