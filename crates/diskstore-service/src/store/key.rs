use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Name prefix that marks a file or shard directory as belonging to the store.
///
/// [`clear`](super::DiskStore::clear) uses this to tell the store's own files
/// apart from foreign ones sharing the root directory.
pub(super) const STORE_PREFIX: &str = "diskstore-";

/// Number of digest characters used as the shard directory name.
const SHARD_LEN: usize = 3;

/// Hex digest a key is stored under.
pub(super) fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Computes the file system location of a key's record, without extension.
///
/// With sharding the digest is split into `<root>/diskstore-<d[..3]>/<d[3..]>`
/// so that no single directory accumulates every entry; without it the whole
/// digest becomes one file name, `<root>/diskstore-<d>`.
pub(super) fn entry_path(root: &Path, key: &str, subdirs: bool) -> PathBuf {
    let digest = key_digest(key);
    if subdirs {
        let (shard, rest) = digest.split_at(SHARD_LEN);
        root.join(format!("{STORE_PREFIX}{shard}")).join(rest)
    } else {
        root.join(format!("{STORE_PREFIX}{digest}"))
    }
}
