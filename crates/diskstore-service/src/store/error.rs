use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can happen when accessing the store.
///
/// Lookups distinguish "not there" from "broken": a missing record surfaces
/// as `Ok(None)` from [`DiskStore::get`](super::DiskStore::get), while a
/// record that exists but cannot be decoded is a hard [`Malformed`] error.
///
/// [`Malformed`]: StoreError::Malformed
#[derive(Debug, Error)]
pub enum StoreError {
    /// The per-entry lock could not be acquired within the configured schedule.
    #[error("entry is locked: `{}`", .path.display())]
    Locked { path: PathBuf },

    /// The record or one of its payload files exists but cannot be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// Any other I/O error, passed through verbatim.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether this is an [`io::ErrorKind::NotFound`] in disguise.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

pub type StoreResult<T = ()> = Result<T, StoreError>;

/// Turns a "not found" error into `None`, passing through everything else.
pub(crate) fn catch_not_found<R>(result: io::Result<R>) -> io::Result<Option<R>> {
    match result {
        Ok(x) => Ok(Some(x)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = StoreError::from(io::Error::new(io::ErrorKind::NotFound, "oops"));
        assert!(err.is_not_found());

        let err = StoreError::from(io::Error::new(io::ErrorKind::PermissionDenied, "oops"));
        assert!(!err.is_not_found());
        assert!(!StoreError::Malformed("truncated".into()).is_not_found());
    }

    #[test]
    fn test_catch_not_found() {
        let hit = catch_not_found(Ok(42)).unwrap();
        assert_eq!(hit, Some(42));

        let miss = catch_not_found::<()>(Err(io::Error::new(io::ErrorKind::NotFound, "oops")));
        assert!(matches!(miss, Ok(None)));

        let other = catch_not_found::<()>(Err(io::Error::other("oops")));
        assert!(other.is_err());
    }
}
