use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::{index, lock, segment_io};

/// Errors surfaced by the public [`crate::Repository`] API.
///
/// Internal modules keep their own small `Error` enums (see
/// [`segment_io::Error`], [`index::Error`], [`lock::Error`]) and this type
/// maps them onto the taxonomy a caller actually needs to branch on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("repository {0} does not exist")]
    DoesNotExist(PathBuf),

    #[error("repository {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("{0} is not a valid repository, check its config")]
    InvalidRepository(PathBuf),

    #[error("inconsistency detected in {path}, run check with repair")]
    CheckNeeded { path: PathBuf },

    #[error("object with key {key} not found in repository {path}")]
    ObjectNotFound { key: String, path: PathBuf },

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("failed to acquire repository lock: {0}")]
    LockError(String),

    #[error("timed out acquiring repository lock: {0}")]
    LockErrorT(String),

    #[error("internal OS error")]
    InternalOSError(#[source] io::Error),

    #[error("{0} is in append-only mode")]
    AppendOnly(PathBuf),
}

pub fn hex32(key: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in key {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::InternalOSError(e)
    }
}

impl From<segment_io::Error> for Error {
    fn from(e: segment_io::Error) -> Self {
        match e {
            segment_io::Error::Io(e) => Error::InternalOSError(e),
            segment_io::Error::Integrity(msg) => Error::IntegrityError(msg),
            segment_io::Error::SegmentFull => {
                Error::IntegrityError("segment full outside of a raise_full write".into())
            }
        }
    }
}

impl From<index::Error> for Error {
    fn from(e: index::Error) -> Self {
        match e {
            index::Error::Io(e) => Error::InternalOSError(e),
            index::Error::Serialize(e) => Error::IntegrityError(e.to_string()),
        }
    }
}

impl From<lock::Error> for Error {
    fn from(e: lock::Error) -> Self {
        match e {
            lock::Error::Io(e) => Error::LockError(e.to_string()),
            lock::Error::Timeout => Error::LockErrorT("timed out waiting for lock".into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
