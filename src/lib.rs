//! `vaultlog` is a local, single-writer, transactional, content-addressed
//! key-value store backed by a segmented append-only log.
//!
//! Three pieces compose bottom-up:
//!
//! - [`segment_io`] — binary framing, CRC, per-segment read/write/append,
//!   and recovery of corrupted frames.
//! - [`index`] — loading the persisted key → (segment, offset) map and the
//!   versioned `hints` file sitting alongside it.
//! - [`repository::Repository`] — transaction lifecycle, the in-memory
//!   index and supersession bookkeeping, the public key-value API,
//!   compaction, replay, and integrity checking.
//!
//! ```ignore
//! use vaultlog::Repository;
//!
//! Repository::create(path)?;
//! let mut repo = Repository::open(path, true, None)?;
//! repo.put(key, b"value")?;
//! repo.commit(false)?;
//! assert_eq!(repo.get(&key)?, b"value");
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod lock;
pub mod repository;
pub mod segment_io;

pub use error::{Error, Result};
pub use repository::Repository;

/// A content-addressing key: fixed-width, caller-supplied (this crate does
/// not hash values itself).
pub type Key = [u8; 32];
