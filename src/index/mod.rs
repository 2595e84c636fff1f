pub mod hints;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

pub use hints::Hints;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Serialize(bincode::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialize(e)
    }
}

impl From<hints::Error> for Error {
    fn from(e: hints::Error) -> Self {
        match e {
            hints::Error::Io(e) => Error::Io(e),
            hints::Error::Serialize(e) => Error::Serialize(e),
        }
    }
}

/// Load `index.<txid>`: the key → (segment, offset) map a transaction
/// leaves behind. The sibling `hints.<txid>` file is loaded and written
/// directly by [`crate::repository::Repository`], which is the only caller
/// that ever needs the compaction bookkeeping alongside the map.
pub fn load_map_only(
    repo_path: &Path,
    txid: u64,
) -> Result<BTreeMap<[u8; 32], (u64, u64)>, Error> {
    let bytes = fs::read(repo_path.join(format!("index.{}", txid)))?;
    Ok(bincode::deserialize(&bytes)?)
}
