use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-segment liveness (`segments[s]` = live PUT count) and reclaimable
/// byte counters (`compact[s]` = bytes the compactor could recover), kept
/// as a cache alongside the index so a reopen doesn't need a full replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hints {
    pub segments: BTreeMap<u64, i64>,
    pub compact: BTreeMap<u64, i64>,
}

/// On-disk hints, version-tagged by the enum variant itself rather than a
/// separate integer field: bincode already encodes a u32 variant
/// discriminant ahead of the payload, which is exactly what a `version`
/// field would otherwise do by hand.
#[derive(Debug, Serialize, Deserialize)]
enum HintsOnDisk {
    /// `compact` here is a list of segments whose sparseness needs
    /// rebuilding from the log, not a byte-count map.
    V1 {
        segments: BTreeMap<u64, i64>,
        compact: Vec<u64>,
    },
    V2 {
        segments: BTreeMap<u64, i64>,
        compact: BTreeMap<u64, i64>,
    },
}

pub enum Loaded {
    Ready(Hints),
    /// Loaded a v1 file; `to_rebuild` lists segments whose `compact` entry
    /// must be recomputed by scanning the log before this is usable.
    NeedsRebuild {
        segments: BTreeMap<u64, i64>,
        to_rebuild: Vec<u64>,
    },
}

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

pub fn load(path: &Path) -> Result<Loaded, Error> {
    let bytes = fs::read(path)?;
    let on_disk: HintsOnDisk = bincode::deserialize(&bytes)?;
    Ok(match on_disk {
        HintsOnDisk::V1 { segments, compact } => Loaded::NeedsRebuild {
            segments,
            to_rebuild: compact,
        },
        HintsOnDisk::V2 { segments, compact } => Loaded::Ready(Hints { segments, compact }),
    })
}

/// Write `hints.<txid>.tmp`, fsync it, then rename into place. The caller
/// is responsible for renaming; this only produces the durable tmp file.
pub fn write_tmp(tmp_path: &Path, hints: &Hints) -> Result<(), Error> {
    let on_disk = HintsOnDisk::V2 {
        segments: hints.segments.clone(),
        compact: hints.compact.clone(),
    };
    let bytes = bincode::serialize(&on_disk)?;
    fs::write(tmp_path, &bytes)?;
    File::open(tmp_path)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn v2_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hints.5.tmp");
        let mut hints = Hints::default();
        hints.segments.insert(3, 2);
        hints.compact.insert(3, 128);
        write_tmp(&path, &hints).unwrap();

        match load(&path).unwrap() {
            Loaded::Ready(loaded) => assert_eq!(loaded, hints),
            Loaded::NeedsRebuild { .. } => panic!("expected ready hints"),
        }
    }

    #[test]
    fn v1_reports_segments_to_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hints.1");
        let mut segments = BTreeMap::new();
        segments.insert(1, 4);
        let on_disk = HintsOnDisk::V1 {
            segments: segments.clone(),
            compact: vec![1, 2],
        };
        fs::write(&path, bincode::serialize(&on_disk).unwrap()).unwrap();

        match load(&path).unwrap() {
            Loaded::NeedsRebuild {
                segments: loaded_segments,
                to_rebuild,
            } => {
                assert_eq!(loaded_segments, segments);
                assert_eq!(to_rebuild, vec![1, 2]);
            }
            Loaded::Ready(_) => panic!("expected a rebuild request"),
        }
    }
}
