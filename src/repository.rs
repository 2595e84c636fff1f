use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::{Config, README_BANNER};
use crate::error::{hex32, Error, Result};
use crate::index::{self, hints, Hints};
use crate::lock::UpgradableLock;
use crate::segment_io::{self, ObjectRecord, SegmentIO, Tag, MAX_OBJECT_SIZE};

/// A local, single-writer, transactional, content-addressed key-value store.
///
/// Owns its [`SegmentIO`] (the log) and [`UpgradableLock`] (the repository
/// lock) exclusively; both are released on `close`/`Drop`. Mirrors the
/// original's three-attribute state — `index`, `segments`, `compact` — kept
/// as separate fields rather than bundled, because only `index` survives
/// outside an active transaction.
pub struct Repository {
    path: PathBuf,
    config: Config,
    lock: UpgradableLock,
    io: SegmentIO,
    active_txn: bool,
    index: Option<BTreeMap<[u8; 32], (u64, u64)>>,
    segments: BTreeMap<u64, i64>,
    compact: BTreeMap<u64, i64>,
}

impl Repository {
    /// Create an empty repository layout at `path`. Does not open it.
    pub fn create(path: &Path) -> Result<()> {
        if path.exists() && (!path.is_dir() || fs::read_dir(path)?.next().is_some()) {
            return Err(Error::AlreadyExists(path.to_path_buf()));
        }
        if !path.exists() {
            fs::create_dir(path)?;
        }
        fs::write(path.join("README"), README_BANNER)?;
        fs::create_dir(path.join("data"))?;
        Config::fresh(false).save(&path.join("config"))?;
        Ok(())
    }

    pub fn open(path: &Path, exclusive: bool, lock_wait: Option<Duration>) -> Result<Self> {
        if !path.is_dir() {
            return Err(Error::DoesNotExist(path.to_path_buf()));
        }
        let lock = UpgradableLock::acquire(&path.join("lock"), exclusive, lock_wait)?;
        let config = Config::load(&path.join("config"))
            .map_err(|_| Error::InvalidRepository(path.to_path_buf()))?;
        if config.version != 1 {
            return Err(Error::InvalidRepository(path.to_path_buf()));
        }
        let io = SegmentIO::new(path.to_path_buf(), config.max_segment_size, config.segments_per_dir);
        Ok(Self {
            path: path.to_path_buf(),
            config,
            lock,
            io,
            active_txn: false,
            index: None,
            segments: BTreeMap::new(),
            compact: BTreeMap::new(),
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.io.close()?;
        self.lock.release();
        Ok(())
    }

    /// Refuses on append-only repositories. Removes `config` before the
    /// rest of the tree so a crash mid-destroy leaves a repo that fails
    /// `open`'s version check rather than silently reopening half-deleted.
    pub fn destroy(mut self) -> Result<()> {
        if self.config.append_only {
            return Err(Error::AppendOnly(self.path.clone()));
        }
        self.close()?;
        fs::remove_file(self.path.join("config"))?;
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    pub fn break_lock(path: &Path) -> std::io::Result<()> {
        UpgradableLock::break_lock(&path.join("lock"))
    }

    pub fn save_key(&mut self, keydata: &str) -> Result<()> {
        self.config.key = Some(keydata.to_string());
        self.config.save(&self.path.join("config"))?;
        Ok(())
    }

    pub fn load_key(&self) -> Result<String> {
        self.config
            .key
            .clone()
            .ok_or_else(|| Error::IntegrityError("no key material stored in this repository".into()))
    }

    /// No-op: kept for API parity with a networked-repository variant that
    /// could warm a read cache ahead of a batch of `get`s. This crate only
    /// ever talks to the local filesystem, so there is nothing to preload.
    pub fn preload(&self, _ids: &[[u8; 32]]) {}

    pub fn get(&mut self, key: &[u8; 32]) -> Result<Vec<u8>> {
        self.ensure_index()?;
        let location = self.index.as_ref().and_then(|m| m.get(key).copied());
        match location {
            Some((segment, offset)) => Ok(self.io.read(segment, offset, key)?),
            None => Err(Error::ObjectNotFound {
                key: hex32(key),
                path: self.path.clone(),
            }),
        }
    }

    pub fn contains(&mut self, key: &[u8; 32]) -> Result<bool> {
        self.ensure_index()?;
        Ok(self.index.as_ref().is_some_and(|m| m.contains_key(key)))
    }

    pub fn len(&mut self) -> Result<usize> {
        self.ensure_index()?;
        Ok(self.index.as_ref().map_or(0, |m| m.len()))
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn list(&mut self, limit: Option<usize>, marker: Option<&[u8; 32]>) -> Result<Vec<[u8; 32]>> {
        self.ensure_index()?;
        let map = self.index.as_ref().expect("ensure_index just populated it");
        let bound = match marker {
            Some(k) => Bound::Included(*k),
            None => Bound::Unbounded,
        };
        let iter = map.range((bound, Bound::Unbounded)).map(|(k, _)| *k);
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    pub fn put(&mut self, key: [u8; 32], value: &[u8]) -> Result<()> {
        if value.len() > MAX_OBJECT_SIZE {
            return Err(Error::IntegrityError(format!(
                "value for {} exceeds max object size",
                hex32(&key)
            )));
        }
        if !self.active_txn {
            let txid = self.transaction_id()?;
            self.prepare_txn(txid, true)?;
        }
        if let Some((old_segment, old_offset)) = self.index.as_ref().and_then(|m| m.get(&key).copied()) {
            *self.segments.entry(old_segment).or_insert(0) -= 1;
            let size = self.io.read_size(old_segment, old_offset, &key)?;
            *self.compact.entry(old_segment).or_insert(0) += size as i64;
            let (delete_segment, delete_size) = self.io.write_delete(&key, false)?;
            *self.compact.entry(delete_segment).or_insert(0) += delete_size as i64;
            self.segments.entry(delete_segment).or_insert(0);
        }
        let (segment, offset) = self.io.write_put(&key, value, false)?;
        *self.segments.entry(segment).or_insert(0) += 1;
        self.index
            .as_mut()
            .expect("prepare_txn populates the index")
            .insert(key, (segment, offset));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8; 32]) -> Result<()> {
        if !self.active_txn {
            let txid = self.transaction_id()?;
            self.prepare_txn(txid, true)?;
        }
        let (segment, offset) = self
            .index
            .as_mut()
            .expect("prepare_txn populates the index")
            .remove(key)
            .ok_or_else(|| Error::ObjectNotFound {
                key: hex32(key),
                path: self.path.clone(),
            })?;
        *self.segments.entry(segment).or_insert(0) -= 1;
        let size = self.io.read_size(segment, offset, key)?;
        *self.compact.entry(segment).or_insert(0) += size as i64;
        let (delete_segment, delete_size) = self.io.write_delete(key, false)?;
        *self.compact.entry(delete_segment).or_insert(0) += delete_size as i64;
        self.segments.entry(delete_segment).or_insert(0);
        Ok(())
    }

    pub fn commit(&mut self, save_space: bool) -> Result<()> {
        self.io.write_commit()?;
        if !self.config.append_only {
            self.compact_segments(save_space)?;
        }
        self.write_index()?;
        self.rollback();
        Ok(())
    }

    pub fn rollback(&mut self) {
        self.index = None;
        self.active_txn = false;
    }

    /// Rebuild a fresh index from every segment, reporting (and optionally
    /// repairing) any integrity failures found along the way. Returns
    /// whether the repository was (or already is) consistent.
    pub fn check(&mut self, repair: bool, save_space: bool) -> Result<bool> {
        if self.config.append_only && repair {
            return Err(Error::AppendOnly(self.path.clone()));
        }
        let mut error_found = false;
        info!("starting repository check");
        assert!(!self.active_txn);

        let (mut transaction_id, current_index) = match self.transaction_id() {
            Ok(txid) => {
                let idx = self.open_index(txid, true).ok();
                (txid, idx)
            }
            Err(_) => (self.io.get_segments_transaction_id()?, None),
        };
        if transaction_id.is_none() {
            transaction_id = self.get_index_transaction_id()?;
        }
        if transaction_id.is_none() {
            transaction_id = self.io.get_latest_segment()?;
        }
        if repair {
            if let Some(txid) = transaction_id {
                self.io.cleanup(txid)?;
            }
        }
        let segments_transaction_id = self.io.get_segments_transaction_id()?;
        self.prepare_txn(None, true)?;

        for (segment, _filename) in self.io.segment_iterator(false)? {
            if let Some(txid) = transaction_id {
                if segment > txid {
                    continue;
                }
            }
            let objects = match self.io.iter_objects(segment, false, true) {
                Ok(objects) => objects,
                Err(e) => {
                    error_found = true;
                    error!("{}", describe(&e));
                    if repair {
                        self.io.recover_segment(segment)?;
                        self.io.iter_objects(segment, false, true)?
                    } else {
                        Vec::new()
                    }
                }
            };
            self.update_index(segment, &objects)?;
        }

        if repair && segments_transaction_id.is_none() {
            let txid = transaction_id.unwrap_or(0);
            error!("adding commit tag to segment {}", txid + 1);
            error_found = true;
            self.io.synthesize_commit_at(txid + 1)?;
        }

        if !repair {
            if let Some(current_index) = current_index.as_ref() {
                let rebuilt = self.index.as_ref().expect("prepare_txn populates the index");
                if current_index.len() != rebuilt.len() {
                    error_found = true;
                    error!(
                        "index object count mismatch: {} != {}",
                        current_index.len(),
                        rebuilt.len()
                    );
                } else {
                    for (key, value) in current_index {
                        if rebuilt.get(key) != Some(value) {
                            error_found = true;
                            error!("index mismatch for key {}", hex32(key));
                        }
                    }
                }
            }
        }

        if repair {
            self.compact_segments(save_space)?;
            self.write_index()?;
        }
        self.rollback();

        if error_found {
            if repair {
                info!("repository check complete, errors found and repaired");
            } else {
                error!("repository check complete, errors found");
            }
        } else {
            info!("repository check complete, no problems found");
        }
        Ok(!error_found || repair)
    }

    fn ensure_index(&mut self) -> Result<()> {
        if self.index.is_none() {
            let txid = self.transaction_id()?;
            self.index = Some(self.open_index(txid, true)?);
        }
        Ok(())
    }

    fn get_index_transaction_id(&self) -> std::io::Result<Option<u64>> {
        let mut max_id = None;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some(rest) = name.strip_prefix("index.") {
                if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) && entry.metadata()?.len() != 0 {
                    let n: u64 = rest.parse().expect("validated all-digit");
                    max_id = Some(max_id.map_or(n, |m: u64| m.max(n)));
                }
            }
        }
        Ok(max_id)
    }

    fn check_transaction(&mut self) -> Result<()> {
        let index_txid = self.get_index_transaction_id()?;
        let segments_txid = self.io.get_segments_transaction_id()?;
        if index_txid.is_some() && segments_txid.is_none() {
            return Err(Error::CheckNeeded {
                path: self.path.clone(),
            });
        }
        if index_txid != segments_txid {
            let replay_from = match (index_txid, segments_txid) {
                (Some(i), Some(s)) if i > s => None,
                _ => index_txid,
            };
            self.replay_segments(replay_from, segments_txid)?;
        }
        Ok(())
    }

    fn transaction_id(&mut self) -> Result<Option<u64>> {
        self.check_transaction()?;
        Ok(self.get_index_transaction_id()?)
    }

    /// Load `index.<txid>`, retrying once via a forced rebuild-and-commit
    /// when the file is missing or fails to parse.
    fn open_index(&mut self, transaction_id: Option<u64>, auto_recover: bool) -> Result<BTreeMap<[u8; 32], (u64, u64)>> {
        let txid = match transaction_id {
            Some(t) => t,
            None => return Ok(BTreeMap::new()),
        };
        match index::load_map_only(&self.path, txid) {
            Ok(map) => Ok(map),
            Err(_) => {
                warn!("repository index missing or corrupted, trying to recover");
                let _ = fs::remove_file(self.path.join(format!("index.{}", txid)));
                if !auto_recover {
                    return Err(Error::IntegrityError(
                        "repository index missing or corrupted".into(),
                    ));
                }
                let recovered_txid = self.transaction_id()?;
                self.prepare_txn(recovered_txid, true)?;
                self.commit(false)?;
                let final_txid = self.transaction_id()?;
                self.open_index(final_txid, false)
            }
        }
    }

    fn prepare_txn(&mut self, transaction_id: Option<u64>, do_cleanup: bool) -> Result<()> {
        self.active_txn = true;
        if let Err(e) = self.lock.upgrade(None) {
            self.active_txn = false;
            return Err(e.into());
        }
        if self.index.is_none() || transaction_id.is_none() {
            self.index = Some(self.open_index(transaction_id, false)?);
        }
        match transaction_id {
            None => {
                self.segments = BTreeMap::new();
                self.compact = BTreeMap::new();
            }
            Some(txid) => {
                if do_cleanup {
                    self.io.cleanup(txid)?;
                }
                let hints_path = self.path.join(format!("hints.{}", txid));
                let index_path = self.path.join(format!("index.{}", txid));
                match hints::load(&hints_path) {
                    Ok(hints::Loaded::Ready(hints)) => {
                        self.segments = hints.segments;
                        self.compact = hints.compact;
                    }
                    Ok(hints::Loaded::NeedsRebuild { segments, to_rebuild }) => {
                        debug!("upgrading from v1 hints.{}", txid);
                        self.segments = segments;
                        self.compact = BTreeMap::new();
                        for segment in to_rebuild {
                            debug!("rebuilding sparse info for segment {}", segment);
                            self.rebuild_sparse(segment)?;
                        }
                        debug!("upgrade to v2 hints complete");
                    }
                    Err(_) => {
                        warn!("repository hints file missing or corrupted, trying to recover");
                        let _ = fs::remove_file(&hints_path);
                        fs::remove_file(&index_path)?;
                        self.check_transaction()?;
                        return self.prepare_txn(transaction_id, do_cleanup);
                    }
                }
            }
        }
        Ok(())
    }

    /// Write `hints.<txid>` then `index.<txid>` (fsync only covers hints,
    /// matching the original: the index can always be rebuilt by replay if
    /// corrupt, so it doesn't need the same durability guarantee), append a
    /// transactions-log line when `append_only`, then drop every stale
    /// `index.*`/`hints.*` file.
    fn write_index(&mut self) -> Result<()> {
        let txid = self
            .io
            .get_segments_transaction_id()?
            .expect("write_commit just created a committed segment");

        let hints = Hints {
            segments: std::mem::take(&mut self.segments),
            compact: std::mem::take(&mut self.compact),
        };
        let hints_tmp = self.path.join(format!("hints.{}.tmp", txid));
        hints::write_tmp(&hints_tmp, &hints).map_err(index::Error::from)?;
        fs::rename(&hints_tmp, self.path.join(format!("hints.{}", txid)))?;

        let index_tmp = self.path.join("index.tmp");
        let map = self.index.take().unwrap_or_default();
        let bytes = bincode::serialize(&map).map_err(index::Error::from)?;
        fs::write(&index_tmp, bytes)?;
        fs::rename(&index_tmp, self.path.join(format!("index.{}", txid)))?;

        if self.config.append_only {
            let mut log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.join("transactions"))?;
            writeln!(
                log,
                "transaction {}, UTC time {}",
                txid,
                Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f")
            )?;
        }

        let suffix = format!(".{}", txid);
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !(name.starts_with("index.") || name.starts_with("hints.")) {
                continue;
            }
            if name.ends_with(&suffix) {
                continue;
            }
            fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    fn replay_segments(&mut self, index_transaction_id: Option<u64>, segments_transaction_id: Option<u64>) -> Result<()> {
        self.prepare_txn(index_transaction_id, false)?;
        let result = (|| -> Result<()> {
            for (segment, _filename) in self.io.segment_iterator(false)? {
                if let Some(itx) = index_transaction_id {
                    if segment <= itx {
                        continue;
                    }
                }
                match segments_transaction_id {
                    Some(stx) if segment > stx => break,
                    Some(_) => {}
                    None => break,
                }
                let objects = self.io.iter_objects(segment, false, true)?;
                self.update_index(segment, &objects)?;
            }
            self.write_index()
        })();
        self.rollback();
        result
    }

    /// Shared between `replay_segments` and `check`: fold one segment's
    /// frames into the working index and supersession counters.
    fn update_index(&mut self, segment: u64, objects: &[ObjectRecord]) -> Result<()> {
        self.segments.insert(segment, 0);
        for object in objects {
            match object.tag {
                Tag::Put => {
                    if let Some(map) = self.index.as_mut() {
                        if let Some((prev_segment, _)) = map.get(&object.key).copied() {
                            *self.compact.entry(prev_segment).or_insert(0) += object.size as i64;
                            *self.segments.entry(prev_segment).or_insert(0) -= 1;
                        }
                        map.insert(object.key, (segment, object.offset));
                    }
                    *self.segments.entry(segment).or_insert(0) += 1;
                }
                Tag::Delete => {
                    let removed = self.index.as_mut().and_then(|m| m.remove(&object.key));
                    if let Some((prev_segment, prev_offset)) = removed {
                        if self.io.segment_exists(prev_segment) {
                            *self.segments.entry(prev_segment).or_insert(0) -= 1;
                            let size = self.io.read_size(prev_segment, prev_offset, &object.key)?;
                            *self.compact.entry(prev_segment).or_insert(0) += size as i64;
                        }
                    }
                }
                Tag::Commit => {}
            }
        }
        if self.segments.get(&segment).copied() == Some(0) {
            let size = self.io.segment_size(segment)?;
            *self.compact.entry(segment).or_insert(0) += size as i64;
        }
        Ok(())
    }

    fn rebuild_sparse(&mut self, segment: u64) -> Result<()> {
        self.compact.insert(segment, 0);
        if self.segments.get(&segment).copied().unwrap_or(0) == 0 {
            let size = self.io.segment_size(segment)?;
            *self.compact.get_mut(&segment).expect("just inserted") += size as i64;
            return Ok(());
        }
        let objects = self.io.iter_objects(segment, false, false)?;
        for object in objects {
            match object.tag {
                Tag::Put => {
                    let current = self.index.as_ref().and_then(|m| m.get(&object.key).copied());
                    if current != Some((segment, object.offset)) {
                        *self.compact.get_mut(&segment).expect("just inserted") += object.size as i64;
                    }
                }
                Tag::Delete => {
                    *self.compact.get_mut(&segment).expect("just inserted") += object.size as i64;
                }
                Tag::Commit => {}
            }
        }
        Ok(())
    }

    /// Rewrite sparse segments, copying forward every live PUT and dropping
    /// superseded ones; disabled implicitly by never being called when the
    /// repository is append-only.
    fn compact_segments(&mut self, save_space: bool) -> Result<()> {
        if self.compact.is_empty() {
            return Ok(());
        }
        let index_transaction_id = self.get_index_transaction_id()?;
        let mut unused = Vec::new();
        let candidates: Vec<u64> = self.compact.keys().copied().collect();

        for segment in candidates {
            let freeable_space = match self.compact.get(&segment).copied() {
                Some(v) => v,
                None => continue,
            };
            if !self.io.segment_exists(segment) {
                self.compact.remove(&segment);
                continue;
            }
            let segment_size = self.io.segment_size(segment)? as f64;
            if segment_size > 0.2 * self.config.max_segment_size as f64
                && (freeable_space as f64) < 0.15 * segment_size
            {
                debug!(
                    "not compacting segment {} for later (only {} bytes are sparse)",
                    segment, freeable_space
                );
                continue;
            }
            self.segments.entry(segment).or_insert(0);

            let objects = self.io.iter_objects(segment, true, true)?;
            for object in objects {
                match object.tag {
                    Tag::Put => {
                        let current = self.index.as_ref().and_then(|m| m.get(&object.key).copied());
                        if current == Some((segment, object.offset)) {
                            let value = object.data.as_ref().expect("include_data was requested");
                            let (new_segment, new_offset) = match self.io.write_put(&object.key, value, save_space) {
                                Ok(result) => result,
                                Err(segment_io::Error::SegmentFull) => {
                                    self.complete_xfer(&mut unused)?;
                                    self.io.write_put(&object.key, value, false)?
                                }
                                Err(e) => return Err(e.into()),
                            };
                            if let Some(map) = self.index.as_mut() {
                                map.insert(object.key, (new_segment, new_offset));
                            }
                            *self.segments.entry(new_segment).or_insert(0) += 1;
                            *self.segments.entry(segment).or_insert(0) -= 1;
                        }
                    }
                    Tag::Delete => {
                        let copy_forward = match index_transaction_id {
                            Some(txid) => segment > txid,
                            None => true,
                        };
                        if copy_forward {
                            match self.io.write_delete(&object.key, save_space) {
                                Ok(_) => {}
                                Err(segment_io::Error::SegmentFull) => {
                                    self.complete_xfer(&mut unused)?;
                                    self.io.write_delete(&object.key, false)?;
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                    Tag::Commit => {}
                }
            }
            assert_eq!(self.segments.get(&segment).copied().unwrap_or(0), 0);
            unused.push(segment);
        }
        self.complete_xfer(&mut unused)
    }

    fn complete_xfer(&mut self, unused: &mut Vec<u64>) -> Result<()> {
        self.io.write_commit()?;
        for segment in unused.drain(..) {
            let live = self.segments.remove(&segment).unwrap_or(0);
            assert_eq!(live, 0);
            self.io.delete_segment(segment)?;
            self.compact.remove(&segment);
        }
        Ok(())
    }
}

fn describe(e: &segment_io::Error) -> String {
    match e {
        segment_io::Error::Io(e) => e.to_string(),
        segment_io::Error::Integrity(msg) => msg.clone(),
        segment_io::Error::SegmentFull => "segment full".to_string(),
    }
}
