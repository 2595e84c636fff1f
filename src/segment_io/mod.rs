pub mod frame;
mod fd_cache;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use derive_more::From;

use fd_cache::FdCache;
pub use frame::{Tag, MAX_OBJECT_SIZE};
use frame::{decode_header, Header, HEADER_SIZE, MAGIC, PUT_HEADER_SIZE};

/// Default capacity of the read file-descriptor cache.
pub const DEFAULT_FD_CACHE_CAPACITY: usize = 90;

/// The write side's capability contract: an open, writable stream that can
/// guarantee its bytes are durable on device when asked. Modeled as a
/// narrow trait rather than a concrete `File` so a future non-local backend
/// only needs to satisfy this, not `SegmentIO`'s internals.
pub trait DurableWrite: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl DurableWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

#[derive(Debug, From)]
pub enum Error {
    Io(io::Error),
    Integrity(String),
    /// Raised by a `raise_full` write instead of silently rolling over, so
    /// the caller (the compactor) can commit the partial transfer first.
    SegmentFull,
}

/// A decoded log entry, as produced by [`SegmentIO::iter_objects`].
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub tag: Tag,
    /// All-zero for `Tag::Commit`.
    pub key: [u8; 32],
    pub offset: u64,
    pub size: u32,
    /// Present only when `iter_objects` was called with `include_data`.
    pub data: Option<Vec<u8>>,
}

/// Binary framing, CRC, and per-segment read/write/append for the
/// append-only segmented log.
///
/// Owns the single write file descriptor and a bounded LRU of read file
/// descriptors; callers never see raw `std::fs::File`s.
pub struct SegmentIO {
    path: PathBuf,
    limit: u64,
    segments_per_dir: u64,
    fds: FdCache,
    /// Id of the segment currently being (or about to be) written.
    segment: u64,
    /// Write cursor within the current write segment; 0 means no segment open.
    offset: u64,
    write_fd: Option<Box<dyn DurableWrite>>,
}

impl SegmentIO {
    pub fn new(path: PathBuf, limit: u64, segments_per_dir: u64) -> Self {
        Self::with_capacity(path, limit, segments_per_dir, DEFAULT_FD_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        path: PathBuf,
        limit: u64,
        segments_per_dir: u64,
        capacity: usize,
    ) -> Self {
        Self {
            path,
            limit,
            segments_per_dir,
            fds: FdCache::new(capacity),
            segment: 0,
            offset: 0,
            write_fd: None,
        }
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.close_segment()?;
        self.fds.clear();
        Ok(())
    }

    pub fn segment_filename(&self, segment: u64) -> PathBuf {
        self.path
            .join("data")
            .join((segment / self.segments_per_dir).to_string())
            .join(segment.to_string())
    }

    pub fn segment_exists(&self, segment: u64) -> bool {
        self.segment_filename(segment).exists()
    }

    pub fn segment_size(&self, segment: u64) -> io::Result<u64> {
        fs::metadata(self.segment_filename(segment)).map(|m| m.len())
    }

    /// Enumerate `data/` in strict numeric order of directory names, then
    /// numeric order of filenames. Non-numeric names are ignored.
    pub fn segment_iterator(&self, reverse: bool) -> io::Result<Vec<(u64, PathBuf)>> {
        let data_path = self.path.join("data");
        let mut dirs = numeric_entries(&data_path)?;
        dirs.sort_by_key(|(n, _)| *n);
        if reverse {
            dirs.reverse();
        }

        let mut result = Vec::new();
        for (_, dir) in dirs {
            let mut files = numeric_entries(&dir)?;
            files.sort_by_key(|(n, _)| *n);
            if reverse {
                files.reverse();
            }
            result.extend(files);
        }
        Ok(result)
    }

    pub fn get_latest_segment(&self) -> io::Result<Option<u64>> {
        Ok(self.segment_iterator(true)?.into_iter().next().map(|(s, _)| s))
    }

    /// Return the highest segment id that is a validly committed segment.
    pub fn get_segments_transaction_id(&mut self) -> Result<Option<u64>, Error> {
        for (segment, _) in self.segment_iterator(true)? {
            if self.is_committed_segment(segment)? {
                return Ok(Some(segment));
            }
        }
        Ok(None)
    }

    /// Delete segment files left by aborted transactions and reset the
    /// write cursor to just past `transaction_id`.
    pub fn cleanup(&mut self, transaction_id: u64) -> Result<(), Error> {
        self.close_segment()?;
        self.segment = transaction_id + 1;
        for (segment, filename) in self.segment_iterator(true)? {
            if segment > transaction_id {
                self.fds.remove(segment);
                fs::remove_file(&filename)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    pub fn is_committed_segment(&mut self, segment: u64) -> Result<bool, Error> {
        let filename = self.segment_filename(segment);
        let mut f = match File::open(&filename) {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        let len = f.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Ok(false);
        }
        let mut tail = [0u8; HEADER_SIZE];
        f.seek(SeekFrom::End(-(HEADER_SIZE as i64)))?;
        f.read_exact(&mut tail)?;
        if tail != frame::encode_commit() {
            return Ok(false);
        }

        let objects = match self.iter_objects(segment, false, false) {
            Ok(objects) => objects,
            Err(_) => return Ok(false),
        };
        let mut seen_commit = false;
        for object in objects {
            if object.tag == Tag::Commit {
                seen_commit = true;
                continue;
            }
            if seen_commit {
                return Ok(false);
            }
        }
        Ok(seen_commit)
    }

    pub fn delete_segment(&mut self, segment: u64) -> Result<(), Error> {
        self.fds.remove(segment);
        match fs::remove_file(self.segment_filename(segment)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream-decode every frame of `segment`.
    ///
    /// `read_data` must be true whenever `include_data` is true: data can't
    /// be returned without being read (and CRC-checked) first.
    pub fn iter_objects(
        &mut self,
        segment: u64,
        include_data: bool,
        read_data: bool,
    ) -> Result<Vec<ObjectRecord>, Error> {
        assert!(read_data || !include_data);
        let filename = self.segment_filename(segment);
        let fd = self.fds.get_or_open(segment, || File::open(&filename))?;
        fd.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 8];
        fd.read_exact(&mut magic)
            .map_err(|_| Error::Integrity(format!("invalid segment magic [segment {}, offset 0]", segment)))?;
        if &magic != MAGIC {
            return Err(Error::Integrity(format!(
                "invalid segment magic [segment {}, offset 0]",
                segment
            )));
        }

        let mut offset = MAGIC.len() as u64;
        let mut records = Vec::new();
        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            match read_exact_or_eof(fd, &mut header_buf)? {
                None => break,
                Some(n) if n != HEADER_SIZE => {
                    return Err(Error::Integrity(format!(
                        "invalid segment entry header [segment {}, offset {}]",
                        segment, offset
                    )))
                }
                Some(_) => {}
            }
            let header = decode_header(&header_buf);
            let (tag, key, size, data) = read_body(
                fd,
                &header,
                segment,
                offset,
                &[Tag::Put, Tag::Delete, Tag::Commit],
                read_data,
            )?;
            records.push(ObjectRecord {
                tag,
                key,
                offset,
                size,
                data: if include_data { data } else { None },
            });
            offset += size as u64;
        }
        Ok(records)
    }

    /// Copy the file aside and resynthesize it by byte-walking, keeping
    /// only frames whose CRC validates. Lossy by design.
    pub fn recover_segment(&mut self, segment: u64) -> Result<(), Error> {
        self.fds.remove(segment);
        let filename = self.segment_filename(segment);
        let data = fs::read(&filename)?;
        fs::rename(&filename, filename.with_extension("beforerecover"))?;

        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(MAGIC);
        let mut pos = 0usize;
        while pos + HEADER_SIZE <= data.len() {
            let header = decode_header(&data[pos..pos + HEADER_SIZE]);
            let size = header.size as usize;
            if size < HEADER_SIZE || pos + size > data.len() {
                pos += 1;
                continue;
            }
            let tail = &data[pos + 4..pos + size];
            if frame::crc32_tail(tail) != header.crc {
                pos += 1;
                continue;
            }
            out.extend_from_slice(&data[pos..pos + size]);
            pos += size;
        }
        fs::write(&filename, out)?;
        Ok(())
    }

    /// Random read of a PUT frame's value, verifying CRC and key match.
    pub fn read(&mut self, segment: u64, offset: u64, key: &[u8; 32]) -> Result<Vec<u8>, Error> {
        match self.read_entry(segment, offset, key, true)? {
            EntryRead::Data(data) => Ok(data),
            EntryRead::Size(_) => unreachable!("read_data=true always yields Data"),
        }
    }

    /// Like [`SegmentIO::read`] but skips CRC verification and only reports
    /// the frame's size. Used for supersession bookkeeping.
    pub fn read_size(&mut self, segment: u64, offset: u64, key: &[u8; 32]) -> Result<u32, Error> {
        match self.read_entry(segment, offset, key, false)? {
            EntryRead::Size(size) => Ok(size),
            EntryRead::Data(_) => unreachable!("read_data=false always yields Size"),
        }
    }

    fn read_entry(
        &mut self,
        segment: u64,
        offset: u64,
        key: &[u8; 32],
        read_data: bool,
    ) -> Result<EntryRead, Error> {
        if segment == self.segment {
            if let Some(fd) = &mut self.write_fd {
                fd.sync()?;
            }
        }
        let filename = self.segment_filename(segment);
        let fd = self.fds.get_or_open(segment, || File::open(&filename))?;
        fd.seek(SeekFrom::Start(offset))?;
        let mut header_buf = [0u8; HEADER_SIZE];
        fd.read_exact(&mut header_buf).map_err(|_| {
            Error::Integrity(format!(
                "invalid segment entry header [segment {}, offset {}]",
                segment, offset
            ))
        })?;
        let header = decode_header(&header_buf);
        let (_, found_key, size, data) =
            read_body(fd, &header, segment, offset, &[Tag::Put], read_data)?;
        if &found_key != key {
            return Err(Error::Integrity(format!(
                "invalid segment entry header, is not for wanted id [segment {}, offset {}]",
                segment, offset
            )));
        }
        if read_data {
            Ok(EntryRead::Data(data.expect("read_data=true yields data")))
        } else {
            Ok(EntryRead::Size(size))
        }
    }

    pub fn write_put(
        &mut self,
        key: &[u8; 32],
        value: &[u8],
        raise_full: bool,
    ) -> Result<(u64, u64), Error> {
        let frame = frame::encode_put(key, value);
        self.get_write_fd(false, raise_full)?.write_all(&frame)?;
        let offset = self.offset;
        self.offset += frame.len() as u64;
        Ok((self.segment, offset))
    }

    pub fn write_delete(&mut self, key: &[u8; 32], raise_full: bool) -> Result<(u64, u32), Error> {
        let frame = frame::encode_delete(key);
        {
            let fd = self.get_write_fd(false, raise_full)?;
            fd.write_all(&frame)?;
        }
        self.offset += frame.len() as u64;
        Ok((self.segment, PUT_HEADER_SIZE as u32))
    }

    /// Close the current write segment (durably), open a fresh one, and
    /// append a lone COMMIT frame. Returns the new transaction id.
    pub fn write_commit(&mut self) -> Result<u64, Error> {
        self.close_segment()?;
        let frame = frame::encode_commit();
        {
            let fd = self.get_write_fd(false, false)?;
            fd.write_all(&frame)?;
        }
        self.offset += frame.len() as u64;
        let txid = self.segment;
        self.close_segment()?;
        Ok(txid)
    }

    /// Force the write cursor to `segment` and append a lone COMMIT there,
    /// regardless of what currently sits at that id. Used only by repair:
    /// synthesizing a transaction marker when no committed segment exists
    /// at all.
    pub fn synthesize_commit_at(&mut self, segment: u64) -> Result<u64, Error> {
        self.close_segment()?;
        self.segment = segment;
        self.write_commit()
    }

    fn get_write_fd(&mut self, no_new: bool, raise_full: bool) -> Result<&mut dyn DurableWrite, Error> {
        if !no_new && self.offset != 0 && self.offset > self.limit {
            if raise_full {
                return Err(Error::SegmentFull);
            }
            self.close_segment()?;
        }
        if self.write_fd.is_none() {
            if self.segment % self.segments_per_dir == 0 {
                let dirname = self
                    .path
                    .join("data")
                    .join((self.segment / self.segments_per_dir).to_string());
                if !dirname.exists() {
                    fs::create_dir(&dirname)?;
                    sync_dir(&self.path.join("data"))?;
                }
            }
            let filename = self.segment_filename(self.segment);
            let mut f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&filename)?;
            f.write_all(MAGIC)?;
            self.offset = MAGIC.len() as u64;
            self.write_fd = Some(Box::new(f));
        }
        Ok(self.write_fd.as_deref_mut().unwrap())
    }

    fn close_segment(&mut self) -> Result<(), Error> {
        if let Some(mut f) = self.write_fd.take() {
            f.sync()?;
            self.segment += 1;
            self.offset = 0;
        }
        Ok(())
    }
}

enum EntryRead {
    Data(Vec<u8>),
    Size(u32),
}

fn read_body(
    fd: &mut File,
    header: &Header,
    segment: u64,
    offset: u64,
    acceptable: &[Tag],
    read_data: bool,
) -> Result<(Tag, [u8; 32], u32, Option<Vec<u8>>), Error> {
    let size = header.size;
    if size as usize > MAX_OBJECT_SIZE || (size as usize) < HEADER_SIZE {
        return Err(Error::Integrity(format!(
            "invalid segment entry size [segment {}, offset {}]",
            segment, offset
        )));
    }
    let tag = Tag::from_u8(header.tag).ok_or_else(|| {
        Error::Integrity(format!(
            "invalid segment entry header, did not get acceptable tag [segment {}, offset {}]",
            segment, offset
        ))
    })?;
    let body_len = size as usize - HEADER_SIZE;
    let has_key = matches!(tag, Tag::Put | Tag::Delete);

    let mut key = [0u8; 32];
    let mut data = None;
    if read_data {
        let mut body = vec![0u8; body_len];
        fd.read_exact(&mut body).map_err(|_| {
            Error::Integrity(format!(
                "segment entry data short read [segment {}, offset {}]",
                segment, offset
            ))
        })?;
        let mut tail = Vec::with_capacity(5 + body_len);
        tail.extend_from_slice(&size.to_le_bytes());
        tail.push(header.tag);
        tail.extend_from_slice(&body);
        if frame::crc32_tail(&tail) != header.crc {
            return Err(Error::Integrity(format!(
                "segment entry checksum mismatch [segment {}, offset {}]",
                segment, offset
            )));
        }
        if has_key {
            key.copy_from_slice(&body[0..32]);
            data = Some(body[32..].to_vec());
        }
    } else if has_key {
        fd.read_exact(&mut key).map_err(|_| {
            Error::Integrity(format!(
                "segment entry key short read [segment {}, offset {}]",
                segment, offset
            ))
        })?;
        let remaining = (body_len - 32) as i64;
        let before = fd.stream_position()?;
        let after = fd.seek(SeekFrom::Current(remaining))?;
        if (after - before) as i64 != remaining {
            return Err(Error::Integrity(format!(
                "segment entry data short seek [segment {}, offset {}]",
                segment, offset
            )));
        }
    }
    if !acceptable.contains(&tag) {
        return Err(Error::Integrity(format!(
            "invalid segment entry header, did not get acceptable tag [segment {}, offset {}]",
            segment, offset
        )));
    }
    Ok((tag, key, size, data))
}

fn read_exact_or_eof(fd: &mut File, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut total = 0;
    while total < buf.len() {
        match fd.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    if total == 0 {
        Ok(None)
    } else {
        Ok(Some(total))
    }
}

fn numeric_entries(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    Ok(fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                let n: u64 = name.parse().ok()?;
                Some((n, e.path()))
            } else {
                None
            }
        })
        .collect())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_io(dir: &Path, limit: u64) -> SegmentIO {
        fs::create_dir_all(dir.join("data")).unwrap();
        SegmentIO::new(dir.to_path_buf(), limit, 1000)
    }

    #[test]
    fn write_then_read_put() {
        let dir = tempdir().unwrap();
        let mut io = new_io(dir.path(), 1_000_000);
        let key = [1u8; 32];
        let (segment, offset) = io.write_put(&key, b"hello world", false).unwrap();
        io.write_commit().unwrap();

        let value = io.read(segment, offset, &key).unwrap();
        assert_eq!(value, b"hello world");
    }

    #[test]
    fn commit_segment_is_detected() {
        let dir = tempdir().unwrap();
        let mut io = new_io(dir.path(), 1_000_000);
        let key = [2u8; 32];
        io.write_put(&key, b"data", false).unwrap();
        let txid = io.write_commit().unwrap();

        assert!(io.is_committed_segment(txid).unwrap());
        assert_eq!(io.get_segments_transaction_id().unwrap(), Some(txid));
    }

    #[test]
    fn rollover_on_small_segments() {
        let dir = tempdir().unwrap();
        let mut io = new_io(dir.path(), 64);
        let key = [3u8; 32];
        let (seg0, _) = io.write_put(&key, &vec![0u8; 64], false).unwrap();
        let (seg1, _) = io.write_put(&key, &vec![1u8; 10], false).unwrap();
        assert_ne!(seg0, seg1);
    }

    #[test]
    fn crc_failure_is_detected() {
        let dir = tempdir().unwrap();
        let mut io = new_io(dir.path(), 1_000_000);
        let key = [4u8; 32];
        let (segment, _offset) = io.write_put(&key, b"some bytes", false).unwrap();
        io.write_commit().unwrap();

        let filename = io.segment_filename(segment);
        let mut bytes = fs::read(&filename).unwrap();
        let mutate_at = bytes.len() - 4;
        bytes[mutate_at] ^= 0xFF;
        fs::write(&filename, bytes).unwrap();

        let err = io.iter_objects(segment, true, true).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn recover_segment_drops_corrupted_frame() {
        let dir = tempdir().unwrap();
        let mut io = new_io(dir.path(), 1_000_000);
        let key_a = [5u8; 32];
        let key_b = [6u8; 32];
        let (segment, offset_a) = io.write_put(&key_a, b"first", false).unwrap();
        io.write_put(&key_b, b"second", false).unwrap();
        io.write_commit().unwrap();

        let filename = io.segment_filename(segment);
        let mut bytes = fs::read(&filename).unwrap();
        bytes[offset_a as usize + 20] ^= 0xFF;
        fs::write(&filename, bytes).unwrap();

        io.recover_segment(segment).unwrap();
        assert!(filename.with_extension("beforerecover").exists());

        let objects = io.iter_objects(segment, false, true).unwrap();
        // the corrupted first frame is dropped, the clean second one survives
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, key_b);
    }
}
