use crc32fast::Hasher;

/// 8-byte magic every segment file starts with.
pub const MAGIC: &[u8; 8] = b"BORG_SEG";

/// `crc(4) + size(4) + tag(1)`, the common prefix of every frame.
pub const HEADER_SIZE: usize = 9;

/// `crc(4) + size(4) + tag(1) + key(32)`, the prefix shared by PUT and DELETE.
pub const PUT_HEADER_SIZE: usize = 41;

/// Largest value this log will ever frame.
pub const MAX_OBJECT_SIZE: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Put = 0,
    Delete = 1,
    Commit = 2,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Tag::Put),
            1 => Some(Tag::Delete),
            2 => Some(Tag::Commit),
            _ => None,
        }
    }
}

/// A decoded frame header, before the variable-length tail has been read.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub crc: u32,
    pub size: u32,
    pub tag: u8,
}

pub fn decode_header(buf: &[u8]) -> Header {
    debug_assert_eq!(buf.len(), HEADER_SIZE);
    Header {
        crc: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        tag: buf[8],
    }
}

fn crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// CRC over everything a frame contains except its own leading CRC field.
pub fn crc32_tail(tail: &[u8]) -> u32 {
    crc32(&[tail])
}

/// Serialize a PUT frame: `crc(4) size(4) tag(1) key(32) value(..)`.
pub fn encode_put(key: &[u8; 32], value: &[u8]) -> Vec<u8> {
    let size = (PUT_HEADER_SIZE + value.len()) as u32;
    let mut tail = Vec::with_capacity(5 + 32 + value.len());
    tail.extend_from_slice(&size.to_le_bytes());
    tail.push(Tag::Put as u8);
    tail.extend_from_slice(key);
    tail.extend_from_slice(value);

    let crc = crc32(&[&tail]);
    let mut frame = Vec::with_capacity(4 + tail.len());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&tail);
    frame
}

/// Serialize a DELETE frame: `crc(4) size(4) tag(1) key(32)`.
pub fn encode_delete(key: &[u8; 32]) -> Vec<u8> {
    let size = PUT_HEADER_SIZE as u32;
    let mut tail = Vec::with_capacity(5 + 32);
    tail.extend_from_slice(&size.to_le_bytes());
    tail.push(Tag::Delete as u8);
    tail.extend_from_slice(key);

    let crc = crc32(&[&tail]);
    let mut frame = Vec::with_capacity(4 + tail.len());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&tail);
    frame
}

/// Serialize a COMMIT frame: `crc(4) size(4) tag(1)`. Always exactly
/// [`HEADER_SIZE`] bytes, and always the final frame in its segment.
pub fn encode_commit() -> [u8; HEADER_SIZE] {
    let size = HEADER_SIZE as u32;
    let mut tail = [0u8; 5];
    tail[0..4].copy_from_slice(&size.to_le_bytes());
    tail[4] = Tag::Commit as u8;

    let crc = crc32(&[&tail]);
    let mut frame = [0u8; HEADER_SIZE];
    frame[0..4].copy_from_slice(&crc.to_le_bytes());
    frame[4..].copy_from_slice(&tail);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_frame_layout() {
        let key = [7u8; 32];
        let frame = encode_put(&key, b"hello");
        assert_eq!(frame.len(), PUT_HEADER_SIZE + 5);
        let header = decode_header(&frame[0..HEADER_SIZE]);
        assert_eq!(header.size as usize, frame.len());
        assert_eq!(header.tag, Tag::Put as u8);
        assert_eq!(&frame[HEADER_SIZE..HEADER_SIZE + 32], &key);
        assert_eq!(&frame[HEADER_SIZE + 32..], b"hello");
        assert_eq!(header.crc, crc32_tail(&frame[4..]));
    }

    #[test]
    fn delete_frame_layout() {
        let key = [3u8; 32];
        let frame = encode_delete(&key);
        assert_eq!(frame.len(), PUT_HEADER_SIZE);
        let header = decode_header(&frame[0..HEADER_SIZE]);
        assert_eq!(header.tag, Tag::Delete as u8);
        assert_eq!(header.crc, crc32_tail(&frame[4..]));
    }

    #[test]
    fn commit_frame_is_stable() {
        let a = encode_commit();
        let b = encode_commit();
        assert_eq!(a, b);
        let header = decode_header(&a);
        assert_eq!(header.tag, Tag::Commit as u8);
        assert_eq!(header.size as usize, HEADER_SIZE);
    }
}
