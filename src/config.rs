use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Default segment fan-out: segment `X` lives at `data/<X / segments_per_dir>/<X>`.
pub const DEFAULT_SEGMENTS_PER_DIR: u64 = 1000;

/// Default segment size cap, in bytes.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 500 * 1024 * 1024;

pub const README_BANNER: &str = "This is a vaultlog repository\n";

/// Immutable per-repository settings, read from the `config` file.
///
/// The format is a minimal INI dialect (one `[repository]` section,
/// `key=value` lines) — small enough that hand-parsing it beats pulling in
/// a general-purpose INI crate for one section and six keys.
#[derive(Debug, Clone)]
pub struct Config {
    pub version: u32,
    pub segments_per_dir: u64,
    pub max_segment_size: u64,
    pub append_only: bool,
    pub id: [u8; 32],
    pub key: Option<String>,
}

impl Config {
    pub fn fresh(append_only: bool) -> Self {
        Self {
            version: 1,
            segments_per_dir: DEFAULT_SEGMENTS_PER_DIR,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            append_only,
            id: random_id(),
            key: None,
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let fields = parse_ini_section(&text, "repository");
        let get = |name: &str| fields.get(name).cloned();
        let version = get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing version"))?;
        let segments_per_dir = get("segments_per_dir")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SEGMENTS_PER_DIR);
        let max_segment_size = get("max_segment_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SEGMENT_SIZE);
        let append_only = get("append_only").map(|v| v.trim() == "1").unwrap_or(false);
        let id_hex = get("id")
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing id"))?;
        let id = decode_hex32(id_hex.trim())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed id"))?;
        let key = get("key");
        Ok(Self {
            version,
            segments_per_dir,
            max_segment_size,
            append_only,
            id,
            key,
        })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut out = String::new();
        out.push_str("[repository]\n");
        out.push_str(&format!("version = {}\n", self.version));
        out.push_str(&format!("segments_per_dir = {}\n", self.segments_per_dir));
        out.push_str(&format!("max_segment_size = {}\n", self.max_segment_size));
        out.push_str(&format!("append_only = {}\n", self.append_only as u8));
        out.push_str(&format!("id = {}\n", encode_hex(&self.id)));
        if let Some(key) = &self.key {
            out.push_str(&format!("key = {}\n", key));
        }
        fs::write(path, out)
    }
}

fn parse_ini_section(text: &str, section: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut in_section = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_section = &line[1..line.len() - 1] == section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    fields
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn decode_hex32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn random_id() -> [u8; 32] {
    use rand::RngCore;

    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    id
}
