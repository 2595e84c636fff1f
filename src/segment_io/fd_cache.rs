use std::collections::HashMap;
use std::fs::File;
use std::io;

/// Bounded LRU cache of open read file handles, keyed by segment id.
///
/// On eviction the handle is closed and, on unix, the kernel is advised to
/// drop the page cache for it — a segment that has aged out of the cache is
/// unlikely to be read again soon, and page cache is a shared resource.
pub struct FdCache {
    capacity: usize,
    // Most-recently-used segment id is at the back.
    order: Vec<u64>,
    files: HashMap<u64, File>,
}

impl FdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: Vec::new(),
            files: HashMap::new(),
        }
    }

    pub fn get_or_open(
        &mut self,
        segment: u64,
        open: impl FnOnce() -> io::Result<File>,
    ) -> io::Result<&mut File> {
        if self.files.contains_key(&segment) {
            self.touch(segment);
        } else {
            if self.files.len() >= self.capacity {
                self.evict_oldest();
            }
            let file = open()?;
            self.files.insert(segment, file);
            self.order.push(segment);
        }
        Ok(self.files.get_mut(&segment).expect("just inserted or present"))
    }

    fn touch(&mut self, segment: u64) {
        if let Some(pos) = self.order.iter().position(|&s| s == segment) {
            let s = self.order.remove(pos);
            self.order.push(s);
        }
    }

    fn evict_oldest(&mut self) {
        if self.order.is_empty() {
            return;
        }
        let victim = self.order.remove(0);
        if let Some(file) = self.files.remove(&victim) {
            advise_dontneed(&file);
        }
    }

    pub fn remove(&mut self, segment: u64) {
        self.files.remove(&segment);
        self.order.retain(|&s| s != segment);
    }

    pub fn contains(&self, segment: u64) -> bool {
        self.files.contains_key(&segment)
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.order.clear();
    }
}

#[cfg(unix)]
fn advise_dontneed(file: &File) {
    use std::os::unix::io::AsRawFd;
    let _ = nix::fcntl::posix_fadvise(
        file.as_raw_fd(),
        0,
        0,
        nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    );
}

#[cfg(not(unix))]
fn advise_dontneed(_file: &File) {}
