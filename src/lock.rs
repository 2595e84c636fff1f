use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use derive_more::From;
use fs2::FileExt;

#[derive(Debug, From)]
pub enum Error {
    Io(io::Error),
    Timeout,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A lock that starts out shared and can be upgraded to exclusive.
///
/// A single lock file inside `lock/`, held shared for the lifetime of an
/// open repository and upgraded to exclusive for the duration of a
/// transaction.
pub struct UpgradableLock {
    file: File,
    exclusive: bool,
}

impl UpgradableLock {
    pub fn acquire(dir: &Path, exclusive: bool, timeout: Option<Duration>) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join("lock.exclusive");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        lock_with_timeout(&file, exclusive, timeout)?;
        Ok(Self { file, exclusive })
    }

    pub fn upgrade(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.exclusive {
            return Ok(());
        }
        FileExt::unlock(&self.file)?;
        match lock_with_timeout(&self.file, true, timeout) {
            Ok(()) => {
                self.exclusive = true;
                Ok(())
            }
            Err(e) => {
                // Failed upgrades must not leave us without any lock at all.
                let _ = lock_with_timeout(&self.file, false, None);
                Err(e)
            }
        }
    }

    pub fn release(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }

    /// Forcibly clear a stale lock. Manual operator action only: it does not
    /// check whether another process is actually still alive and holding it.
    pub fn break_lock(dir: &Path) -> io::Result<()> {
        let path = dir.join("lock.exclusive");
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for UpgradableLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_with_timeout(file: &File, exclusive: bool, timeout: Option<Duration>) -> Result<(), Error> {
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        let attempt = if exclusive {
            FileExt::try_lock_exclusive(file)
        } else {
            FileExt::try_lock_shared(file)
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match deadline {
                    Some(deadline) if Instant::now() >= deadline => return Err(Error::Timeout),
                    Some(_) => sleep(POLL_INTERVAL),
                    None => return Err(Error::Timeout),
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}
