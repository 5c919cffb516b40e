use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::VirtupError;

/// Exclusive advisory lock held around external image tool runs.
///
/// Released when dropped, including on error paths and unwinding.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
}

fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the
        // duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

fn open(path: &Path) -> Result<File, VirtupError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VirtupError::Io {
            context: format!("creating {}", parent.display()),
            source: e,
        })?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| VirtupError::Io {
            context: format!("opening lock file {}", path.display()),
            source: e,
        })
}

fn holder_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

impl BuildLock {
    /// Block until the lock is ours. There is no timeout.
    pub fn acquire(path: &Path) -> Result<Self, VirtupError> {
        if let Some(lock) = Self::try_acquire(path)? {
            return Ok(lock);
        }

        let mut file = open(path)?;
        match holder_pid(&mut file) {
            Some(pid) => tracing::info!(pid, path = %path.display(), "waiting for lock"),
            None => tracing::info!(path = %path.display(), "waiting for lock"),
        }
        flock(&file, libc::LOCK_EX).map_err(|e| VirtupError::Io {
            context: format!("locking {}", path.display()),
            source: e,
        })?;
        Self::claim(file, path)
    }

    /// `Ok(None)` when another holder has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, VirtupError> {
        let file = open(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Self::claim(file, path).map(Some),
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(VirtupError::Io {
                context: format!("locking {}", path.display()),
                source: e,
            }),
        }
    }

    fn claim(mut file: File, path: &Path) -> Result<Self, VirtupError> {
        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| VirtupError::Io {
                context: format!("writing pid to {}", path.display()),
                source: e,
            })?;
        tracing::debug!(path = %path.display(), "acquired build lock");
        Ok(Self { file })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
    }
}
