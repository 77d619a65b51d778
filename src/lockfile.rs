//! Pid files: the orchestrator's own lock, and stale artifacts left by services

use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another devgate instance is already running (pid file {} is locked)", .0.display())]
    Locked(PathBuf),

    #[error("pid file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive, locked pid file held for the lifetime of `devgate up`
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl PidFile {
    #[cfg(unix)]
    pub fn create(path: &Path) -> Result<Self, LockError> {
        use std::os::unix::io::AsRawFd;

        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        // Not truncated before the lock is held, so a running instance keeps its pid
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(LockError::Locked(path.to_path_buf()));
            }
            return Err(io_err(err));
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(&file, "{}", std::process::id()).map_err(io_err)?;

        // Keep the file handle open to maintain the lock
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    #[cfg(not(unix))]
    pub fn create(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::File::create(path).map_err(io_err)?;
        writeln!(&file, "{}", std::process::id()).map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Result of clearing a service's pid artifact before start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFileState {
    /// No file present
    Absent,
    /// File removed, with the pid it recorded if it could be parsed
    Removed(Option<u32>),
}

/// Remove a pid artifact left behind by an earlier run
///
/// Only call this when no supervised process owns the file. The recorded pid may have been
/// recycled by an unrelated process, so whether it is alive says nothing about the service.
pub fn clear_stale_pid_file(path: &Path) -> std::io::Result<PidFileState> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PidFileState::Absent),
        Err(e) => return Err(e),
    };

    // Some daemons (postgres) write extra lines after the pid
    let pid = String::from_utf8_lossy(&content)
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid > 0);

    match std::fs::remove_file(path) {
        Ok(()) => Ok(PidFileState::Removed(pid)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PidFileState::Absent),
        Err(e) => Err(e),
    }
}

/// Whether a process with this pid exists
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}
