//! Process-wide mutual exclusion.
//!
//! Exclusion comes from an exclusive `flock(2)` on the lock file, held for
//! the lifetime of [`EngineLock`]. The kernel drops it when the holder exits,
//! so a file left behind by a dead run is stale by construction and gets
//! reclaimed. The marker comment with the holder's PID is informational.

use crate::error::{EngineError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Marker comment written into every lock file.
const HELD_BY_MARKER: &str = "# held by dns-firewall";

/// Held for the duration of one top-level engine operation; released on drop.
#[derive(Debug)]
pub struct EngineLock {
    path: PathBuf,
    _file: File,
}

impl EngineLock {
    /// Takes the lock at `path`, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Locked`] if another run holds the lock (its PID
    /// is `None` while the holder has not written it yet), or
    /// [`EngineError::Io`] if the file cannot be opened or locked.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = loop {
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if !try_flock(&file)? {
                let pid = extract_pid(&read_marker(&mut file)?);
                return Err(EngineError::Locked { pid });
            }
            // The previous holder may have unlinked the file between our
            // open and flock; a lock on an orphaned inode excludes nobody.
            if same_file(&file, &path)? {
                break file;
            }
        };

        let previous = read_marker(&mut file)?;
        if let Some(pid) = extract_pid(&previous).filter(|&p| p != std::process::id()) {
            tracing::warn!(path = %path.display(), pid, "Reclaiming stale lock (holder not running)");
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{HELD_BY_MARKER} (pid={})", std::process::id())?;
        file.sync_all()?;

        tracing::debug!(path = %path.display(), "Acquired engine lock");
        Ok(Self { path, _file: file })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        // Unlink while still holding the flock; waiters re-check the inode.
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release engine lock");
        }
    }
}

/// Non-blocking exclusive `flock`. `Ok(false)` if someone else holds it.
fn try_flock(file: &File) -> std::io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and valid for this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

fn same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(on_disk) => Ok(on_disk.dev() == held.dev() && on_disk.ino() == held.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_marker(file: &mut File) -> std::io::Result<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    Ok(content)
}

/// Extracts the PID from `# held by dns-firewall (pid=<N>)`.
fn extract_pid(content: &str) -> Option<u32> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(HELD_BY_MARKER) {
            let rest = rest.trim().strip_prefix("(pid=")?;
            return rest.strip_suffix(')')?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_pid(path: &Path) -> Option<u32> {
        extract_pid(&std::fs::read_to_string(path).unwrap())
    }

    #[test]
    fn acquire_writes_marker_and_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/dns-firewall.lock");

        let lock = EngineLock::acquire(&path).unwrap();
        assert_eq!(marker_pid(lock.path()), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
        assert!(EngineLock::acquire(&path).is_ok());
    }

    #[test]
    fn live_holder_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _held = EngineLock::acquire(&path).unwrap();

        match EngineLock::acquire(&path) {
            Err(EngineError::Locked { pid }) => assert_eq!(pid, Some(std::process::id())),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn holder_that_has_not_written_its_pid_yet_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let creating = File::create(&path).unwrap();
        assert!(try_flock(&creating).unwrap());

        match EngineLock::acquire(&path) {
            Err(EngineError::Locked { pid }) => assert_eq!(pid, None),
            other => panic!("expected Locked, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, "# held by dns-firewall (pid=999999999)\n").unwrap();

        let lock = EngineLock::acquire(&path).unwrap();
        assert_eq!(marker_pid(lock.path()), Some(std::process::id()));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().lines().count(),
            1,
            "previous marker must be replaced, not appended to"
        );
    }

    #[test]
    fn extract_pid_parses_marker_only() {
        assert_eq!(extract_pid("# held by dns-firewall (pid=42)\n"), Some(42));
        assert_eq!(extract_pid(""), None);
        assert_eq!(extract_pid("garbage"), None);
    }
}
