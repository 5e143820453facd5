//! Session lock.
//!
//! One daemon owns a session directory at a time. Ownership is an advisory
//! exclusive lock on `.conductor.lock` inside the directory; the file also
//! records who holds it, for humans. The lock is released when the
//! [`SessionLock`] is dropped. The file itself is left in place, since removing
//! it would let a second daemon lock a fresh inode while the first still holds
//! the old one.

use crate::error::SessionError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Lock file name inside a session directory.
pub const LOCK_FILE_NAME: &str = ".conductor.lock";

/// Written into the lock file by the owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub instance: Uuid,
    pub locked_at: chrono::DateTime<chrono::Utc>,
}

/// Held lock on a session directory.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Locks `session_dir`, failing with `SessionLockedByAnotherProcess` if
    /// someone else holds it.
    pub fn acquire(session_dir: &Path, instance: Uuid) -> Result<Self, SessionError> {
        let path = session_dir.join(LOCK_FILE_NAME);
        let cannot_create = |e: std::io::Error| SessionError::CannotCreateSessionFile {
            path: path.clone(),
            detail: e.to_string(),
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(cannot_create)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(SessionError::SessionLockedByAnotherProcess {
                    path: session_dir.to_path_buf(),
                });
            }
            Err(e) => return Err(cannot_create(e)),
        }

        let mut lock = Self { file, path };
        let owner = LockOwner {
            pid: std::process::id(),
            instance,
            locked_at: chrono::Utc::now(),
        };
        if let Err(e) = lock.write_owner(&owner) {
            debug!(path = %lock.path.display(), "Could not record lock owner: {}", e);
        }
        debug!(path = %lock.path.display(), "Session locked");
        Ok(lock)
    }

    fn write_owner(&mut self, owner: &LockOwner) -> std::io::Result<()> {
        let json = serde_json::to_string(owner).map_err(std::io::Error::other)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", json)?;
        self.file.flush()
    }

    /// Updates the recorded path after the session directory was moved.
    /// The lock follows the open file, not the path.
    pub fn relocate(&mut self, session_dir: &Path) {
        self.path = session_dir.join(LOCK_FILE_NAME);
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "Session unlocked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_owner(session_dir: &Path) -> LockOwner {
        let content = std::fs::read_to_string(session_dir.join(LOCK_FILE_NAME)).unwrap();
        serde_json::from_str(content.trim()).unwrap()
    }

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let first = SessionLock::acquire(dir.path(), Uuid::new_v4()).unwrap();

        let err = SessionLock::acquire(dir.path(), Uuid::new_v4()).unwrap_err();
        assert_eq!(
            err,
            SessionError::SessionLockedByAnotherProcess {
                path: dir.path().to_path_buf()
            }
        );

        drop(first);
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
        assert!(SessionLock::acquire(dir.path(), Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_owner_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Uuid::new_v4();
        let _lock = SessionLock::acquire(dir.path(), instance).unwrap();

        let owner = read_owner(dir.path());
        assert_eq!(owner.pid, std::process::id());
        assert_eq!(owner.instance, instance);
    }

    #[test]
    fn test_missing_directory_cannot_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionLock::acquire(&dir.path().join("missing"), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SessionError::CannotCreateSessionFile { .. }));
    }
}
