//! Session persistence.
//!
//! A session is a directory holding `session.json` (the [`SessionDescriptor`]),
//! the lock file, and one working directory per client. All descriptor writes go
//! through a temp file and a rename, so a crash never leaves a torn descriptor.

pub mod descriptor;
pub mod lock;

pub use descriptor::SessionDescriptor;
pub use lock::SessionLock;

use crate::client::{ClientKind, PrefixMode};
use crate::error::{SessionError, SessionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Descriptor file name inside a session directory.
pub const DESCRIPTOR_FILE_NAME: &str = "session.json";

/// A session read from disk and locked by this daemon.
#[derive(Debug)]
pub struct LoadedSession {
    pub path: PathBuf,
    pub descriptor: SessionDescriptor,
    pub lock: SessionLock,
}

/// Entry returned by [`SessionStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub path: PathBuf,
    pub saved_at: Option<DateTime<Utc>>,
}

/// Checks a session name used as a directory name.
pub fn validate_session_name(name: &str) -> SessionResult<()> {
    let invalid = name.trim().is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\0')
        || name.trim() != name;
    if invalid {
        return Err(SessionError::InvalidSessionName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Reads and writes sessions under a root directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    instance: Uuid,
}

impl SessionStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            instance: Uuid::new_v4(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths are taken relative to the session root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn descriptor_path(session_dir: &Path) -> PathBuf {
        session_dir.join(DESCRIPTOR_FILE_NAME)
    }

    pub fn is_session_dir(dir: &Path) -> bool {
        Self::descriptor_path(dir).is_file()
    }

    /// Nearest ancestor of `path` that is a session directory.
    pub fn enclosing_session(path: &Path) -> Option<PathBuf> {
        path.ancestors()
            .skip(1)
            .find(|dir| Self::is_session_dir(dir))
            .map(Path::to_path_buf)
    }

    /// Creates an empty session at `path` and locks it.
    pub fn create(&self, path: &Path, name: &str) -> SessionResult<LoadedSession> {
        if Self::is_session_dir(path) {
            return Err(SessionError::SessionAlreadyExists {
                path: path.to_path_buf(),
            });
        }
        if Self::enclosing_session(path).is_some() {
            return Err(SessionError::SessionInSessionDir {
                path: path.to_path_buf(),
            });
        }
        fs::create_dir_all(path).map_err(|e| cannot_create(path, e))?;

        let lock = SessionLock::acquire(path, self.instance)?;
        let descriptor = SessionDescriptor::new(name);
        Self::write(path, &descriptor)?;
        info!(session = %name, path = %path.display(), "Session created");
        Ok(LoadedSession {
            path: path.to_path_buf(),
            descriptor,
            lock,
        })
    }

    /// Locks and reads the session at `path`.
    ///
    /// Missing descriptor, foreign lock and unreadable descriptor each map to
    /// their own error. The lock is released again if reading fails.
    pub fn load(&self, path: &Path) -> SessionResult<LoadedSession> {
        let descriptor_path = Self::descriptor_path(path);
        if !descriptor_path.is_file() {
            return Err(SessionError::SessionDoesNotExist {
                path: path.to_path_buf(),
            });
        }

        let lock = SessionLock::acquire(path, self.instance)?;
        let content =
            fs::read_to_string(&descriptor_path).map_err(|e| SessionError::CannotLoadSessionFile {
                path: descriptor_path.clone(),
                detail: e.to_string(),
            })?;
        let descriptor = SessionDescriptor::parse(&content).map_err(|detail| {
            SessionError::CannotLoadSessionFile {
                path: descriptor_path.clone(),
                detail,
            }
        })?;

        debug!(path = %path.display(), clients = descriptor.clients.len(), "Session loaded");
        Ok(LoadedSession {
            path: path.to_path_buf(),
            descriptor,
            lock,
        })
    }

    /// Writes the descriptor atomically.
    pub fn write(session_dir: &Path, descriptor: &SessionDescriptor) -> SessionResult<()> {
        let path = Self::descriptor_path(session_dir);
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(descriptor)
            .map_err(|e| SessionError::unknown(format!("Failed to serialize descriptor: {}", e)))?;
        fs::write(&temp_path, json).map_err(|e| cannot_create(&temp_path, e))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            cannot_create(&path, e)
        })?;
        Ok(())
    }

    /// Copies the session at `source` to `target` under `new_name`.
    ///
    /// The copy is assembled in a hidden sibling directory and moved into place
    /// last, so a failure leaves neither a partial target nor a changed source.
    pub fn duplicate(&self, source: &Path, target: &Path, new_name: &str) -> SessionResult<()> {
        validate_session_name(new_name)?;
        if target.exists() {
            return Err(SessionError::SessionAlreadyExists {
                path: target.to_path_buf(),
            });
        }
        if Self::enclosing_session(target).is_some() {
            return Err(SessionError::SessionInSessionDir {
                path: target.to_path_buf(),
            });
        }
        let content = fs::read_to_string(Self::descriptor_path(source)).map_err(|e| {
            SessionError::CannotLoadSessionFile {
                path: Self::descriptor_path(source),
                detail: e.to_string(),
            }
        })?;
        let mut descriptor =
            SessionDescriptor::parse(&content).map_err(|detail| SessionError::CannotLoadSessionFile {
                path: Self::descriptor_path(source),
                detail,
            })?;

        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| cannot_create(parent, e))?;
        let staging = parent.join(format!(".{}.{}.partial", new_name, Uuid::new_v4().simple()));

        let result = assemble_copy(source, &staging, target, &mut descriptor, new_name);
        if let Err(e) = result {
            warn!(to = %target.display(), "Duplicate failed: {}", e);
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        info!(from = %source.display(), to = %target.display(), "Session duplicated");
        Ok(())
    }

    /// Renames the session directory and the client directories prefixed with
    /// the session name. Returns the new session path.
    pub fn rename(
        &self,
        session_dir: &Path,
        descriptor: &mut SessionDescriptor,
        new_name: &str,
    ) -> SessionResult<PathBuf> {
        validate_session_name(new_name)?;
        let parent = session_dir.parent().unwrap_or(&self.root);
        let target = parent.join(new_name);
        if target.exists() {
            return Err(SessionError::SessionAlreadyExists { path: target });
        }

        fs::rename(session_dir, &target).map_err(|e| cannot_create(&target, e))?;
        let renames = client_dir_renames(descriptor, new_name);
        apply_dir_renames(&target, &renames)?;
        rewrite_client_paths(descriptor, session_dir, &target, &renames);
        descriptor.name = new_name.to_string();
        Self::write(&target, descriptor)?;

        info!(from = %session_dir.display(), to = %target.display(), "Session renamed");
        Ok(target)
    }

    /// Sessions under the root, sorted by path. Session directories are not
    /// searched for further sessions.
    pub fn list(&self) -> SessionResult<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        if !self.root.is_dir() {
            return Ok(sessions);
        }

        let mut walker = WalkDir::new(&self.root).min_depth(1).into_iter();
        loop {
            let entry = match walker.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden {
                walker.skip_current_dir();
                continue;
            }
            if Self::is_session_dir(entry.path()) {
                let dir_name = entry.file_name().to_string_lossy().to_string();
                let parsed = fs::read_to_string(Self::descriptor_path(entry.path()))
                    .ok()
                    .and_then(|c| SessionDescriptor::parse(&c).ok());
                sessions.push(SessionSummary {
                    name: parsed.as_ref().map_or(dir_name, |d| d.name.clone()),
                    path: entry.path().to_path_buf(),
                    saved_at: parsed.and_then(|d| d.saved_at),
                });
                walker.skip_current_dir();
            }
        }
        sessions.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(sessions)
    }
}

fn assemble_copy(
    source: &Path,
    staging: &Path,
    target: &Path,
    descriptor: &mut SessionDescriptor,
    new_name: &str,
) -> SessionResult<()> {
    copy_tree(source, staging)?;
    let renames = client_dir_renames(descriptor, new_name);
    apply_dir_renames(staging, &renames)?;
    rewrite_client_paths(descriptor, source, target, &renames);
    descriptor.name = new_name.to_string();
    SessionStore::write(staging, descriptor)?;
    fs::rename(staging, target).map_err(|e| cannot_create(target, e))
}

fn cannot_create(path: &Path, e: std::io::Error) -> SessionError {
    SessionError::CannotCreateSessionFile {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

/// Copies a session tree, leaving out the lock file.
fn copy_tree(source: &Path, target: &Path) -> SessionResult<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| cannot_create(target, std::io::Error::other(e.to_string())))?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        if relative == Path::new(lock::LOCK_FILE_NAME) {
            continue;
        }
        let destination = target.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination).map_err(|e| cannot_create(&destination, e))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| cannot_create(&destination, e))?;
            std::os::unix::fs::symlink(link, &destination)
                .map_err(|e| cannot_create(&destination, e))?;
        } else {
            fs::copy(entry.path(), &destination).map_err(|e| cannot_create(&destination, e))?;
        }
    }
    Ok(())
}

/// Client directory renames implied by a new session name: `(old, new)`.
fn client_dir_renames(descriptor: &SessionDescriptor, new_name: &str) -> Vec<(String, String)> {
    descriptor
        .clients
        .iter()
        .chain(descriptor.trashed.iter())
        .filter(|spec| spec.prefix_mode == PrefixMode::SessionName)
        .map(|spec| (spec.dir_name(&descriptor.name), spec.dir_name(new_name)))
        .filter(|(old, new)| old != new)
        .collect()
}

fn apply_dir_renames(session_dir: &Path, renames: &[(String, String)]) -> SessionResult<()> {
    for (old, new) in renames {
        let from = session_dir.join(old);
        if !from.exists() {
            continue;
        }
        let to = session_dir.join(new);
        fs::rename(&from, &to).map_err(|e| cannot_create(&to, e))?;
    }
    Ok(())
}

/// Points absolute proxy config paths that lived inside the old session at the
/// same file inside the new one.
fn rewrite_client_paths(
    descriptor: &mut SessionDescriptor,
    old_root: &Path,
    new_root: &Path,
    renames: &[(String, String)],
) {
    for spec in descriptor.clients.iter_mut().chain(descriptor.trashed.iter_mut()) {
        if let ClientKind::Proxy(settings) = &mut spec.kind {
            if let Some(config) = &settings.config_file {
                if let Some(moved) = remap_path(config, old_root, new_root, renames) {
                    settings.config_file = Some(moved);
                }
            }
        }
    }
}

fn remap_path(
    path: &Path,
    old_root: &Path,
    new_root: &Path,
    renames: &[(String, String)],
) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let relative = path.strip_prefix(old_root).ok()?;
    let mut components = relative.components();
    let first = match components.next()? {
        Component::Normal(first) => first.to_string_lossy().to_string(),
        _ => return None,
    };
    let first = renames
        .iter()
        .find(|(old, _)| *old == first)
        .map_or(first, |(_, new)| new.clone());
    Some(new_root.join(first).join(components.as_path()))
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
