//! Filesystem locations used by the daemon.
//!
//! - `~/.conductor/` - config file and daemon log
//! - `<runtime_dir>/control-<root-hash>.sock` - front-end control socket
//! - `<runtime_dir>/bus-<root-hash>.sock` - client bus socket
//!
//! Sockets are keyed by a hash of the session root so daemons serving
//! different roots never collide.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-user conductor directory.
const CONDUCTOR_DIR: &str = ".conductor";

/// Default session root directory name under `$HOME`.
const DEFAULT_SESSION_ROOT: &str = "Conductor Sessions";

/// Returns `~/.conductor/`, creating it if needed.
pub fn conductor_home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let dir = home.join(CONDUCTOR_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create conductor directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns `~/.conductor/config.yaml`. The file may not exist.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(conductor_home_dir()?.join("config.yaml"))
}

/// Returns `~/.conductor/daemon.log`.
pub fn default_log_path() -> Result<PathBuf> {
    Ok(conductor_home_dir()?.join("daemon.log"))
}

/// Returns `~/Conductor Sessions`, or a relative fallback without a home directory.
pub fn default_session_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_SESSION_ROOT))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_ROOT))
}

/// Returns `$XDG_RUNTIME_DIR/conductor`, or `/tmp/conductor-<uid>` when there is
/// no runtime directory.
pub fn default_runtime_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("conductor"),
        None => std::env::temp_dir().join(format!("conductor-{}", nix::unistd::getuid())),
    }
}

/// SHA256 of the root path, truncated to 12 hex characters.
///
/// The path is canonicalized when possible so symlinked roots share sockets.
pub fn root_hash(root: &Path) -> String {
    let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        canonical.as_os_str().as_bytes().to_vec()
    };
    let digest = Sha256::digest(&bytes);
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

/// Front-end control socket for the daemon serving `root`.
pub fn control_socket_path(runtime_dir: &Path, root: &Path) -> PathBuf {
    runtime_dir.join(format!("control-{}.sock", root_hash(root)))
}

/// Client bus socket for the daemon serving `root`.
pub fn bus_socket_path(runtime_dir: &Path, root: &Path) -> PathBuf {
    runtime_dir.join(format!("bus-{}.sock", root_hash(root)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_hash_is_stable_and_short() {
        let dir = tempfile::tempdir().unwrap();
        let first = root_hash(dir.path());
        assert_eq!(first, root_hash(dir.path()));
        assert_eq!(first.len(), 12);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_socket_paths_differ_per_root() {
        let runtime = Path::new("/run/user/1000/conductor");
        let a = control_socket_path(runtime, Path::new("/sessions/a"));
        let b = control_socket_path(runtime, Path::new("/sessions/b"));
        assert_ne!(a, b);
        assert!(a.starts_with(runtime));
        assert_ne!(
            a.file_name(),
            bus_socket_path(runtime, Path::new("/sessions/a")).file_name()
        );
    }
}
