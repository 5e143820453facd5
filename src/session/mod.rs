//! Session state machine.
//!
//! One task owns the loaded session, every client record and the supervisor.
//! Front-ends reach it through a [`SessionHandle`]; clients reach it through the
//! client bus. Operations run one at a time: while one is in flight the task
//! keeps processing client messages, exits and timers, but answers any other
//! command with `OperationPending`.

mod actions;
mod barrier;
mod client_ops;
mod commands;
mod events;
mod machine;
mod ops;

pub use barrier::Barrier;
pub use commands::{
    AddClientRequest, AddProxyRequest, ClientFailure, ClientProperties, CommandOutput, Request,
    SaveReport, SessionCommand, SessionHandle,
};
pub use events::{ClientSnapshot, SessionSnapshot, StatusEvent};
pub use machine::SessionDaemon;

use crate::client::{Client, ClientSpec};
use crate::persistence::{LoadedSession, SessionDescriptor, SessionLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Last open failed; shown briefly before the previous status returns
    Invalid,
    /// No session loaded
    Off,
    New,
    Open,
    /// Saving and stopping the loaded session before loading another
    Clear,
    Switch,
    Launch,
    Duplicate,
    Ready,
    Save,
    Close,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Invalid => "invalid",
            SessionStatus::Off => "off",
            SessionStatus::New => "new",
            SessionStatus::Open => "open",
            SessionStatus::Clear => "clear",
            SessionStatus::Switch => "switch",
            SessionStatus::Launch => "launch",
            SessionStatus::Duplicate => "duplicate",
            SessionStatus::Ready => "ready",
            SessionStatus::Save => "save",
            SessionStatus::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// The loaded session. Dropping it releases the lock.
#[derive(Debug)]
pub struct Session {
    pub name: String,
    pub path: PathBuf,
    /// Launch and save order
    pub clients: Vec<Client>,
    pub trash: Vec<ClientSpec>,
    pub dirty: bool,
    lock: SessionLock,
}

impl Session {
    pub fn from_loaded(loaded: LoadedSession) -> Self {
        let LoadedSession {
            path,
            descriptor,
            lock,
        } = loaded;
        Self {
            name: descriptor.name,
            path,
            clients: descriptor.clients.into_iter().map(Client::new).collect(),
            trash: descriptor.trashed,
            dirty: false,
            lock,
        }
    }

    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id() == client_id)
    }

    pub fn client_mut(&mut self, client_id: &str) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id() == client_id)
    }

    /// Working directory of a client.
    pub fn client_dir(&self, spec: &ClientSpec) -> PathBuf {
        self.path.join(spec.dir_name(&self.name))
    }

    /// Descriptor for the current state. A client is recorded as launched if
    /// it is running now.
    pub fn descriptor(&self) -> SessionDescriptor {
        let mut descriptor = SessionDescriptor::new(&self.name);
        descriptor.clients = self
            .clients
            .iter()
            .map(|client| {
                let mut spec = client.spec.clone();
                spec.launched = client.status().is_running();
                spec
            })
            .collect();
        descriptor.trashed = self.trash.clone();
        descriptor
    }

    /// Client id derived from an executable name, unique across live and
    /// trashed clients.
    pub fn unique_client_id(&self, executable: &str) -> String {
        let base_name = std::path::Path::new(executable)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut base: String = base_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .take(100)
            .collect();
        if base.is_empty() {
            base = "client".to_string();
        }

        let taken = |id: &str| {
            self.clients.iter().any(|c| c.id() == id) || self.trash.iter().any(|s| s.id == id)
        };
        if !taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn lock_mut(&mut self) -> &mut SessionLock {
        &mut self.lock
    }
}

#[cfg(test)]
#[path = "tests/helpers.rs"]
mod helpers;

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod lifecycle_tests;

#[cfg(test)]
#[path = "tests/client_ops_tests.rs"]
mod client_ops_tests;

#[cfg(test)]
#[path = "tests/handshake_tests.rs"]
mod handshake_tests;

#[cfg(test)]
#[path = "tests/switch_tests.rs"]
mod switch_tests;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientKind;
    use crate::persistence::SessionStore;

    fn session_with(ids: &[&str], trashed: &[&str]) -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let mut loaded = store.create(&dir.path().join("gig"), "gig").unwrap();
        let spec = |id: &&str| ClientSpec::new(id.to_string(), "synth".to_string(), ClientKind::Native);
        loaded.descriptor.clients = ids.iter().map(spec).collect();
        loaded.descriptor.trashed = trashed.iter().map(spec).collect();
        (dir, Session::from_loaded(loaded))
    }

    #[test]
    fn test_unique_client_id() {
        let (_dir, session) = session_with(&["synth", "synth_2"], &["synth_3"]);
        assert_eq!(session.unique_client_id("/usr/bin/synth"), "synth_4");
        assert_eq!(session.unique_client_id("drums"), "drums");
        assert_eq!(session.unique_client_id("my synth.sh"), "my_synth_sh");
        assert_eq!(session.unique_client_id("/"), "client");
    }

    #[test]
    fn test_descriptor_preserves_order_and_trash() {
        let (_dir, session) = session_with(&["c", "a", "b"], &["old"]);
        let descriptor = session.descriptor();
        let ids: Vec<&str> = descriptor.clients.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(descriptor.clients.iter().all(|c| !c.launched));
        assert_eq!(descriptor.trashed.len(), 1);
    }
}
