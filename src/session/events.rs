//! Status feed and snapshots.
//!
//! Every status change is broadcast as a [`StatusEvent`]; the full picture is
//! published as a [`SessionSnapshot`] on a watch channel. Neither channel can
//! block the session task.

use super::SessionStatus;
use crate::client::{Client, ClientStatus};
use crate::error::{ClientError, ExitCause};
use crate::protocol::Capability;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One entry of the status feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Session {
        status: SessionStatus,
        name: Option<String>,
    },
    SessionDirty {
        dirty: bool,
    },
    Client {
        client_id: String,
        status: ClientStatus,
    },
    ClientFault {
        client_id: String,
        error: ClientError,
    },
    ClientExit {
        client_id: String,
        cause: ExitCause,
    },
    ClientDirty {
        client_id: String,
        dirty: bool,
    },
    /// Label, description or icon changed
    ClientProperties {
        client_id: String,
        label: String,
        description: String,
        icon: String,
    },
}

/// Client as seen by front-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub id: String,
    pub executable: String,
    pub label: String,
    pub status: ClientStatus,
    pub proxy: bool,
    pub pid: Option<u32>,
    pub dirty: bool,
    pub capabilities: Vec<Capability>,
    pub last_error: Option<ClientError>,
}

impl From<&Client> for ClientSnapshot {
    fn from(client: &Client) -> Self {
        Self {
            id: client.id().to_string(),
            executable: client.spec.executable.clone(),
            label: client.spec.display_name().to_string(),
            status: client.status(),
            proxy: client.spec.kind.is_proxy(),
            pid: client.process().map(|p| p.pid()),
            dirty: client.dirty,
            capabilities: client.spec.capabilities.clone(),
            last_error: client.last_error.clone(),
        }
    }
}

/// Whole daemon state as seen by front-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub dirty: bool,
    pub clients: Vec<ClientSnapshot>,
    /// Ids of removed clients that can be restored
    pub trash: Vec<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Off,
            name: None,
            path: None,
            dirty: false,
            clients: Vec::new(),
            trash: Vec::new(),
        }
    }
}

impl SessionSnapshot {
    pub fn client(&self, client_id: &str) -> Option<&ClientSnapshot> {
        self.clients.iter().find(|c| c.id == client_id)
    }
}
