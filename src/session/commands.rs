//! Commands accepted by the session task, and the handle used to send them.
//!
//! Callers never touch session state directly; they enqueue a command and wait
//! for its result. Commands arriving while another operation runs are answered
//! with `OperationPending` instead of being queued.

use super::events::{SessionSnapshot, StatusEvent};
use crate::client::PrefixMode;
use crate::error::{ClientError, SessionError, SessionResult};
use crate::persistence::SessionSummary;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Parameters for adding a native client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddClientRequest {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Launch right away
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub prefix_mode: PrefixMode,
    #[serde(default)]
    pub custom_prefix: Option<String>,
}

impl AddClientRequest {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            arguments: Vec::new(),
            start: false,
            label: None,
            prefix_mode: PrefixMode::default(),
            custom_prefix: None,
        }
    }
}

/// Parameters for adding a proxied client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddProxyRequest {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    /// Copy `config_file` into the client directory instead of referencing it
    #[serde(default)]
    pub copy_config: bool,
    #[serde(default)]
    pub save_signal: Option<i32>,
    #[serde(default)]
    pub stop_signal: Option<i32>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub start: bool,
}

impl AddProxyRequest {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            arguments: Vec::new(),
            config_file: None,
            copy_config: false,
            save_signal: None,
            stop_signal: None,
            label: None,
            icon: None,
            start: false,
        }
    }
}

/// Editable client metadata. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProperties {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Everything a front-end can ask of the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    /// Create a session; `name` defaults to the directory name
    New {
        path: PathBuf,
        #[serde(default)]
        name: Option<String>,
    },
    Open {
        path: PathBuf,
    },
    Save,
    Close,
    /// Cancel the running operation or drop the loaded session without saving
    Abort,
    Duplicate {
        name: String,
    },
    Switch {
        path: PathBuf,
    },
    Rename {
        name: String,
    },
    List,
    AddClient(AddClientRequest),
    AddProxy(AddProxyRequest),
    RemoveClient {
        client_id: String,
    },
    RestoreClient {
        client_id: String,
    },
    LaunchClient {
        client_id: String,
    },
    StopClient {
        client_id: String,
    },
    KillClient {
        client_id: String,
    },
    SaveClient {
        client_id: String,
    },
    SetClientProperties {
        client_id: String,
        properties: ClientProperties,
    },
    Snapshot,
    /// Close the session and stop the daemon
    Shutdown,
}

impl SessionCommand {
    /// Commands that only read state and are answered even while busy.
    pub fn is_read_only(&self) -> bool {
        matches!(self, SessionCommand::List | SessionCommand::Snapshot)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::New { .. } => "new",
            SessionCommand::Open { .. } => "open",
            SessionCommand::Save => "save",
            SessionCommand::Close => "close",
            SessionCommand::Abort => "abort",
            SessionCommand::Duplicate { .. } => "duplicate",
            SessionCommand::Switch { .. } => "switch",
            SessionCommand::Rename { .. } => "rename",
            SessionCommand::List => "list",
            SessionCommand::AddClient(_) => "add_client",
            SessionCommand::AddProxy(_) => "add_proxy",
            SessionCommand::RemoveClient { .. } => "remove_client",
            SessionCommand::RestoreClient { .. } => "restore_client",
            SessionCommand::LaunchClient { .. } => "launch_client",
            SessionCommand::StopClient { .. } => "stop_client",
            SessionCommand::KillClient { .. } => "kill_client",
            SessionCommand::SaveClient { .. } => "save_client",
            SessionCommand::SetClientProperties { .. } => "set_client_properties",
            SessionCommand::Snapshot => "snapshot",
            SessionCommand::Shutdown => "shutdown",
        }
    }
}

/// A client that failed during a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFailure {
    pub client_id: String,
    pub error: ClientError,
}

/// Outcome of a save fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    /// Clients that acknowledged the save
    pub saved: Vec<String>,
    /// Clients that answered with an error, timed out or died
    pub failed: Vec<ClientFailure>,
    /// Running clients that cannot save
    pub skipped: Vec<String>,
    /// Whether the descriptor was written
    pub persisted: bool,
}

impl SaveReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Successful command results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum CommandOutput {
    Done,
    Saved { report: SaveReport },
    Sessions { sessions: Vec<SessionSummary> },
    ClientAdded { client_id: String },
    Snapshot { snapshot: SessionSnapshot },
}

/// A command together with the channel its result goes back on.
pub struct Request {
    pub command: SessionCommand,
    pub reply: oneshot::Sender<SessionResult<CommandOutput>>,
}

impl Request {
    pub fn respond(self, result: SessionResult<CommandOutput>) {
        let _ = self.reply.send(result);
    }
}

/// Cheap, cloneable access to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Request>,
    status: broadcast::Sender<StatusEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Request>,
        status: broadcast::Sender<StatusEvent>,
        snapshot: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self {
            commands,
            status,
            snapshot,
        }
    }

    /// Sends a command and waits for its result.
    pub async fn request(&self, command: SessionCommand) -> SessionResult<CommandOutput> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| SessionError::unknown("session daemon is not running"))?;
        rx.await
            .map_err(|_| SessionError::unknown("session daemon dropped the request"))?
    }

    /// Subscribes to the status feed. Slow subscribers lose old events rather
    /// than holding up the daemon.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub async fn new_session(&self, path: impl Into<PathBuf>) -> SessionResult<()> {
        self.request(SessionCommand::New {
            path: path.into(),
            name: None,
        })
        .await
        .map(|_| ())
    }

    pub async fn open(&self, path: impl Into<PathBuf>) -> SessionResult<()> {
        self.request(SessionCommand::Open { path: path.into() })
            .await
            .map(|_| ())
    }

    pub async fn save(&self) -> SessionResult<SaveReport> {
        match self.request(SessionCommand::Save).await? {
            CommandOutput::Saved { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(&self) -> SessionResult<()> {
        self.request(SessionCommand::Close).await.map(|_| ())
    }

    pub async fn abort(&self) -> SessionResult<()> {
        self.request(SessionCommand::Abort).await.map(|_| ())
    }

    pub async fn duplicate(&self, name: &str) -> SessionResult<()> {
        self.request(SessionCommand::Duplicate {
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn switch(&self, path: impl Into<PathBuf>) -> SessionResult<()> {
        self.request(SessionCommand::Switch { path: path.into() })
            .await
            .map(|_| ())
    }

    pub async fn add_client(&self, request: AddClientRequest) -> SessionResult<String> {
        match self.request(SessionCommand::AddClient(request)).await? {
            CommandOutput::ClientAdded { client_id } => Ok(client_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_proxy(&self, request: AddProxyRequest) -> SessionResult<String> {
        match self.request(SessionCommand::AddProxy(request)).await? {
            CommandOutput::ClientAdded { client_id } => Ok(client_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn launch_client(&self, client_id: &str) -> SessionResult<()> {
        self.request(SessionCommand::LaunchClient {
            client_id: client_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn stop_client(&self, client_id: &str) -> SessionResult<()> {
        self.request(SessionCommand::StopClient {
            client_id: client_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn remove_client(&self, client_id: &str) -> SessionResult<()> {
        self.request(SessionCommand::RemoveClient {
            client_id: client_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request(SessionCommand::Shutdown).await.map(|_| ())
    }
}

fn unexpected(output: CommandOutput) -> SessionError {
    SessionError::unknown(format!("unexpected command output: {:?}", output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let json = serde_json::to_string(&SessionCommand::Open {
            path: PathBuf::from("/s/gig"),
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"open","path":"/s/gig"}"#);

        let parsed: SessionCommand =
            serde_json::from_str(r#"{"command":"add_client","executable":"synth"}"#).unwrap();
        assert_eq!(
            parsed,
            SessionCommand::AddClient(AddClientRequest::new("synth"))
        );
    }

    #[test]
    fn test_read_only_commands() {
        assert!(SessionCommand::List.is_read_only());
        assert!(SessionCommand::Snapshot.is_read_only());
        assert!(!SessionCommand::Save.is_read_only());
    }

    #[test]
    fn test_partial_save_report() {
        let mut report = SaveReport::default();
        assert!(!report.is_partial());
        report.failed.push(ClientFailure {
            client_id: "synth".to_string(),
            error: ClientError::SaveTimeout,
        });
        assert!(report.is_partial());
    }
}
