//! Client records.
//!
//! A [`Client`] is one managed program in a session. Its persisted part is the
//! [`ClientSpec`]; everything else (status, process, connection, deadline) only
//! exists while the daemon runs. Status changes go through [`Client::apply`],
//! which also enforces that only running statuses carry a process handle.

pub mod machine;

use crate::bus::ConnId;
use crate::error::ClientError;
use crate::protocol::Capability;
use crate::supervisor::ProcessHandle;
use machine::{ClientInput, TransitionError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Client lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Invalid,
    Noop,
    #[default]
    Stopped,
    Launch,
    Open,
    Ready,
    Save,
    Switch,
    Quit,
    Error,
    Removed,
}

impl ClientStatus {
    /// Statuses in which the client owns a live process.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ClientStatus::Launch
                | ClientStatus::Open
                | ClientStatus::Ready
                | ClientStatus::Save
                | ClientStatus::Switch
                | ClientStatus::Quit
        )
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientStatus::Invalid => "invalid",
            ClientStatus::Noop => "noop",
            ClientStatus::Stopped => "stopped",
            ClientStatus::Launch => "launch",
            ClientStatus::Open => "open",
            ClientStatus::Ready => "ready",
            ClientStatus::Save => "save",
            ClientStatus::Switch => "switch",
            ClientStatus::Quit => "quit",
            ClientStatus::Error => "error",
            ClientStatus::Removed => "removed",
        };
        write!(f, "{}", name)
    }
}

/// How the client's working directory name is prefixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrefixMode {
    Custom,
    ClientName,
    #[default]
    SessionName,
}

/// Settings for clients driven through signals instead of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Config file the program works on. Relative paths resolve against the
    /// client directory.
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    /// Signal asking the program to save; `None` means it cannot save
    #[serde(default)]
    pub save_signal: Option<i32>,
    /// Signal asking the program to quit
    #[serde(default = "default_stop_signal")]
    pub stop_signal: i32,
    /// Config file was copied into the session rather than referenced
    #[serde(default)]
    pub copy_config: bool,
}

fn default_stop_signal() -> i32 {
    15
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            config_file: None,
            save_signal: None,
            stop_signal: default_stop_signal(),
            copy_config: false,
        }
    }
}

/// How the daemon talks to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ClientKind {
    /// Speaks the control protocol
    #[default]
    Native,
    /// Foreign program wrapped by the proxy bridge
    Proxy(ProxySettings),
}

impl ClientKind {
    pub fn is_proxy(&self) -> bool {
        matches!(self, ClientKind::Proxy(_))
    }
}

/// Persisted description of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSpec {
    pub id: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub prefix_mode: PrefixMode,
    #[serde(default)]
    pub custom_prefix: String,
    #[serde(default)]
    pub kind: ClientKind,
    /// Whether the client was running when the session was last saved
    #[serde(default)]
    pub launched: bool,
    /// Capabilities from the last announce
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ClientSpec {
    pub fn new(id: String, executable: String, kind: ClientKind) -> Self {
        Self {
            id,
            executable,
            arguments: Vec::new(),
            label: String::new(),
            description: String::new(),
            icon: String::new(),
            prefix_mode: PrefixMode::default(),
            custom_prefix: String::new(),
            kind,
            launched: false,
            capabilities: Vec::new(),
        }
    }

    /// Executable basename, used as the client name.
    pub fn name(&self) -> &str {
        Path::new(&self.executable)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.executable)
    }

    /// Label if set, otherwise the client name.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            self.name()
        } else {
            &self.label
        }
    }

    /// Name of the client's working directory inside the session directory.
    pub fn dir_name(&self, session_name: &str) -> String {
        let prefix = match self.prefix_mode {
            PrefixMode::SessionName => session_name,
            PrefixMode::ClientName => self.name(),
            PrefixMode::Custom if !self.custom_prefix.is_empty() => &self.custom_prefix,
            PrefixMode::Custom => session_name,
        };
        format!("{}.{}", prefix, self.id)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Last command the daemon issued to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LastCommand {
    #[default]
    None,
    Start,
    Open,
    Save,
    Stop,
}

/// What a client deadline is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Announce,
    OpenReply,
    SaveAck,
    Quit,
    /// Grace period after SIGKILL for the exit event to arrive
    Kill,
}

/// A pending timeout on a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub kind: DeadlineKind,
}

/// A client in the loaded session.
#[derive(Debug)]
pub struct Client {
    pub spec: ClientSpec,
    status: ClientStatus,
    process: Option<ProcessHandle>,
    conn: Option<ConnId>,
    pub last_command: LastCommand,
    pub deadline: Option<Deadline>,
    pub dirty: bool,
    pub last_error: Option<ClientError>,
}

impl Client {
    pub fn new(spec: ClientSpec) -> Self {
        Self {
            spec,
            status: ClientStatus::Stopped,
            process: None,
            conn: None,
            last_command: LastCommand::None,
            deadline: None,
            dirty: false,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Attaches the process started for this client.
    pub fn attach_process(&mut self, handle: ProcessHandle) {
        self.process = Some(handle);
    }

    /// Binds the connection the client announced on.
    pub fn bind_conn(&mut self, conn: ConnId) {
        self.conn = Some(conn);
    }

    pub fn unbind_conn(&mut self) {
        self.conn = None;
    }

    /// Moves the live process and connection out of this record, leaving it stopped.
    /// Used when a running client is carried over into another session.
    pub fn take_runtime(&mut self) -> (Option<ProcessHandle>, Option<ConnId>) {
        self.status = ClientStatus::Stopped;
        self.deadline = None;
        (self.process.take(), self.conn.take())
    }

    /// Applies a lifecycle input. Leaving the running statuses drops the process
    /// handle, the connection binding and any pending deadline.
    pub fn apply(&mut self, input: ClientInput) -> Result<ClientStatus, TransitionError> {
        let next = machine::next_status(self.status, input)?;
        self.status = next;
        if !next.is_running() {
            self.process = None;
            self.conn = None;
            self.deadline = None;
        }
        Ok(next)
    }

    /// Status to restore after the process was moved into another record.
    pub fn force_status(&mut self, status: ClientStatus) {
        self.status = status;
    }

    pub fn set_deadline(&mut self, at: Instant, kind: DeadlineKind) {
        self.deadline = Some(Deadline { at, kind });
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Whether a save request makes sense for this client right now.
    pub fn can_save(&self) -> bool {
        self.status == ClientStatus::Ready && self.spec.has_capability(Capability::Save)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: ClientKind) -> ClientSpec {
        ClientSpec::new("synth".to_string(), "/usr/bin/synth".to_string(), kind)
    }

    #[test]
    fn test_dir_name_prefix_modes() {
        let mut s = spec(ClientKind::Native);
        assert_eq!(s.dir_name("gig"), "gig.synth");

        s.prefix_mode = PrefixMode::ClientName;
        assert_eq!(s.dir_name("gig"), "synth.synth");

        s.prefix_mode = PrefixMode::Custom;
        assert_eq!(s.dir_name("gig"), "gig.synth");
        s.custom_prefix = "drums".to_string();
        assert_eq!(s.dir_name("gig"), "drums.synth");
    }

    #[test]
    fn test_display_name_prefers_label() {
        let mut s = spec(ClientKind::Native);
        assert_eq!(s.display_name(), "synth");
        s.label = "Lead Synth".to_string();
        assert_eq!(s.display_name(), "Lead Synth");
    }

    #[test]
    fn test_running_statuses() {
        let running = [
            ClientStatus::Launch,
            ClientStatus::Open,
            ClientStatus::Ready,
            ClientStatus::Save,
            ClientStatus::Switch,
            ClientStatus::Quit,
        ];
        for status in running {
            assert!(status.is_running(), "{} should be running", status);
        }
        for status in [
            ClientStatus::Stopped,
            ClientStatus::Error,
            ClientStatus::Removed,
            ClientStatus::Noop,
            ClientStatus::Invalid,
        ] {
            assert!(!status.is_running(), "{} should not be running", status);
        }
    }

    #[test]
    fn test_leaving_running_drops_handle() {
        let mut client = Client::new(spec(ClientKind::Native));
        client.apply(ClientInput::Launched).unwrap();
        client.attach_process(ProcessHandle::new_for_test(4242, 1));
        client.set_deadline(Instant::now(), DeadlineKind::Announce);
        assert!(client.process().is_some());

        client.apply(ClientInput::AnnounceTimedOut).unwrap();
        assert_eq!(client.status(), ClientStatus::Error);
        assert!(client.process().is_none());
        assert!(client.deadline.is_none());
    }

    #[test]
    fn test_proxy_settings_defaults_from_json() {
        let kind: ClientKind = serde_json::from_str(r#"{"protocol":"proxy"}"#).unwrap();
        match kind {
            ClientKind::Proxy(settings) => {
                assert_eq!(settings.stop_signal, 15);
                assert_eq!(settings.save_signal, None);
                assert!(!settings.copy_config);
            }
            ClientKind::Native => panic!("Wrong variant"),
        }
    }
}
