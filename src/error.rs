//! Error types for sessions and clients.
//!
//! Session-level errors always reach the caller that issued the command.
//! Client-level errors are recorded on the client and reported on the status
//! feed; the session keeps running.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why a single client failed. Recorded on the client record and broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientError {
    /// Executable missing or not runnable; nothing was started
    LaunchFailed { executable: String, reason: String },
    /// Process started but never announced
    AnnounceTimeout,
    /// Client announced but never replied to open
    OpenTimeout,
    /// Process exited while nobody asked it to
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Save request not acknowledged in time
    SaveTimeout,
    /// Process ignored the quit request and was killed
    QuitTimeout,
    /// Client answered a request with an error
    ErrorReply { code: i32, message: String },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::LaunchFailed { executable, reason } => {
                write!(f, "failed to launch {}: {}", executable, reason)
            }
            ClientError::AnnounceTimeout => write!(f, "didn't announce"),
            ClientError::OpenTimeout => write!(f, "didn't finish opening"),
            ClientError::UnexpectedExit { code, signal } => match (code, signal) {
                (Some(code), _) => write!(f, "exited unexpectedly with code {}", code),
                (None, Some(signal)) => write!(f, "killed unexpectedly by signal {}", signal),
                (None, None) => write!(f, "exited unexpectedly"),
            },
            ClientError::SaveTimeout => write!(f, "didn't acknowledge save"),
            ClientError::QuitTimeout => write!(f, "didn't quit in time, killed"),
            ClientError::ErrorReply { code, message } => {
                write!(f, "replied with error {}: {}", code, message)
            }
        }
    }
}

impl std::error::Error for ClientError {}

/// Whether an exit was requested by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCause {
    Expected,
    Unexpected,
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCause::Expected => write!(f, "expected exit"),
            ExitCause::Unexpected => write!(f, "unexpected exit"),
        }
    }
}

/// Errors returned by session commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionError {
    /// Anything not covered below
    UnknownError { message: String },
    /// Session directory or descriptor could not be written
    CannotCreateSessionFile { path: PathBuf, detail: String },
    /// Another daemon holds the session lock
    SessionLockedByAnotherProcess { path: PathBuf },
    /// No descriptor at the given path
    SessionDoesNotExist { path: PathBuf },
    /// Descriptor exists but could not be read or parsed
    CannotLoadSessionFile { path: PathBuf, detail: String },
    /// Another operation is in flight
    OperationPending,
    /// Command needs a loaded session
    NoSessionOpen,
    /// Target directory already holds a session
    SessionAlreadyExists { path: PathBuf },
    /// Target is the session already loaded
    SessionAlreadyOpen { path: PathBuf },
    /// Target lies inside another session's directory
    SessionInSessionDir { path: PathBuf },
    InvalidSessionName { name: String },
    ClientNotFound { client_id: String },
    ClientNotRunning { client_id: String },
    ClientRunning { client_id: String },
    /// A single-client command failed
    ClientFailed {
        client_id: String,
        error: ClientError,
    },
    /// Client has no way to save
    NotSaveable { client_id: String },
    /// Switch gave up because these clients would not quit
    SwitchAborted { still_running: Vec<String> },
    /// Operation cancelled by an abort command
    Aborted,
    InvalidSignal { signal: i32 },
}

impl SessionError {
    /// Stable numeric code for front-ends.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::UnknownError { .. } => -1,
            SessionError::CannotCreateSessionFile { .. } => -10,
            SessionError::SessionLockedByAnotherProcess { .. } => -11,
            SessionError::SessionDoesNotExist { .. } => -5,
            SessionError::CannotLoadSessionFile { .. } => -9,
            SessionError::OperationPending => -12,
            SessionError::NoSessionOpen => -6,
            SessionError::SessionAlreadyExists { .. } => -22,
            SessionError::SessionAlreadyOpen { .. } => -23,
            SessionError::SessionInSessionDir { .. } => -21,
            SessionError::InvalidSessionName { .. } => -24,
            SessionError::ClientNotFound { .. } => -25,
            SessionError::ClientNotRunning { .. } => -26,
            SessionError::ClientRunning { .. } => -27,
            SessionError::ClientFailed { .. } => -4,
            SessionError::NotSaveable { .. } => -28,
            SessionError::SwitchAborted { .. } => -15,
            SessionError::Aborted => -19,
            SessionError::InvalidSignal { .. } => -29,
        }
    }

    pub fn unknown(message: impl std::fmt::Display) -> Self {
        SessionError::UnknownError {
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::UnknownError { message } => write!(f, "Unknown error: {}", message),
            SessionError::CannotCreateSessionFile { path, detail } => write!(
                f,
                "Cannot create session file {}: {}",
                path.display(),
                detail
            ),
            SessionError::SessionLockedByAnotherProcess { path } => write!(
                f,
                "Session {} is locked by another process",
                path.display()
            ),
            SessionError::SessionDoesNotExist { path } => {
                write!(f, "Session {} does not exist", path.display())
            }
            SessionError::CannotLoadSessionFile { path, detail } => {
                write!(f, "Cannot load session file {}: {}", path.display(), detail)
            }
            SessionError::OperationPending => {
                write!(f, "Another operation is in progress, try again later")
            }
            SessionError::NoSessionOpen => write!(f, "No session is open"),
            SessionError::SessionAlreadyExists { path } => {
                write!(f, "A session already exists at {}", path.display())
            }
            SessionError::SessionAlreadyOpen { path } => {
                write!(f, "Session {} is already open", path.display())
            }
            SessionError::SessionInSessionDir { path } => write!(
                f,
                "{} is inside another session directory",
                path.display()
            ),
            SessionError::InvalidSessionName { name } => {
                write!(f, "Invalid session name: {:?}", name)
            }
            SessionError::ClientNotFound { client_id } => {
                write!(f, "Client not found: {}", client_id)
            }
            SessionError::ClientNotRunning { client_id } => {
                write!(f, "Client {} is not running", client_id)
            }
            SessionError::ClientRunning { client_id } => {
                write!(f, "Client {} is running", client_id)
            }
            SessionError::ClientFailed { client_id, error } => {
                write!(f, "Client {}: {}", client_id, error)
            }
            SessionError::NotSaveable { client_id } => {
                write!(f, "Client {} cannot save", client_id)
            }
            SessionError::SwitchAborted { still_running } => write!(
                f,
                "Switch aborted, clients still running: {}",
                still_running.join(", ")
            ),
            SessionError::Aborted => write!(f, "Operation aborted"),
            SessionError::InvalidSignal { signal } => write!(f, "Invalid signal: {}", signal),
        }
    }
}

impl std::error::Error for SessionError {}

/// Result type for session commands.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_taxonomy_codes_are_distinct() {
        let path = PathBuf::from("/s");
        let errors = [
            SessionError::unknown("boom"),
            SessionError::CannotCreateSessionFile {
                path: path.clone(),
                detail: String::new(),
            },
            SessionError::SessionLockedByAnotherProcess { path: path.clone() },
            SessionError::SessionDoesNotExist { path: path.clone() },
            SessionError::CannotLoadSessionFile {
                path,
                detail: String::new(),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(SessionError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_announce_timeout_reads_as_didnt_announce() {
        assert_eq!(ClientError::AnnounceTimeout.to_string(), "didn't announce");
    }

    #[test]
    fn test_session_error_serialization_roundtrip() {
        let err = SessionError::ClientFailed {
            client_id: "synth".to_string(),
            error: ClientError::UnexpectedExit {
                code: Some(3),
                signal: None,
            },
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("client_failed"));
        let parsed: SessionError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
        assert_eq!(
            parsed.to_string(),
            "Client synth: exited unexpectedly with code 3"
        );
    }
}
