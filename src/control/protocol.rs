//! Front-end control protocol.
//!
//! Newline-delimited JSON, one object per line. A connection may carry any
//! number of request/response exchanges; after `subscribe` it turns into a
//! one-way stream of status events.

use crate::error::SessionError;
use crate::session::{CommandOutput, SessionCommand, StatusEvent};
use serde::{Deserialize, Serialize};

/// Messages sent from a front-end to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Handshake; the daemon answers with its own build SHA
    Hello { build_sha: String },
    Command { command: SessionCommand },
    /// Switch this connection to the status feed
    Subscribe,
}

/// Messages sent from the daemon to a front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Acknowledgement with the daemon's build SHA
    Ack { build_sha: String },
    Output { output: CommandOutput },
    Error { error: SessionError },
    /// One status feed entry (subscribed connections only)
    Status { event: StatusEvent },
}

impl ControlResponse {
    pub fn from_result(result: Result<CommandOutput, SessionError>) -> Self {
        match result {
            Ok(output) => ControlResponse::Output { output },
            Err(error) => ControlResponse::Error { error },
        }
    }
}

pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message).map(|json| format!("{}\n", json))
}
