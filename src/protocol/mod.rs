//! Wire protocol between the daemon, its clients, and front-ends.
//!
//! All communication uses newline-delimited JSON (one JSON object per line).
//! Every client holds one ordered, reliable connection to the daemon; messages
//! on that connection are implicitly addressed to the client that announced on it.
//!
//! Direction matters: clients may only send [`Message::Announce`], [`Message::Reply`],
//! [`Message::Error`] and [`Message::Dirty`]. Everything else is daemon-originated.
//!
//! Peers read lines with [`read_line`], which bounds memory per line and turns
//! bad bytes into a [`CodecError`] instead of an I/O failure.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest line accepted from a peer, in bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Longest client id accepted in an announce.
const MAX_CLIENT_ID_LEN: usize = 128;

/// Optional features a client reports when it announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Client saves its state when asked
    Save,
    /// Client can reopen under a new project path without restarting
    Switch,
    /// Client reports unsaved changes with dirty notifications
    Dirty,
    /// Client has a GUI it can show or hide
    OptionalGui,
}

/// Requests a reply or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Announce,
    Open,
    Save,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Announce => write!(f, "announce"),
            RequestKind::Open => write!(f, "open"),
            RequestKind::Save => write!(f, "save"),
        }
    }
}

/// Error codes carried in [`Message::Error`].
pub mod codes {
    pub const GENERAL: i32 = -1;
    pub const UNKNOWN_CLIENT: i32 = -2;
    pub const OUT_OF_ORDER: i32 = -3;
    pub const MALFORMED: i32 = -4;
    pub const NOT_SAVEABLE: i32 = -5;
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message from a freshly launched client
    Announce {
        client_id: String,
        executable: String,
        #[serde(default)]
        capabilities: Vec<Capability>,
    },
    /// Successful completion of a request (client → daemon), or announce ack (daemon → client)
    Reply {
        to: RequestKind,
        #[serde(default)]
        message: String,
    },
    /// Failed request, in either direction
    Error {
        #[serde(default)]
        to: Option<RequestKind>,
        code: i32,
        message: String,
    },
    /// Client reports whether it has unsaved changes
    Dirty { dirty: bool },
    /// Daemon asks the client to load its project
    Open {
        project_path: PathBuf,
        session_name: String,
        client_id: String,
    },
    /// Daemon asks the client to save
    Save,
    /// Daemon asks the client to terminate
    Quit,
}

impl Message {
    /// Whether a client is allowed to send this message.
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Message::Announce { .. }
                | Message::Reply { .. }
                | Message::Error { .. }
                | Message::Dirty { .. }
        )
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Announce { .. } => "announce",
            Message::Reply { .. } => "reply",
            Message::Error { .. } => "error",
            Message::Dirty { .. } => "dirty",
            Message::Open { .. } => "open",
            Message::Save => "save",
            Message::Quit => "quit",
        }
    }
}

/// Reasons a line could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Blank line
    Empty,
    /// Line longer than [`MAX_LINE_BYTES`]
    TooLong { len: usize },
    /// Not valid JSON for any message
    Malformed { detail: String },
    /// Valid message, wrong sender
    WrongDirection { kind: &'static str },
    /// Field present but unusable
    InvalidField { field: &'static str, detail: String },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty message"),
            CodecError::TooLong { len } => {
                write!(f, "message of {} bytes exceeds {} byte limit", len, MAX_LINE_BYTES)
            }
            CodecError::Malformed { detail } => write!(f, "malformed message: {}", detail),
            CodecError::WrongDirection { kind } => {
                write!(f, "'{}' messages cannot be sent by this peer", kind)
            }
            CodecError::InvalidField { field, detail } => {
                write!(f, "invalid field '{}': {}", field, detail)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Encodes a message as one line, without the trailing newline.
pub fn encode(message: &Message) -> String {
    // Message contains only strings, paths, integers and enums; serialization cannot fail.
    serde_json::to_string(message).unwrap_or_else(|e| {
        format!(
            r#"{{"type":"error","code":{},"message":"encode failed: {}"}}"#,
            codes::GENERAL,
            e
        )
    })
}

fn decode_line(line: &str) -> Result<Message, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CodecError::Empty);
    }
    if trimmed.len() > MAX_LINE_BYTES {
        return Err(CodecError::TooLong { len: trimmed.len() });
    }
    serde_json::from_str(trimmed).map_err(|e| CodecError::Malformed {
        detail: e.to_string(),
    })
}

/// Decodes a line received from a client, rejecting daemon-only messages
/// and announces with unusable fields.
pub fn decode_from_client(line: &str) -> Result<Message, CodecError> {
    let message = decode_line(line)?;
    if !message.is_client_originated() {
        return Err(CodecError::WrongDirection {
            kind: message.kind(),
        });
    }
    if let Message::Announce {
        client_id,
        executable,
        ..
    } = &message
    {
        validate_client_id(client_id)?;
        if executable.trim().is_empty() {
            return Err(CodecError::InvalidField {
                field: "executable",
                detail: "must not be empty".to_string(),
            });
        }
    }
    Ok(message)
}

/// Reads one newline-terminated line of at most [`MAX_LINE_BYTES`].
///
/// Returns `Ok(None)` at end of stream. A longer line is discarded up to its
/// newline and reported as [`CodecError::TooLong`]; a line that is not UTF-8
/// is reported as [`CodecError::Malformed`]. Either way the stream stays usable.
pub async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<Result<String, CodecError>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_BYTES {
        let len = buf.len() + skip_past_newline(reader).await?;
        return Ok(Some(Err(CodecError::TooLong { len })));
    }
    Ok(Some(String::from_utf8(buf).map_err(|e| CodecError::Malformed {
        detail: format!("not UTF-8: {}", e.utf8_error()),
    })))
}

/// Consumes input through the next newline without buffering it.
async fn skip_past_newline<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (used, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            }
        };
        AsyncBufReadExt::consume(reader, used);
        skipped += used;
        if found {
            return Ok(skipped);
        }
    }
}

/// Decodes a line received from the daemon.
pub fn decode_from_daemon(line: &str) -> Result<Message, CodecError> {
    decode_line(line)
}

/// Client ids double as directory name suffixes, so they are restricted to a
/// filesystem-safe alphabet.
pub fn validate_client_id(client_id: &str) -> Result<(), CodecError> {
    if client_id.is_empty() {
        return Err(CodecError::InvalidField {
            field: "client_id",
            detail: "must not be empty".to_string(),
        });
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(CodecError::InvalidField {
            field: "client_id",
            detail: format!("longer than {} characters", MAX_CLIENT_ID_LEN),
        });
    }
    if let Some(bad) = client_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(CodecError::InvalidField {
            field: "client_id",
            detail: format!("contains '{}'", bad),
        });
    }
    Ok(())
}
