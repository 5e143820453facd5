//! Client bus.
//!
//! Native clients connect to a Unix socket and exchange NDJSON [`Message`]s.
//! Each connection gets a [`ConnId`]; everything a connection does is turned
//! into a [`DaemonEvent`] for the session task, which is the only place that
//! interprets messages.

use crate::protocol::{self, CodecError, Message};
use crate::supervisor::proxy::ProxyBridge;
use crate::supervisor::{ExitInfo, ProcessHandle};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one client connection (socket or proxy bridge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound half of a client connection.
#[derive(Debug, Clone)]
pub enum ClientLink {
    Socket(mpsc::UnboundedSender<Message>),
    Proxy(ProxyBridge),
}

impl ClientLink {
    /// Queues a message for the client. Returns false if the connection is gone.
    pub fn send(&self, message: Message) -> bool {
        match self {
            ClientLink::Socket(tx) => tx.send(message).is_ok(),
            ClientLink::Proxy(bridge) => {
                bridge.deliver(message);
                true
            }
        }
    }
}

/// Everything the session task reacts to besides commands.
#[derive(Debug)]
pub enum DaemonEvent {
    Connected {
        conn: ConnId,
        link: ClientLink,
    },
    Received {
        conn: ConnId,
        message: Message,
    },
    /// A line that could not be decoded
    Rejected {
        conn: ConnId,
        error: CodecError,
    },
    Disconnected {
        conn: ConnId,
    },
    ProcessExited {
        client_id: String,
        handle: ProcessHandle,
        exit: ExitInfo,
    },
}

/// Listening client bus. The socket file is removed on drop.
pub struct ClientBus {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ClientBus {
    /// Binds the bus socket and starts accepting connections.
    pub fn bind(path: &Path, events: mpsc::UnboundedSender<DaemonEvent>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if path.exists() {
            // Only one daemon per root owns the bus; a leftover file is stale.
            std::fs::remove_file(path).context("Failed to remove stale bus socket")?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind client bus at {}", path.display()))?;
        info!(path = %path.display(), "Client bus listening");

        let task = tokio::spawn(accept_loop(listener, events));
        Ok(Self {
            path: path.to_path_buf(),
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ClientBus {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, events: mpsc::UnboundedSender<DaemonEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream, events.clone()));
            }
            Err(e) => {
                warn!("Client bus accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, events: mpsc::UnboundedSender<DaemonEvent>) {
    let conn = ConnId::new();
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    if events
        .send(DaemonEvent::Connected {
            conn,
            link: ClientLink::Socket(tx),
        })
        .is_err()
    {
        return;
    }
    debug!(%conn, "Client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = format!("{}\n", protocol::encode(&message));
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    loop {
        match protocol::read_line(&mut reader).await {
            Ok(None) => break,
            Ok(Some(line)) => {
                let event = match line.and_then(|line| protocol::decode_from_client(&line)) {
                    Ok(message) => DaemonEvent::Received { conn, message },
                    Err(CodecError::Empty) => continue,
                    Err(error) => DaemonEvent::Rejected { conn, error },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(%conn, "Client read failed: {}", e);
                break;
            }
        }
    }

    let _ = events.send(DaemonEvent::Disconnected { conn });
    writer_task.abort();
    debug!(%conn, "Client disconnected");
}
