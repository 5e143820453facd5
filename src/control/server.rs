//! Control socket server.
//!
//! Each connection is served by its own task. Commands are forwarded to the
//! session task through a [`SessionHandle`]; while one connection waits on a
//! long operation, another can still send `abort`.

use super::protocol::{encode_line, ControlRequest, ControlResponse};
use crate::error::SessionError;
use crate::protocol;
use crate::session::SessionHandle;
use crate::BUILD_SHA;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Binds the control socket, replacing a stale socket file.
///
/// Fails if another daemon is still answering on `path`.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("Another daemon is already serving {}", path.display());
        }
        std::fs::remove_file(path).context("Failed to remove stale control socket")?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket at {}", path.display()))?;
    info!(path = %path.display(), "Control socket listening");
    Ok(listener)
}

/// Accepts front-end connections until the task is dropped.
pub async fn serve(listener: UnixListener, handle: SessionHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream, handle.clone()));
            }
            Err(e) => {
                warn!("Control accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handle: SessionHandle) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        match protocol::read_line(&mut reader).await {
            Ok(None) => break,
            Ok(Some(Ok(line))) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let parsed = line
                    .map_err(|e| e.to_string())
                    .and_then(|line| serde_json::from_str::<ControlRequest>(line.trim()).map_err(|e| e.to_string()));
                let request = match parsed {
                    Ok(request) => request,
                    Err(e) => {
                        let error = SessionError::unknown(format!("Invalid request: {}", e));
                        if write_response(&mut writer, &ControlResponse::Error { error }).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                match request {
                    ControlRequest::Hello { build_sha } => {
                        if build_sha != BUILD_SHA {
                            debug!(client = %build_sha, daemon = BUILD_SHA, "Front-end built from a different revision");
                        }
                        let ack = ControlResponse::Ack {
                            build_sha: BUILD_SHA.to_string(),
                        };
                        if write_response(&mut writer, &ack).await.is_err() {
                            break;
                        }
                    }
                    ControlRequest::Command { command } => {
                        debug!(command = command.name(), "Control command");
                        let response = ControlResponse::from_result(handle.request(command).await);
                        if write_response(&mut writer, &response).await.is_err() {
                            break;
                        }
                    }
                    ControlRequest::Subscribe => {
                        stream_status(&mut writer, &handle).await;
                        break;
                    }
                }
            }
            Err(e) => {
                debug!("Control read failed: {}", e);
                break;
            }
        }
    }
}

/// Forwards the status feed until the front-end goes away or the daemon stops.
async fn stream_status(writer: &mut OwnedWriteHalf, handle: &SessionHandle) {
    let mut feed = handle.subscribe();
    let ack = ControlResponse::Ack {
        build_sha: BUILD_SHA.to_string(),
    };
    if write_response(writer, &ack).await.is_err() {
        return;
    }
    loop {
        match feed.recv().await {
            Ok(event) => {
                if write_response(writer, &ControlResponse::Status { event }).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Status subscriber fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &ControlResponse) -> Result<()> {
    let line = encode_line(response).context("Failed to serialize response")?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}
