//! Front-end side of the control socket.

use super::protocol::{encode_line, ControlRequest, ControlResponse};
use crate::session::StatusEvent;
use crate::BUILD_SHA;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::warn;

/// One control connection.
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connects and performs the build-SHA handshake. A mismatch is logged,
    /// not fatal.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("No daemon listening on {}", path.display()))?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };
        let hello = ControlRequest::Hello {
            build_sha: BUILD_SHA.to_string(),
        };
        match client.request(&hello).await? {
            ControlResponse::Ack { build_sha } if build_sha != BUILD_SHA => {
                warn!(daemon = %build_sha, "Daemon was built from a different revision");
            }
            ControlResponse::Ack { .. } => {}
            other => anyhow::bail!("Unexpected handshake response: {:?}", other),
        }
        Ok(client)
    }

    /// Sends one request and reads its response.
    pub async fn request(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let line = encode_line(request).context("Failed to serialize request")?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to send request")?;
        self.read_response()
            .await?
            .context("Daemon closed the connection")
    }

    /// Turns this connection into a status feed.
    pub async fn subscribe(mut self) -> Result<StatusFeed> {
        match self.request(&ControlRequest::Subscribe).await? {
            ControlResponse::Ack { .. } => Ok(StatusFeed { client: self }),
            other => anyhow::bail!("Unexpected subscribe response: {:?}", other),
        }
    }

    async fn read_response(&mut self) -> Result<Option<ControlResponse>> {
        let Some(line) = self.lines.next_line().await.context("Failed to read response")? else {
            return Ok(None);
        };
        let response = serde_json::from_str(line.trim())
            .with_context(|| format!("Invalid response from daemon: {}", line))?;
        Ok(Some(response))
    }
}

/// Subscribed connection yielding status events.
pub struct StatusFeed {
    client: ControlClient,
}

impl StatusFeed {
    /// Next event, or `None` once the daemon closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<StatusEvent>> {
        loop {
            match self.client.read_response().await? {
                Some(ControlResponse::Status { event }) => return Ok(Some(event)),
                Some(other) => warn!(?other, "Ignoring non-status message on feed"),
                None => return Ok(None),
            }
        }
    }
}

/// Connects, sends one request and returns the response.
pub async fn send_request(path: &Path, request: ControlRequest) -> Result<ControlResponse> {
    let mut client = ControlClient::connect(path).await?;
    client.request(&request).await
}
