//! Proxy bridge for programs that do not speak the client protocol.
//!
//! The bridge sits where a socket connection would be and speaks the protocol on
//! the program's behalf: it announces right after launch, answers open at once,
//! and turns save and quit requests into the configured signals. The session
//! machine sees an ordinary client.

use super::{send_signal, ProcessHandle};
use crate::bus::{ClientLink, ConnId, DaemonEvent};
use crate::client::ProxySettings;
use crate::error::SessionError;
use crate::protocol::{codes, Capability, Message, RequestKind};
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tracing::debug;

/// Parses a signal number from user input.
pub fn parse_signal(signal: i32) -> Result<Signal, SessionError> {
    Signal::try_from(signal).map_err(|_| SessionError::InvalidSignal { signal })
}

/// Protocol stand-in for one proxied process.
#[derive(Debug, Clone)]
pub struct ProxyBridge {
    conn: ConnId,
    client_id: String,
    pid: u32,
    save_signal: Option<Signal>,
    stop_signal: Signal,
    events: mpsc::UnboundedSender<DaemonEvent>,
}

impl ProxyBridge {
    /// Registers the bridge as a connection and announces the client.
    pub fn attach(
        client_id: &str,
        executable: &str,
        handle: &ProcessHandle,
        settings: &ProxySettings,
        events: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Self, SessionError> {
        let save_signal = settings.save_signal.map(parse_signal).transpose()?;
        let stop_signal = parse_signal(settings.stop_signal)?;
        let bridge = Self {
            conn: ConnId::new(),
            client_id: client_id.to_string(),
            pid: handle.pid(),
            save_signal,
            stop_signal,
            events,
        };

        let capabilities = if save_signal.is_some() {
            vec![Capability::Save]
        } else {
            Vec::new()
        };
        let _ = bridge.events.send(DaemonEvent::Connected {
            conn: bridge.conn,
            link: ClientLink::Proxy(bridge.clone()),
        });
        bridge.respond(Message::Announce {
            client_id: client_id.to_string(),
            executable: executable.to_string(),
            capabilities,
        });
        Ok(bridge)
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Handles a message the daemon addressed to this client.
    pub fn deliver(&self, message: Message) {
        match message {
            Message::Open { .. } => self.respond(Message::Reply {
                to: RequestKind::Open,
                message: "proxy ready".to_string(),
            }),
            Message::Save => match self.save_signal {
                Some(sig) => {
                    send_signal(self.pid, sig);
                    self.respond(Message::Reply {
                        to: RequestKind::Save,
                        message: format!("{} delivered", sig),
                    });
                }
                None => self.respond(Message::Error {
                    to: Some(RequestKind::Save),
                    code: codes::NOT_SAVEABLE,
                    message: "no save signal configured".to_string(),
                }),
            },
            Message::Quit => {
                send_signal(self.pid, self.stop_signal);
            }
            other => {
                debug!(client_id = %self.client_id, kind = other.kind(), "Proxy ignores message");
            }
        }
    }

    fn respond(&self, message: Message) {
        let _ = self.events.send(DaemonEvent::Received {
            conn: self.conn,
            message,
        });
    }
}
