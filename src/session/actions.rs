//! Per-client actions shared by the operations: start, open, save, quit
//! and kill requests.

use super::barrier::Barrier;
use super::events::StatusEvent;
use super::machine::{Pump, SessionDaemon, SETTLE_MARGIN};
use crate::client::machine::ClientInput;
use crate::client::{ClientKind, ClientStatus, DeadlineKind, LastCommand};
use crate::error::{ClientError, ExitCause, SessionResult};
use crate::protocol::Message;
use crate::supervisor::proxy::{parse_signal, ProxyBridge};
use crate::supervisor::LaunchContext;
use nix::sys::signal::Signal;
use tokio::time::Instant;
use tracing::debug;

impl SessionDaemon {
    /// Starts a client's process. On success the client is in `launch` with an
    /// announce deadline; proxy clients are announced by their bridge.
    pub(super) fn start_client(&mut self, client_id: &str) -> Result<(), ClientError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let Some(client) = session.client(client_id) else {
            return Ok(());
        };
        let spec = client.spec.clone();
        let working_dir = session.client_dir(&spec);
        let session_name = session.name.clone();

        let launch_failed = |reason: String| ClientError::LaunchFailed {
            executable: spec.executable.clone(),
            reason,
        };
        let config_file = match &spec.kind {
            ClientKind::Proxy(settings) => {
                if let Err(e) = validate_proxy_signals(settings.save_signal, settings.stop_signal) {
                    let error = launch_failed(e.to_string());
                    self.transition(client_id, ClientInput::LaunchFailed);
                    self.fault(client_id, error.clone());
                    return Err(error);
                }
                settings.config_file.as_ref().map(|p| working_dir.join(p))
            }
            ClientKind::Native => None,
        };

        let ctx = LaunchContext {
            client_id: client_id.to_string(),
            executable: spec.executable.clone(),
            arguments: spec.arguments.clone(),
            working_dir,
            session_name,
            config_file,
            bus_path: self.bus.path().to_path_buf(),
        };
        let handle = match self.supervisor.launch(&ctx) {
            Ok(handle) => handle,
            Err(error) => {
                self.transition(client_id, ClientInput::LaunchFailed);
                self.fault(client_id, error.clone());
                return Err(error);
            }
        };

        if let Some(client) = self.client_mut(client_id) {
            client.last_command = LastCommand::Start;
            client.last_error = None;
            client.dirty = false;
        }
        self.transition(client_id, ClientInput::Launched);
        if let Some(client) = self.client_mut(client_id) {
            client.attach_process(handle);
        }
        let announce = self.config.timeouts.announce();
        self.set_deadline(client_id, announce, DeadlineKind::Announce);
        self.publish();

        if let ClientKind::Proxy(settings) = &spec.kind {
            if let Err(e) =
                ProxyBridge::attach(client_id, spec.name(), &handle, settings, self.events_tx.clone())
            {
                self.supervisor.kill(&handle);
                let error = launch_failed(e.to_string());
                self.fault(client_id, error.clone());
                self.transition(client_id, ClientInput::Exited { failed: true });
                return Err(error);
            }
        }
        Ok(())
    }

    /// Sends `open` to a client that is in `open` or `switch`.
    pub(super) fn send_open(&mut self, client_id: &str) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(client) = session.client(client_id) else {
            return;
        };
        let message = Message::Open {
            project_path: session.client_dir(&client.spec),
            session_name: session.name.clone(),
            client_id: client_id.to_string(),
        };
        if let Some(client) = self.client_mut(client_id) {
            client.last_command = LastCommand::Open;
        }
        let reply = self.config.timeouts.reply();
        self.set_deadline(client_id, reply, DeadlineKind::OpenReply);
        if !self.send_to_client(client_id, message) {
            debug!(client_id, "Open not delivered; waiting for the deadline");
        }
    }

    /// Asks a ready client to save. The outcome lands in `save_results`.
    pub(super) fn request_save(&mut self, client_id: &str) {
        if let Some(client) = self.client_mut(client_id) {
            client.last_command = LastCommand::Save;
        }
        if !self.transition(client_id, ClientInput::SaveRequested) {
            return;
        }
        let reply = self.config.timeouts.reply();
        self.set_deadline(client_id, reply, DeadlineKind::SaveAck);
        if !self.send_to_client(client_id, Message::Save) {
            self.on_save_failed(client_id, ClientError::SaveTimeout);
        }
    }

    /// Asks a running client to quit and arms its quit deadline. Clients
    /// without a live connection get their stop signal directly. A client
    /// already in `quit` is asked again and gets a fresh deadline.
    pub(super) fn request_quit(&mut self, client_id: &str) {
        let Some(client) = self.client_mut(client_id) else {
            return;
        };
        if !client.status().is_running() {
            return;
        }
        let quitting = client.status() == ClientStatus::Quit;
        client.last_command = LastCommand::Stop;
        let process = client.process().copied();
        let stop_signal = match &client.spec.kind {
            ClientKind::Proxy(settings) => parse_signal(settings.stop_signal).unwrap_or(Signal::SIGTERM),
            ClientKind::Native => Signal::SIGTERM,
        };

        if !quitting {
            self.transition(client_id, ClientInput::QuitRequested);
        }
        let quit = self.config.timeouts.quit();
        self.set_deadline(client_id, quit, DeadlineKind::Quit);
        if !self.send_to_client(client_id, Message::Quit) {
            if let Some(handle) = process {
                self.supervisor.terminate(&handle, stop_signal);
            }
        }
    }

    /// Kills a client and forgets its process without waiting for the exit.
    pub(super) fn force_stop(&mut self, client_id: &str) {
        let Some(client) = self.client_mut(client_id) else {
            return;
        };
        if !client.status().is_running() {
            return;
        }
        client.last_command = LastCommand::Stop;
        self.kill_process(client_id);
        self.transition(client_id, ClientInput::Exited { failed: false });
        self.emit(StatusEvent::ClientExit {
            client_id: client_id.to_string(),
            cause: ExitCause::Expected,
        });
    }

    /// Quits `ids` and waits for them to stop. With `escalate`, survivors of the
    /// quit timeout are killed. Returns the ids still running afterwards.
    pub(super) async fn quit_clients(&mut self, ids: Vec<String>, escalate: bool) -> (Pump, Vec<String>) {
        self.escalate_quit = escalate;
        for id in &ids {
            self.request_quit(id);
        }
        let timeouts = &self.config.timeouts;
        let mut wait = timeouts.quit() + SETTLE_MARGIN;
        if escalate {
            wait += timeouts.kill_grace();
        }
        let mut barrier = Barrier::new(ids, Some(Instant::now() + wait));
        let outcome = self.pump(&mut barrier, |status| !status.is_running()).await;
        self.escalate_quit = true;
        (outcome, barrier.pending().to_vec())
    }

    pub(super) fn kill_process(&mut self, client_id: &str) {
        if let Some(handle) = self.client_mut(client_id).and_then(|c| c.process().copied()) {
            self.supervisor.kill(&handle);
        }
    }
}

/// Checks proxy signal numbers.
pub(super) fn validate_proxy_signals(save_signal: Option<i32>, stop_signal: i32) -> SessionResult<()> {
    if let Some(signal) = save_signal {
        parse_signal(signal)?;
    }
    parse_signal(stop_signal)?;
    Ok(())
}
