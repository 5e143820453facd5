//! Per-client commands: add, remove, restore, launch, stop, kill, save and
//! property edits.

use super::actions::validate_proxy_signals;
use super::barrier::Barrier;
use super::commands::{AddClientRequest, AddProxyRequest, ClientProperties};
use super::events::StatusEvent;
use super::machine::{Pump, SessionDaemon, SETTLE_MARGIN};
use crate::client::machine::ClientInput;
use crate::client::{Client, ClientKind, ClientSpec, ClientStatus, DeadlineKind, LastCommand, ProxySettings};
use crate::error::{ClientError, SessionError, SessionResult};
use crate::protocol::Capability;
use std::fs;
use std::path::PathBuf;
use tokio::time::Instant;
use tracing::info;

impl SessionDaemon {
    pub(super) async fn add_client(&mut self, request: AddClientRequest) -> SessionResult<String> {
        let session = self.require_session_mut()?;
        check_executable(&request.executable)?;
        let client_id = session.unique_client_id(&request.executable);
        let mut spec = ClientSpec::new(client_id.clone(), request.executable, ClientKind::Native);
        spec.arguments = request.arguments;
        spec.label = request.label.unwrap_or_default();
        spec.prefix_mode = request.prefix_mode;
        spec.custom_prefix = request.custom_prefix.unwrap_or_default();

        self.insert_client(spec);
        if request.start {
            self.launch_new(&client_id).await?;
        }
        Ok(client_id)
    }

    pub(super) async fn add_proxy(&mut self, request: AddProxyRequest) -> SessionResult<String> {
        let stop_signal = request.stop_signal.unwrap_or(ProxySettings::default().stop_signal);
        validate_proxy_signals(request.save_signal, stop_signal)?;
        let session = self.require_session_mut()?;
        check_executable(&request.executable)?;

        let client_id = session.unique_client_id(&request.executable);
        let mut spec = ClientSpec::new(client_id.clone(), request.executable, ClientKind::Native);
        spec.arguments = request.arguments;
        spec.label = request.label.unwrap_or_default();
        spec.icon = request.icon.unwrap_or_default();

        let config_file = match (request.config_file, request.copy_config) {
            (Some(source), true) => Some(copy_config(&source, &session.client_dir(&spec))?),
            (Some(source), false) => Some(source),
            (None, true) => {
                return Err(SessionError::unknown("copy_config requires a config file"));
            }
            (None, false) => None,
        };
        spec.kind = ClientKind::Proxy(ProxySettings {
            config_file,
            save_signal: request.save_signal,
            stop_signal,
            copy_config: request.copy_config,
        });

        self.insert_client(spec);
        if request.start {
            self.launch_new(&client_id).await?;
        }
        Ok(client_id)
    }

    /// Moves a client to the trash, quitting it first if it is running.
    pub(super) async fn remove_client(&mut self, client_id: &str) -> SessionResult<()> {
        if self.client_status(client_id)?.is_running() {
            self.stop_and_wait(client_id).await?;
        }
        if !self.transition(client_id, ClientInput::Removed) {
            return Err(SessionError::ClientRunning {
                client_id: client_id.to_string(),
            });
        }
        let session = self.require_session_mut()?;
        if let Some(index) = session.clients.iter().position(|c| c.id() == client_id) {
            let client = session.clients.remove(index);
            session.trash.push(client.spec);
        }
        info!(client_id, "Client removed");
        self.mark_dirty();
        Ok(())
    }

    /// Brings a client back from the trash, stopped.
    pub(super) fn restore_client(&mut self, client_id: &str) -> SessionResult<()> {
        let session = self.require_session_mut()?;
        let index = session
            .trash
            .iter()
            .position(|s| s.id == client_id)
            .ok_or_else(|| not_found(client_id))?;
        let mut client = Client::new(session.trash.remove(index));
        client.force_status(ClientStatus::Removed);
        let status = client
            .apply(ClientInput::Restored)
            .map_err(SessionError::unknown)?;
        session.clients.push(client);

        info!(client_id, "Client restored");
        self.emit(StatusEvent::Client {
            client_id: client_id.to_string(),
            status,
        });
        self.mark_dirty();
        Ok(())
    }

    pub(super) async fn launch_client(&mut self, client_id: &str) -> SessionResult<()> {
        if self.client_status(client_id)?.is_running() {
            return Err(SessionError::ClientRunning {
                client_id: client_id.to_string(),
            });
        }
        self.launch_and_wait(client_id).await
    }

    pub(super) async fn stop_client(&mut self, client_id: &str) -> SessionResult<()> {
        self.require_running(client_id)?;
        self.stop_and_wait(client_id).await
    }

    /// SIGKILLs a client and waits for the exit.
    pub(super) async fn kill_client(&mut self, client_id: &str) -> SessionResult<()> {
        self.require_running(client_id)?;
        if let Some(client) = self.client_mut(client_id) {
            client.last_command = LastCommand::Stop;
        }
        self.transition(client_id, ClientInput::QuitRequested);
        self.kill_process(client_id);
        let grace = self.config.timeouts.kill_grace();
        self.set_deadline(client_id, grace, DeadlineKind::Kill);

        let mut barrier = Barrier::new(
            vec![client_id.to_string()],
            Some(Instant::now() + grace + SETTLE_MARGIN),
        );
        if self.pump(&mut barrier, |status| !status.is_running()).await == Pump::Interrupted {
            return Err(SessionError::Aborted);
        }
        Ok(())
    }

    /// Saves one client without writing the descriptor.
    pub(super) async fn save_client(&mut self, client_id: &str) -> SessionResult<()> {
        let status = self.require_running(client_id)?;
        let saveable = self
            .client_mut(client_id)
            .is_some_and(|c| c.spec.has_capability(Capability::Save));
        if !saveable {
            return Err(SessionError::NotSaveable {
                client_id: client_id.to_string(),
            });
        }
        if status != ClientStatus::Ready {
            return Err(SessionError::OperationPending);
        }

        self.save_results.remove(client_id);
        self.request_save(client_id);
        let timeout = self.config.timeouts.reply() + SETTLE_MARGIN;
        let mut barrier = Barrier::new(vec![client_id.to_string()], Some(Instant::now() + timeout));
        if self
            .pump(&mut barrier, |status| status != ClientStatus::Save)
            .await
            == Pump::Interrupted
        {
            return Err(SessionError::Aborted);
        }
        match self.save_results.remove(client_id) {
            Some(Ok(())) => Ok(()),
            Some(Err(error)) => Err(failed(client_id, error)),
            None => Err(failed(client_id, ClientError::SaveTimeout)),
        }
    }

    pub(super) fn set_client_properties(
        &mut self,
        client_id: &str,
        properties: ClientProperties,
    ) -> SessionResult<()> {
        let client = self
            .client_mut(client_id)
            .ok_or_else(|| not_found(client_id))?;
        let spec = &mut client.spec;
        if let Some(label) = properties.label {
            spec.label = label;
        }
        if let Some(description) = properties.description {
            spec.description = description;
        }
        if let Some(icon) = properties.icon {
            spec.icon = icon;
        }
        let event = StatusEvent::ClientProperties {
            client_id: client_id.to_string(),
            label: spec.label.clone(),
            description: spec.description.clone(),
            icon: spec.icon.clone(),
        };
        self.emit(event);
        self.mark_dirty();
        Ok(())
    }

    // ---- helpers ----

    fn insert_client(&mut self, spec: ClientSpec) {
        let client_id = spec.id.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        info!(client_id = %client_id, executable = %spec.executable, "Client added");
        session.clients.push(Client::new(spec));
        self.emit(StatusEvent::Client {
            client_id,
            status: ClientStatus::Stopped,
        });
        self.mark_dirty();
    }

    /// Launches a client that was just added. If the executable cannot be
    /// started at all the record is dropped again.
    async fn launch_new(&mut self, client_id: &str) -> SessionResult<()> {
        let result = self.launch_and_wait(client_id).await;
        if let Err(SessionError::ClientFailed {
            error: ClientError::LaunchFailed { .. },
            ..
        }) = &result
        {
            if let Some(session) = self.session.as_mut() {
                session.clients.retain(|c| c.id() != client_id);
            }
            self.publish();
        }
        result
    }

    /// Starts one client and waits until it is ready or has failed.
    async fn launch_and_wait(&mut self, client_id: &str) -> SessionResult<()> {
        self.start_client(client_id)
            .map_err(|error| failed(client_id, error))?;
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.announce() + timeouts.reply() + SETTLE_MARGIN;
        let mut barrier = Barrier::new(vec![client_id.to_string()], Some(deadline));
        let outcome = self
            .pump(&mut barrier, |status| {
                !matches!(status, ClientStatus::Launch | ClientStatus::Open)
            })
            .await;
        if outcome == Pump::Interrupted {
            return Err(SessionError::Aborted);
        }

        let client = self
            .client_mut(client_id)
            .ok_or_else(|| not_found(client_id))?;
        if client.status() == ClientStatus::Ready {
            return Ok(());
        }
        let error = client.last_error.clone().unwrap_or(ClientError::AnnounceTimeout);
        Err(failed(client_id, error))
    }

    async fn stop_and_wait(&mut self, client_id: &str) -> SessionResult<()> {
        match self.quit_clients(vec![client_id.to_string()], true).await {
            (Pump::Interrupted, _) => Err(SessionError::Aborted),
            (_, still_running) if !still_running.is_empty() => Err(failed(client_id, ClientError::QuitTimeout)),
            _ => Ok(()),
        }
    }

    fn client_status(&mut self, client_id: &str) -> SessionResult<ClientStatus> {
        self.require_session()?;
        self.client_mut(client_id)
            .map(|c| c.status())
            .ok_or_else(|| not_found(client_id))
    }

    fn require_running(&mut self, client_id: &str) -> SessionResult<ClientStatus> {
        let status = self.client_status(client_id)?;
        if !status.is_running() {
            return Err(SessionError::ClientNotRunning {
                client_id: client_id.to_string(),
            });
        }
        Ok(status)
    }
}

fn check_executable(executable: &str) -> SessionResult<()> {
    if executable.trim().is_empty() {
        return Err(SessionError::unknown("executable must not be empty"));
    }
    Ok(())
}

/// Copies a proxy config file into the client directory and returns the
/// reference to store, relative to that directory.
fn copy_config(source: &std::path::Path, client_dir: &std::path::Path) -> SessionResult<PathBuf> {
    let file_name = source
        .file_name()
        .ok_or_else(|| SessionError::unknown(format!("not a file: {}", source.display())))?;
    let cannot_create = |e: std::io::Error| SessionError::CannotCreateSessionFile {
        path: client_dir.to_path_buf(),
        detail: e.to_string(),
    };
    fs::create_dir_all(client_dir).map_err(cannot_create)?;
    fs::copy(source, client_dir.join(file_name)).map_err(cannot_create)?;
    Ok(PathBuf::from(file_name))
}

fn not_found(client_id: &str) -> SessionError {
    SessionError::ClientNotFound {
        client_id: client_id.to_string(),
    }
}

fn failed(client_id: &str, error: ClientError) -> SessionError {
    SessionError::ClientFailed {
        client_id: client_id.to_string(),
        error,
    }
}
