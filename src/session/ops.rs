//! Session-level operations: new, open, save, close, abort, duplicate, switch,
//! rename and shutdown.

use super::barrier::Barrier;
use super::commands::{ClientFailure, SaveReport};
use super::events::StatusEvent;
use super::machine::{Pump, SessionDaemon, SETTLE_MARGIN};
use super::{Session, SessionStatus};
use crate::client::machine::ClientInput;
use crate::client::{ClientStatus, DeadlineKind};
use crate::error::{ClientError, SessionError, SessionResult};
use crate::persistence::{validate_session_name, LoadedSession, SessionStore};
use crate::protocol::Capability;
use chrono::Utc;
use std::path::Path;
use tokio::time::Instant;
use tracing::{info, warn};

/// Statuses that mean a client is still starting up.
fn settled_after_launch(status: ClientStatus) -> bool {
    !matches!(
        status,
        ClientStatus::Launch | ClientStatus::Open | ClientStatus::Switch
    )
}

impl SessionDaemon {
    pub(super) async fn new_session(&mut self, path: &Path, name: Option<String>) -> SessionResult<()> {
        let path = self.store.resolve(path);
        let name = match name {
            Some(name) => name,
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        validate_session_name(&name)?;
        if SessionStore::is_session_dir(&path) {
            return Err(SessionError::SessionAlreadyExists { path });
        }
        if SessionStore::enclosing_session(&path).is_some() {
            return Err(SessionError::SessionInSessionDir { path });
        }

        if self.session.is_some() {
            self.clear_current().await?;
        }
        self.set_status(SessionStatus::New);
        match self.store.create(&path, &name) {
            Ok(loaded) => {
                self.install(loaded);
                self.set_status(SessionStatus::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_status(SessionStatus::Off);
                Err(e)
            }
        }
    }

    /// Loads the session at `path` and launches the clients recorded as running.
    ///
    /// The target is locked and read before anything else changes, so a
    /// missing, corrupt or locked session leaves the current one untouched.
    pub(super) async fn open_session(&mut self, path: &Path) -> SessionResult<()> {
        let path = self.store.resolve(path);
        if self.session.as_ref().is_some_and(|s| s.path == path) {
            return Err(SessionError::SessionAlreadyOpen { path });
        }

        let previous = self.status;
        self.set_status(SessionStatus::Open);
        let loaded = match self.store.load(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(path = %path.display(), "Open failed: {}", e);
                self.set_status(SessionStatus::Invalid);
                self.set_status(previous);
                return Err(e);
            }
        };

        if self.session.is_some() {
            self.clear_current().await?;
            self.set_status(SessionStatus::Open);
        }
        self.install(loaded);
        let ids = self.recorded_launches(&[]);
        self.launch_and_settle(ids).await?;
        self.set_status(SessionStatus::Ready);
        Ok(())
    }

    pub(super) async fn save_session(&mut self) -> SessionResult<SaveReport> {
        self.require_session()?;
        self.set_status(SessionStatus::Save);
        let result = self.save_and_persist().await;
        if !matches!(result, Err(SessionError::Aborted)) {
            self.set_status(SessionStatus::Ready);
        }
        result
    }

    /// Saves, quits every client (killing those that ignore the quit) and
    /// unloads. The session is never unloaded with a client still running.
    pub(super) async fn close_session(&mut self) -> SessionResult<()> {
        self.require_session()?;
        self.set_status(SessionStatus::Close);
        match self.save_and_persist().await {
            Ok(report) if report.is_partial() => {
                warn!(failed = report.failed.len(), "Closing with partially saved clients");
            }
            Ok(_) => {}
            Err(SessionError::Aborted) => return Err(SessionError::Aborted),
            Err(e) => {
                self.set_status(SessionStatus::Ready);
                return Err(e);
            }
        }
        self.stop_everything().await?;
        self.unload();
        self.set_status(SessionStatus::Off);
        Ok(())
    }

    /// Kills every client and unloads without saving.
    pub(super) fn abort_session(&mut self) -> SessionResult<()> {
        self.require_session()?;
        for client_id in self.running_ids() {
            self.force_stop(&client_id);
        }
        self.unload();
        self.set_status(SessionStatus::Off);
        Ok(())
    }

    /// Saves, copies the session to `<root>/<name>` and continues in the copy.
    pub(super) async fn duplicate_session(&mut self, name: &str) -> SessionResult<()> {
        validate_session_name(name)?;
        let source = self.require_session()?.path.clone();
        let target = self.store.resolve(Path::new(name));
        if target.exists() {
            return Err(SessionError::SessionAlreadyExists { path: target });
        }

        self.set_status(SessionStatus::Duplicate);
        let result = self.duplicate_into(&source, &target, name).await;
        self.settle_status(&result);
        result
    }

    async fn duplicate_into(&mut self, source: &Path, target: &Path, name: &str) -> SessionResult<()> {
        self.save_and_persist().await?;
        self.store.duplicate(source, target, name)?;
        let loaded = self.store.load(target)?;
        self.switch_to(loaded).await
    }

    /// Replaces the loaded session with the one at `path`.
    pub(super) async fn switch_session(&mut self, path: &Path) -> SessionResult<()> {
        let path = self.store.resolve(path);
        if self.require_session()?.path == path {
            return Err(SessionError::SessionAlreadyOpen { path });
        }
        let loaded = self.store.load(&path)?;

        self.set_status(SessionStatus::Switch);
        let result = match self.save_and_persist().await {
            Ok(_) => self.switch_to(loaded).await,
            Err(e) => Err(e),
        };
        self.settle_status(&result);
        result
    }

    /// Moves from the loaded session into `loaded`.
    ///
    /// Ready native clients with the switch capability that also exist in the
    /// target are kept running and reopened. Everything else is quit without
    /// escalation; if a client refuses, the switch is abandoned and the current
    /// session stays loaded while the refusing clients get one more quit period
    /// before they are killed.
    async fn switch_to(&mut self, loaded: LoadedSession) -> SessionResult<()> {
        let session = self.require_session()?;
        let keepers: Vec<String> = session
            .clients
            .iter()
            .filter(|c| {
                c.status() == ClientStatus::Ready
                    && !c.spec.kind.is_proxy()
                    && c.spec.has_capability(Capability::Switch)
                    && loaded
                        .descriptor
                        .clients
                        .iter()
                        .any(|s| s.id == c.id() && s.executable == c.spec.executable)
            })
            .map(|c| c.id().to_string())
            .collect();
        let leaving: Vec<String> = self
            .running_ids()
            .into_iter()
            .filter(|id| !keepers.contains(id))
            .collect();

        match self.quit_clients(leaving, false).await {
            (Pump::Interrupted, _) => return Err(SessionError::Aborted),
            (Pump::TimedOut, still_running) => {
                warn!(?still_running, "Switch abandoned, clients did not quit");
                // Survivors stay in quit: one more quit period, then SIGKILL.
                let quit = self.config.timeouts.quit();
                for id in &still_running {
                    self.set_deadline(id, quit, DeadlineKind::Quit);
                }
                return Err(SessionError::SwitchAborted { still_running });
            }
            (Pump::Complete, _) => {}
        }

        let Some(mut old) = self.session.take() else {
            return Err(SessionError::NoSessionOpen);
        };
        let mut next = Session::from_loaded(loaded);
        for id in &keepers {
            let (Some(from), Some(into)) = (old.client_mut(id), next.client_mut(id)) else {
                continue;
            };
            let capabilities = from.spec.capabilities.clone();
            let (process, conn) = from.take_runtime();
            if let Some(process) = process {
                into.attach_process(process);
            }
            if let Some(conn) = conn {
                into.bind_conn(conn);
            }
            into.spec.capabilities = capabilities;
            into.force_status(ClientStatus::Ready);
        }
        info!(from = %old.name, to = %next.name, kept = keepers.len(), "Switching session");
        drop(old);
        self.session = Some(next);
        self.publish();

        for id in &keepers {
            if self.transition(id, ClientInput::SwitchRequested) {
                self.send_open(id);
            }
        }
        let mut ids = keepers.clone();
        ids.extend(self.recorded_launches(&keepers));
        self.launch_and_settle(ids).await
    }

    /// Renames the loaded session's directory and its client directories.
    pub(super) fn rename_session(&mut self, name: &str) -> SessionResult<()> {
        validate_session_name(name)?;
        let store = &self.store;
        let session = self.session.as_mut().ok_or(SessionError::NoSessionOpen)?;
        if let Some(client) = session.clients.iter().find(|c| c.status().is_running()) {
            return Err(SessionError::ClientRunning {
                client_id: client.id().to_string(),
            });
        }

        let mut descriptor = session.descriptor();
        let new_path = store.rename(&session.path, &mut descriptor, name)?;
        for (client, spec) in session.clients.iter_mut().zip(descriptor.clients) {
            client.spec = spec;
        }
        session.trash = descriptor.trashed;
        session.name = descriptor.name;
        session.lock_mut().relocate(&new_path);
        session.path = new_path;
        session.dirty = false;
        self.set_status(self.status);
        Ok(())
    }

    /// Closes the loaded session, falling back to abort if closing fails.
    pub(super) async fn shutdown(&mut self) -> SessionResult<()> {
        if self.session.is_none() {
            return Ok(());
        }
        if let Err(e) = self.close_session().await {
            warn!("Close during shutdown failed, aborting: {}", e);
            if self.session.is_some() {
                self.abort_session()?;
            }
        }
        Ok(())
    }

    // ---- shared phases ----

    /// Saves and stops the loaded session before another one is loaded.
    async fn clear_current(&mut self) -> SessionResult<()> {
        self.set_status(SessionStatus::Clear);
        if let Err(e) = self.save_and_persist().await {
            if e != SessionError::Aborted {
                self.set_status(SessionStatus::Ready);
            }
            return Err(e);
        }
        self.stop_everything().await?;
        self.unload();
        Ok(())
    }

    /// Quits all running clients with escalation; anything that still has not
    /// exited afterwards is forgotten by force.
    async fn stop_everything(&mut self) -> SessionResult<()> {
        let running = self.running_ids();
        let (outcome, survivors) = self.quit_clients(running, true).await;
        if outcome == Pump::Interrupted {
            return Err(SessionError::Aborted);
        }
        for client_id in survivors {
            warn!(client_id = %client_id, "Client survived quit and kill, dropping it");
            self.force_stop(&client_id);
        }
        Ok(())
    }

    /// Runs the save fan-out, then writes the descriptor. Client failures are
    /// reported, not fatal; only a failed write fails the save.
    pub(super) async fn save_and_persist(&mut self) -> SessionResult<SaveReport> {
        let mut report = self.save_fanout().await?;
        let session = self.require_session_mut()?;
        let mut descriptor = session.descriptor();
        descriptor.saved_at = Some(Utc::now());
        SessionStore::write(&session.path, &descriptor)?;
        report.persisted = true;
        let was_dirty = std::mem::take(&mut session.dirty);
        info!(
            session = %session.name,
            saved = report.saved.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Session saved"
        );
        if was_dirty {
            self.emit(StatusEvent::SessionDirty { dirty: false });
        }
        Ok(report)
    }

    /// Asks every ready, saveable client to save and collects the outcomes,
    /// bounded by the aggregate save timeout.
    async fn save_fanout(&mut self) -> SessionResult<SaveReport> {
        let session = self.require_session()?;
        let mut report = SaveReport::default();
        let mut targets = Vec::new();
        for client in session.clients.iter().filter(|c| c.status().is_running()) {
            if client.can_save() {
                targets.push(client.id().to_string());
            } else {
                report.skipped.push(client.id().to_string());
            }
        }

        self.save_results.clear();
        for client_id in &targets {
            self.request_save(client_id);
        }
        let deadline = Instant::now() + self.config.timeouts.save_all();
        let mut barrier = Barrier::new(targets.clone(), Some(deadline));
        let outcome = self
            .pump(&mut barrier, |status| status != ClientStatus::Save)
            .await;
        if outcome == Pump::Interrupted {
            return Err(SessionError::Aborted);
        }
        for client_id in barrier.pending() {
            self.on_save_failed(client_id, ClientError::SaveTimeout);
        }

        for client_id in targets {
            match self.save_results.remove(&client_id) {
                Some(Ok(())) => report.saved.push(client_id),
                Some(Err(error)) => report.failed.push(ClientFailure { client_id, error }),
                None => {
                    let error = self
                        .client_mut(&client_id)
                        .and_then(|c| c.last_error.clone())
                        .unwrap_or(ClientError::UnexpectedExit {
                            code: None,
                            signal: None,
                        });
                    report.failed.push(ClientFailure { client_id, error });
                }
            }
        }
        Ok(report)
    }

    /// Starts the clients in `ids` that are not running yet, in order, and
    /// waits until every one of them is ready or has failed.
    pub(super) async fn launch_and_settle(&mut self, ids: Vec<String>) -> SessionResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.set_status(SessionStatus::Launch);
        for client_id in &ids {
            let stopped = self
                .client_mut(client_id)
                .is_some_and(|c| !c.status().is_running());
            if stopped {
                // Failures are recorded on the client.
                let _ = self.start_client(client_id);
            }
        }
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.announce() + timeouts.reply() + SETTLE_MARGIN;
        let mut barrier = Barrier::new(ids, Some(deadline));
        match self.pump(&mut barrier, settled_after_launch).await {
            Pump::Interrupted => Err(SessionError::Aborted),
            Pump::Complete | Pump::TimedOut => Ok(()),
        }
    }

    /// Ids of clients recorded as launched, excluding `except`.
    fn recorded_launches(&self, except: &[String]) -> Vec<String> {
        self.session
            .iter()
            .flat_map(|s| s.clients.iter())
            .filter(|c| c.spec.launched && !except.iter().any(|id| id == c.id()))
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Status after a multi-step operation: ready if a session is still loaded,
    /// off otherwise. An abort leaves the status to the abort itself.
    fn settle_status<T>(&mut self, result: &SessionResult<T>) {
        if matches!(result, Err(SessionError::Aborted)) {
            return;
        }
        let status = if self.session.is_some() {
            SessionStatus::Ready
        } else {
            SessionStatus::Off
        };
        self.set_status(status);
    }
}
