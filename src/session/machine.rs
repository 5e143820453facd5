//! The session task: event loop, client message handling and deadlines.
//!
//! Operations (in `ops.rs` and `client_ops.rs`, built on the per-client
//! requests in `actions.rs`) are async methods on
//! [`SessionDaemon`]. Whenever one has to wait for clients it calls
//! [`SessionDaemon::pump`], which keeps the loop turning until a [`Barrier`]
//! settles, its deadline passes, or an abort arrives.

use super::barrier::Barrier;
use super::commands::{CommandOutput, Request, SessionCommand, SessionHandle};
use super::events::{ClientSnapshot, SessionSnapshot, StatusEvent};
use super::{Session, SessionStatus};
use crate::bus::{ClientBus, ClientLink, ConnId, DaemonEvent};
use crate::client::machine::{classify_exit, ClientInput};
use crate::client::{Client, ClientStatus, DeadlineKind};
use crate::config::DaemonConfig;
use crate::error::{ClientError, ExitCause, SessionError, SessionResult};
use crate::persistence::{LoadedSession, SessionStore};
use crate::protocol::{codes, Capability, Message, RequestKind};
use crate::supervisor::{ExitInfo, ProcessHandle, Supervisor};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Slack added to fan-out deadlines so per-client deadlines fire first.
pub(super) const SETTLE_MARGIN: Duration = Duration::from_millis(250);

const COMMAND_QUEUE: usize = 64;
const STATUS_FEED_CAPACITY: usize = 256;

/// How a wait on a barrier ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Pump {
    Complete,
    TimedOut,
    /// An abort or shutdown arrived; the caller must stop and return `Aborted`
    Interrupted,
}

/// Owns the session, its clients and the supervisor. Runs as a single task.
pub struct SessionDaemon {
    pub(super) config: DaemonConfig,
    pub(super) store: SessionStore,
    pub(super) supervisor: Supervisor,
    pub(super) status: SessionStatus,
    pub(super) session: Option<Session>,
    pub(super) links: HashMap<ConnId, ClientLink>,
    /// Per-client outcome of the save currently being collected
    pub(super) save_results: HashMap<String, Result<(), ClientError>>,
    /// Whether an expired quit deadline escalates to SIGKILL
    pub(super) escalate_quit: bool,
    /// Abort or shutdown received while an operation was running
    pub(super) interrupt: Option<Request>,
    commands: mpsc::Receiver<Request>,
    commands_closed: bool,
    events: mpsc::UnboundedReceiver<DaemonEvent>,
    pub(super) events_tx: mpsc::UnboundedSender<DaemonEvent>,
    status_tx: broadcast::Sender<StatusEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    pub(super) bus: ClientBus,
}

impl SessionDaemon {
    /// Binds the client bus and starts the session task.
    ///
    /// The task runs until a `Shutdown` command completes or every handle is
    /// dropped; either way the loaded session is closed first.
    pub fn spawn(config: DaemonConfig) -> anyhow::Result<(SessionHandle, JoinHandle<()>)> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let bus = ClientBus::bind(&config.bus_socket_path(), events_tx.clone())?;
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, _) = broadcast::channel(STATUS_FEED_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let daemon = Self {
            store: SessionStore::new(config.session_root.clone()),
            supervisor: Supervisor::new(events_tx.clone()),
            config,
            status: SessionStatus::Off,
            session: None,
            links: HashMap::new(),
            save_results: HashMap::new(),
            escalate_quit: true,
            interrupt: None,
            commands,
            commands_closed: false,
            events,
            events_tx,
            status_tx: status_tx.clone(),
            snapshot_tx,
            bus,
        };
        let handle = SessionHandle::new(commands_tx, status_tx, snapshot_rx);
        let task = tokio::spawn(daemon.run());
        Ok((handle, task))
    }

    async fn run(mut self) {
        info!(root = %self.store.root().display(), "Session daemon started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                request = self.commands.recv(), if !self.commands_closed => match request {
                    Some(request) => {
                        if self.dispatch(request).await {
                            break;
                        }
                    }
                    None => {
                        self.commands_closed = true;
                        debug!("All session handles dropped");
                        let _ = self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until_opt(deadline) => self.check_deadlines(Instant::now()),
            }
        }
        info!("Session daemon stopped");
    }

    /// Runs a command and any abort that interrupted it. Returns true when the
    /// daemon should exit.
    async fn dispatch(&mut self, request: Request) -> bool {
        let mut exit = false;
        let mut next = Some(request);
        while let Some(Request { command, reply }) = next.take() {
            let name = command.name();
            exit |= matches!(command, SessionCommand::Shutdown);
            debug!(command = name, "Running command");
            let result = self.execute(command).await;
            if let Err(e) = &result {
                warn!(command = name, "Command failed: {}", e);
            }
            let _ = reply.send(result);
            next = self.interrupt.take();
        }
        exit
    }

    async fn execute(&mut self, command: SessionCommand) -> SessionResult<CommandOutput> {
        use SessionCommand as C;
        let done = |_| CommandOutput::Done;
        match command {
            C::New { path, name } => self.new_session(&path, name).await.map(done),
            C::Open { path } => self.open_session(&path).await.map(done),
            C::Save => self
                .save_session()
                .await
                .map(|report| CommandOutput::Saved { report }),
            C::Close => self.close_session().await.map(done),
            C::Abort => self.abort_session().map(done),
            C::Duplicate { name } => self.duplicate_session(&name).await.map(done),
            C::Switch { path } => self.switch_session(&path).await.map(done),
            C::Rename { name } => self.rename_session(&name).map(done),
            C::List | C::Snapshot => self.query(&command),
            C::AddClient(request) => self
                .add_client(request)
                .await
                .map(|client_id| CommandOutput::ClientAdded { client_id }),
            C::AddProxy(request) => self
                .add_proxy(request)
                .await
                .map(|client_id| CommandOutput::ClientAdded { client_id }),
            C::RemoveClient { client_id } => self.remove_client(&client_id).await.map(done),
            C::RestoreClient { client_id } => self.restore_client(&client_id).map(done),
            C::LaunchClient { client_id } => self.launch_client(&client_id).await.map(done),
            C::StopClient { client_id } => self.stop_client(&client_id).await.map(done),
            C::KillClient { client_id } => self.kill_client(&client_id).await.map(done),
            C::SaveClient { client_id } => self.save_client(&client_id).await.map(done),
            C::SetClientProperties {
                client_id,
                properties,
            } => self.set_client_properties(&client_id, properties).map(done),
            C::Shutdown => self.shutdown().await.map(done),
        }
    }

    /// Answers read-only commands; usable while an operation is running.
    fn query(&self, command: &SessionCommand) -> SessionResult<CommandOutput> {
        match command {
            SessionCommand::List => Ok(CommandOutput::Sessions {
                sessions: self.store.list()?,
            }),
            _ => Ok(CommandOutput::Snapshot {
                snapshot: self.snapshot(),
            }),
        }
    }

    /// Keeps processing events until every id in `barrier` satisfies `settled`,
    /// the barrier deadline passes, or an abort arrives.
    pub(super) async fn pump(&mut self, barrier: &mut Barrier, settled: fn(ClientStatus) -> bool) -> Pump {
        loop {
            let session = self.session.as_ref();
            barrier.settle_where(|id| {
                session
                    .and_then(|s| s.client(id))
                    .is_none_or(|client| settled(client.status()))
            });
            if barrier.is_complete() {
                return Pump::Complete;
            }
            if self.interrupt.is_some() {
                return Pump::Interrupted;
            }
            if barrier.is_expired(Instant::now()) {
                return Pump::TimedOut;
            }

            let deadline = match (self.next_deadline(), barrier.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            tokio::select! {
                request = self.commands.recv(), if !self.commands_closed => match request {
                    Some(request) => self.while_busy(request),
                    None => self.commands_closed = true,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until_opt(deadline) => self.check_deadlines(Instant::now()),
            }
        }
    }

    fn while_busy(&mut self, request: Request) {
        if request.command.is_read_only() {
            let result = self.query(&request.command);
            request.respond(result);
            return;
        }
        let interrupts = matches!(
            request.command,
            SessionCommand::Abort | SessionCommand::Shutdown
        );
        if interrupts && self.interrupt.is_none() {
            info!(command = request.command.name(), "Interrupting running operation");
            self.interrupt = Some(request);
        } else {
            debug!(command = request.command.name(), "Rejecting command while busy");
            request.respond(Err(SessionError::OperationPending));
        }
    }

    // ---- events ----

    pub(super) fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Connected { conn, link } => {
                self.links.insert(conn, link);
            }
            DaemonEvent::Received { conn, message } => self.handle_message(conn, message),
            DaemonEvent::Rejected { conn, error } => {
                warn!(%conn, "Rejected client message: {}", error);
                self.send_error(conn, None, codes::MALFORMED, &error.to_string());
            }
            DaemonEvent::Disconnected { conn } => {
                self.links.remove(&conn);
                if let Some(client) = self.client_by_conn_mut(conn) {
                    debug!(client_id = %client.id(), "Client connection closed");
                    client.unbind_conn();
                }
            }
            DaemonEvent::ProcessExited {
                client_id,
                handle,
                exit,
            } => self.handle_exit(&client_id, handle, exit),
        }
    }

    fn handle_message(&mut self, conn: ConnId, message: Message) {
        if let Message::Announce {
            client_id,
            executable,
            capabilities,
        } = message
        {
            self.handle_announce(conn, &client_id, &executable, capabilities);
            return;
        }

        let Some(client_id) = self.client_by_conn_mut(conn).map(|c| c.id().to_string()) else {
            self.send_error(conn, None, codes::OUT_OF_ORDER, "announce first");
            return;
        };
        match message {
            Message::Reply {
                to: RequestKind::Open,
                ..
            } => {
                if self.transition(&client_id, ClientInput::Opened) {
                    info!(client_id = %client_id, "Client ready");
                }
            }
            Message::Reply {
                to: RequestKind::Save,
                ..
            } => self.on_save_acked(&client_id),
            Message::Error {
                to: Some(RequestKind::Open),
                code,
                message,
            } => {
                self.kill_process(&client_id);
                self.transition(&client_id, ClientInput::OpenFailed);
                self.fault(&client_id, ClientError::ErrorReply { code, message });
            }
            Message::Error {
                to: Some(RequestKind::Save),
                code,
                message,
            } => self.on_save_failed(&client_id, ClientError::ErrorReply { code, message }),
            Message::Dirty { dirty } => {
                if let Some(client) = self.client_mut(&client_id) {
                    client.dirty = dirty;
                }
                self.emit(StatusEvent::ClientDirty { client_id, dirty });
            }
            other => {
                debug!(client_id = %client_id, kind = other.kind(), "Ignoring client message");
            }
        }
    }

    fn handle_announce(&mut self, conn: ConnId, client_id: &str, executable: &str, capabilities: Vec<Capability>) {
        if self.client_by_conn_mut(conn).is_some() {
            self.send_error(conn, Some(RequestKind::Announce), codes::OUT_OF_ORDER, "already announced");
            return;
        }
        let status = match self.client_mut(client_id) {
            Some(client) => client.status(),
            None => {
                warn!(client_id, "Announce from unknown client");
                self.send_error(conn, Some(RequestKind::Announce), codes::UNKNOWN_CLIENT, "unknown client id");
                return;
            }
        };
        let already_bound = self.client_mut(client_id).is_some_and(|c| c.conn().is_some());
        if status != ClientStatus::Launch || already_bound {
            warn!(client_id, %status, "Announce out of order");
            self.send_error(conn, Some(RequestKind::Announce), codes::OUT_OF_ORDER, "not expecting an announce");
            return;
        }

        if let Some(client) = self.client_mut(client_id) {
            if client.spec.name() != executable {
                debug!(client_id, announced = executable, "Announced executable differs from launched one");
            }
            client.bind_conn(conn);
            client.spec.capabilities = capabilities;
        }
        self.transition(client_id, ClientInput::Announced);
        self.send_to(
            conn,
            Message::Reply {
                to: RequestKind::Announce,
                message: "welcome".to_string(),
            },
        );
        self.send_open(client_id);
    }

    fn handle_exit(&mut self, client_id: &str, handle: ProcessHandle, exit: ExitInfo) {
        let Some(client) = self.client_mut(client_id) else {
            debug!(client_id, "Exit for client no longer in the session");
            return;
        };
        if client.process() != Some(&handle) {
            debug!(client_id, pid = handle.pid(), "Ignoring exit of a replaced process");
            return;
        }
        let outcome = classify_exit(client.status(), client.last_command, &exit);
        let conn = client.conn();
        if let Some(conn) = conn {
            if matches!(self.links.get(&conn), Some(ClientLink::Proxy(_))) {
                self.links.remove(&conn);
            }
        }

        info!(client_id, code = ?exit.code, signal = ?exit.signal, cause = %outcome.cause, "Client exited");
        if let Some(error) = outcome.error.clone() {
            self.fault(client_id, error);
        }
        self.transition(client_id, outcome.input());
        self.emit(StatusEvent::ClientExit {
            client_id: client_id.to_string(),
            cause: outcome.cause,
        });
    }

    fn on_save_acked(&mut self, client_id: &str) {
        if !self.transition(client_id, ClientInput::SaveAcked) {
            return;
        }
        self.save_results.insert(client_id.to_string(), Ok(()));
        let was_dirty = self.client_mut(client_id).is_some_and(|c| std::mem::take(&mut c.dirty));
        if was_dirty {
            self.emit(StatusEvent::ClientDirty {
                client_id: client_id.to_string(),
                dirty: false,
            });
        }
    }

    pub(super) fn on_save_failed(&mut self, client_id: &str, error: ClientError) {
        if !self.transition(client_id, ClientInput::SaveFailed) {
            return;
        }
        self.save_results.insert(client_id.to_string(), Err(error.clone()));
        self.fault(client_id, error);
    }

    // ---- deadlines ----

    fn next_deadline(&self) -> Option<Instant> {
        self.session
            .as_ref()?
            .clients
            .iter()
            .filter_map(|c| c.deadline.map(|d| d.at))
            .min()
    }

    fn check_deadlines(&mut self, now: Instant) {
        let Some(session) = &self.session else {
            return;
        };
        let due: Vec<(String, DeadlineKind)> = session
            .clients
            .iter()
            .filter_map(|c| {
                c.deadline
                    .filter(|d| d.at <= now)
                    .map(|d| (c.id().to_string(), d.kind))
            })
            .collect();
        for (client_id, kind) in due {
            if let Some(client) = self.client_mut(&client_id) {
                client.clear_deadline();
            }
            self.on_deadline(&client_id, kind);
        }
    }

    fn on_deadline(&mut self, client_id: &str, kind: DeadlineKind) {
        warn!(client_id, ?kind, "Client deadline expired");
        match kind {
            DeadlineKind::Announce => {
                self.kill_process(client_id);
                self.fault(client_id, ClientError::AnnounceTimeout);
                self.transition(client_id, ClientInput::AnnounceTimedOut);
            }
            DeadlineKind::OpenReply => {
                self.kill_process(client_id);
                self.fault(client_id, ClientError::OpenTimeout);
                self.transition(client_id, ClientInput::OpenFailed);
            }
            DeadlineKind::SaveAck => self.on_save_failed(client_id, ClientError::SaveTimeout),
            DeadlineKind::Quit if self.escalate_quit => {
                self.kill_process(client_id);
                self.fault(client_id, ClientError::QuitTimeout);
                let grace = self.config.timeouts.kill_grace();
                self.set_deadline(client_id, grace, DeadlineKind::Kill);
            }
            DeadlineKind::Quit => debug!(client_id, "Quit deadline passed, not escalating"),
            DeadlineKind::Kill => {
                // The exit never arrived; stop tracking the process.
                self.transition(client_id, ClientInput::Exited { failed: false });
                self.emit(StatusEvent::ClientExit {
                    client_id: client_id.to_string(),
                    cause: ExitCause::Expected,
                });
            }
        }
    }

    // ---- helpers ----

    pub(super) fn client_mut(&mut self, client_id: &str) -> Option<&mut Client> {
        self.session.as_mut()?.client_mut(client_id)
    }

    fn client_by_conn_mut(&mut self, conn: ConnId) -> Option<&mut Client> {
        self.session
            .as_mut()?
            .clients
            .iter_mut()
            .find(|c| c.conn() == Some(conn))
    }

    pub(super) fn running_ids(&self) -> Vec<String> {
        self.session
            .iter()
            .flat_map(|s| s.clients.iter())
            .filter(|c| c.status().is_running())
            .map(|c| c.id().to_string())
            .collect()
    }

    pub(super) fn require_session(&self) -> SessionResult<&Session> {
        self.session.as_ref().ok_or(SessionError::NoSessionOpen)
    }

    pub(super) fn require_session_mut(&mut self) -> SessionResult<&mut Session> {
        self.session.as_mut().ok_or(SessionError::NoSessionOpen)
    }

    pub(super) fn set_deadline(&mut self, client_id: &str, after: Duration, kind: DeadlineKind) {
        if let Some(client) = self.client_mut(client_id) {
            client.set_deadline(Instant::now() + after, kind);
        }
    }

    /// Applies a lifecycle input and reports the new status. Invalid inputs are
    /// logged and dropped.
    pub(super) fn transition(&mut self, client_id: &str, input: ClientInput) -> bool {
        let Some(client) = self.client_mut(client_id) else {
            return false;
        };
        match client.apply(input) {
            Ok(status) => {
                client.clear_deadline();
                debug!(client_id, %status, "Client status changed");
                self.emit(StatusEvent::Client {
                    client_id: client_id.to_string(),
                    status,
                });
                true
            }
            Err(e) => {
                debug!(client_id, "Ignoring client input: {}", e);
                false
            }
        }
    }

    pub(super) fn fault(&mut self, client_id: &str, error: ClientError) {
        warn!(client_id, "Client fault: {}", error);
        if let Some(client) = self.client_mut(client_id) {
            client.last_error = Some(error.clone());
        }
        self.emit(StatusEvent::ClientFault {
            client_id: client_id.to_string(),
            error,
        });
    }

    pub(super) fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        let name = self.session.as_ref().map(|s| s.name.clone());
        info!(%status, session = ?name, "Session status changed");
        self.emit(StatusEvent::Session { status, name });
    }

    pub(super) fn mark_dirty(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if !session.dirty {
                session.dirty = true;
                self.emit(StatusEvent::SessionDirty { dirty: true });
            }
        }
    }

    /// Broadcasts an event and republishes the snapshot.
    pub(super) fn emit(&mut self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.status_tx.send(event);
        self.publish();
    }

    pub(super) fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> SessionSnapshot {
        match &self.session {
            Some(session) => SessionSnapshot {
                status: self.status,
                name: Some(session.name.clone()),
                path: Some(session.path.clone()),
                dirty: session.dirty,
                clients: session.clients.iter().map(ClientSnapshot::from).collect(),
                trash: session.trash.iter().map(|s| s.id.clone()).collect(),
            },
            None => SessionSnapshot {
                status: self.status,
                ..SessionSnapshot::default()
            },
        }
    }

    pub(super) fn install(&mut self, loaded: LoadedSession) {
        self.session = Some(Session::from_loaded(loaded));
        self.publish();
    }

    /// Drops the session, releasing its lock.
    pub(super) fn unload(&mut self) {
        if let Some(session) = self.session.take() {
            info!(session = %session.name, "Session unloaded");
        }
        self.publish();
    }

    fn send_to(&self, conn: ConnId, message: Message) -> bool {
        self.links.get(&conn).is_some_and(|link| link.send(message))
    }

    pub(super) fn send_to_client(&mut self, client_id: &str, message: Message) -> bool {
        match self.client_mut(client_id).and_then(|c| c.conn()) {
            Some(conn) => self.send_to(conn, message),
            None => false,
        }
    }

    fn send_error(&self, conn: ConnId, to: Option<RequestKind>, code: i32, message: &str) {
        self.send_to(
            conn,
            Message::Error {
                to,
                code,
                message: message.to_string(),
            },
        );
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
