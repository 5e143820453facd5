//! Fixtures for daemon scenario tests: a daemon on temp directories, a fake
//! native client speaking the codec over the bus socket, and feed helpers.

use crate::client::ClientStatus;
use crate::config::{DaemonConfig, Timeouts};
use crate::persistence::{SessionDescriptor, SessionStore};
use crate::protocol::{self, Capability, Message, RequestKind};
use crate::session::{SessionDaemon, SessionHandle, StatusEvent};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// A long-running process standing in for a native client.
pub const SLEEPER: &str = "sleep";

/// Proxy target that ignores SIGTERM.
pub const STUBBORN: &str = "trap '' TERM; while :; do sleep 0.05; done";

/// Proxy target that exits on SIGTERM.
pub const OBEDIENT: &str = "while :; do sleep 0.05; done";

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        announce_ms: 2_000,
        reply_ms: 1_000,
        save_all_ms: 1_500,
        quit_ms: 600,
        kill_grace_ms: 1_000,
    }
}

pub struct TestDaemon {
    pub handle: SessionHandle,
    pub root: PathBuf,
    pub bus_path: PathBuf,
    task: JoinHandle<()>,
    _runtime: TempDir,
    _root: Option<TempDir>,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with(fast_timeouts())
    }

    pub fn start_with(timeouts: Timeouts) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut daemon = Self::start_at(root.path(), timeouts);
        daemon._root = Some(root);
        daemon
    }

    /// Starts a daemon on an existing root, with its own runtime directory.
    pub fn start_at(root: &Path, timeouts: Timeouts) -> Self {
        let runtime = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            session_root: root.to_path_buf(),
            runtime_dir: runtime.path().to_path_buf(),
            timeouts,
            log_file: None,
        };
        let bus_path = config.bus_socket_path();
        let (handle, task) = SessionDaemon::spawn(config).unwrap();
        Self {
            handle,
            root: root.to_path_buf(),
            bus_path,
            task,
            _runtime: runtime,
            _root: None,
        }
    }

    pub fn session_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Spawns a fake native client that answers open and, if `answer_save`,
    /// save. On quit it terminates the process the daemon launched for it.
    pub fn spawn_client(&self, client_id: &str, capabilities: &[Capability], answer_save: bool) -> JoinHandle<()> {
        let bus = self.bus_path.clone();
        let handle = self.handle.clone();
        let client_id = client_id.to_string();
        let capabilities = capabilities.to_vec();
        tokio::spawn(async move {
            let mut client = FakeClient::announce(&bus, &client_id, &capabilities).await;
            while let Some(message) = client.next_message().await {
                match message {
                    Message::Open { .. } => client.reply(RequestKind::Open).await,
                    Message::Save if answer_save => client.reply(RequestKind::Save).await,
                    Message::Quit => {
                        let pid = handle.snapshot().client(&client_id).and_then(|c| c.pid);
                        if let Some(pid) = pid {
                            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    pub async fn stop(self) {
        let _ = self.handle.shutdown().await;
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

pub struct FakeClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeClient {
    /// Connects and announces, retrying until the daemon is waiting for
    /// this client.
    pub async fn announce(bus: &Path, client_id: &str, capabilities: &[Capability]) -> Self {
        let give_up = Instant::now() + WAIT;
        loop {
            if let Some(client) = Self::try_announce(bus, client_id, capabilities).await {
                return client;
            }
            assert!(Instant::now() < give_up, "announce of {} never accepted", client_id);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn try_announce(bus: &Path, client_id: &str, capabilities: &[Capability]) -> Option<Self> {
        let mut client = Self::connect(bus).await?;
        client
            .send(&Message::Announce {
                client_id: client_id.to_string(),
                executable: SLEEPER.to_string(),
                capabilities: capabilities.to_vec(),
            })
            .await;
        match client.recv().await {
            Some(Message::Reply {
                to: RequestKind::Announce,
                ..
            }) => Some(client),
            _ => None,
        }
    }

    pub async fn connect(bus: &Path) -> Option<Self> {
        let stream = UnixStream::connect(bus).await.ok()?;
        let (read, writer) = stream.into_split();
        Some(Self {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }

    pub async fn send(&mut self, message: &Message) {
        self.send_raw(&protocol::encode(message)).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        let _ = self.writer.write_all(format!("{}\n", line).as_bytes()).await;
    }

    /// Writes bytes as they are, for lines that are not valid messages.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes).await;
    }

    pub async fn reply(&mut self, to: RequestKind) {
        self.send(&Message::Reply {
            to,
            message: String::new(),
        })
        .await;
    }

    /// Next message, or `None` if the connection closed or nothing arrived in time.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.next_message()).await.ok()?
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        let line = self.lines.next_line().await.ok()??;
        protocol::decode_from_daemon(&line).ok()
    }
}

/// Reads the feed until `done` matches, returning everything seen.
pub async fn collect_until(
    feed: &mut broadcast::Receiver<StatusEvent>,
    mut done: impl FnMut(&StatusEvent) -> bool,
) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let finished = tokio::time::timeout(WAIT, async {
        loop {
            match feed.recv().await {
                Ok(event) => {
                    let stop = done(&event);
                    seen.push(event);
                    if stop {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("status feed closed: {}", e),
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "expected event never arrived, saw {:?}", seen);
    seen
}

/// Waits until the snapshot shows `client_id` with a status matching `pred`.
pub async fn wait_for_client(handle: &SessionHandle, client_id: &str, pred: impl Fn(ClientStatus) -> bool) {
    let mut watch = handle.watch();
    let reached = tokio::time::timeout(WAIT, async {
        loop {
            let matched = watch
                .borrow_and_update()
                .client(client_id)
                .is_some_and(|c| pred(c.status));
            if matched || watch.changed().await.is_err() {
                return matched;
            }
        }
    })
    .await;
    assert_eq!(reached, Ok(true), "client {} never reached the expected status", client_id);
}

pub fn read_descriptor(session_dir: &Path) -> SessionDescriptor {
    let content = std::fs::read_to_string(SessionStore::descriptor_path(session_dir)).unwrap();
    SessionDescriptor::parse(&content).unwrap()
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}
