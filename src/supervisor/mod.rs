//! Process supervisor.
//!
//! Starts client processes, forwards their output to the log, watches for their
//! exit and delivers signals. Exits are reported asynchronously as
//! [`DaemonEvent::ProcessExited`]; nothing here blocks on a child.

pub mod proxy;

use crate::bus::DaemonEvent;
use crate::error::ClientError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment variable holding the client bus socket path.
pub const ENV_URL: &str = "CONDUCTOR_URL";
/// Environment variable holding the client id.
pub const ENV_CLIENT_ID: &str = "CONDUCTOR_CLIENT_ID";
/// Environment variable holding the session name.
pub const ENV_SESSION_NAME: &str = "CONDUCTOR_SESSION_NAME";
/// Environment variable holding the client's config file, if any.
pub const ENV_CONFIG_FILE: &str = "CONDUCTOR_CONFIG_FILE";

/// Identifies one started process.
///
/// The generation distinguishes successive launches of the same client, so an
/// exit notification for an old process never touches a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
    generation: u64,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(test)]
    pub fn new_for_test(pid: u32, generation: u64) -> Self {
        Self { pid, generation }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Everything needed to start one client.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub client_id: String,
    pub executable: String,
    pub arguments: Vec<String>,
    /// Per-client directory inside the session; created if missing
    pub working_dir: PathBuf,
    pub session_name: String,
    pub config_file: Option<PathBuf>,
    /// Client bus socket the client should connect to
    pub bus_path: PathBuf,
}

/// Spawns and signals client processes.
pub struct Supervisor {
    events: mpsc::UnboundedSender<DaemonEvent>,
    next_generation: u64,
}

impl Supervisor {
    pub fn new(events: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        Self {
            events,
            next_generation: 1,
        }
    }

    /// Starts a client process.
    ///
    /// Failure to find or start the executable is returned immediately and
    /// leaves nothing running.
    pub fn launch(&mut self, ctx: &LaunchContext) -> Result<ProcessHandle, ClientError> {
        let failed = |reason: String| ClientError::LaunchFailed {
            executable: ctx.executable.clone(),
            reason,
        };

        let program = which::which(&ctx.executable).map_err(|e| failed(e.to_string()))?;
        std::fs::create_dir_all(&ctx.working_dir)
            .map_err(|e| failed(format!("cannot create {}: {}", ctx.working_dir.display(), e)))?;

        let mut cmd = Command::new(&program);
        cmd.args(&ctx.arguments)
            .current_dir(&ctx.working_dir)
            .env(ENV_URL, &ctx.bus_path)
            .env(ENV_CLIENT_ID, &ctx.client_id)
            .env(ENV_SESSION_NAME, &ctx.session_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &ctx.config_file {
            Some(path) => {
                cmd.env(ENV_CONFIG_FILE, path);
            }
            None => {
                cmd.env_remove(ENV_CONFIG_FILE);
            }
        }

        let mut child = cmd.spawn().map_err(|e| failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| failed("process exited before it could be tracked".to_string()))?;

        let handle = ProcessHandle {
            pid,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        info!(client_id = %ctx.client_id, pid, program = %program.display(), "Launched client");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(ctx.client_id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(ctx.client_id.clone(), "stderr", stderr));
        }

        let events = self.events.clone();
        let client_id = ctx.client_id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!(client_id = %client_id, pid, "Failed to wait for client: {}", e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            debug!(client_id = %client_id, pid, ?exit, "Client process exited");
            let _ = events.send(DaemonEvent::ProcessExited {
                client_id,
                handle,
                exit,
            });
        });

        Ok(handle)
    }

    /// Delivers `signal` to the process. Returns false if it is already gone.
    pub fn terminate(&self, handle: &ProcessHandle, sig: Signal) -> bool {
        send_signal(handle.pid, sig)
    }

    /// Forced termination.
    pub fn kill(&self, handle: &ProcessHandle) -> bool {
        send_signal(handle.pid, Signal::SIGKILL)
    }
}

pub(crate) fn send_signal(pid: u32, sig: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 1 {
        warn!(pid, "Refusing to signal protected pid");
        return false;
    }
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => {
            debug!(pid, signal = %sig, "Signal delivered");
            true
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, signal = %sig, "Process already gone");
            false
        }
        Err(e) => {
            warn!(pid, signal = %sig, "Failed to deliver signal: {}", e);
            false
        }
    }
}

async fn forward_output<R>(client_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "client_output", client_id = %client_id, stream, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(dir: &std::path::Path, executable: &str, args: &[&str]) -> LaunchContext {
        LaunchContext {
            client_id: "synth".to_string(),
            executable: executable.to_string(),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            working_dir: dir.join("gig.synth"),
            session_name: "gig".to_string(),
            config_file: None,
            bus_path: dir.join("bus.sock"),
        }
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<DaemonEvent>) -> (ProcessHandle, ExitInfo) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit event within timeout")
            .expect("channel open");
        match event {
            DaemonEvent::ProcessExited { handle, exit, .. } => (handle, exit),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_fails_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);

        let err = supervisor
            .launch(&context(dir.path(), "definitely-not-a-real-binary-xyz", &[]))
            .unwrap_err();
        assert!(matches!(err, ClientError::LaunchFailed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_launch_creates_working_dir_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);

        let ctx = context(
            dir.path(),
            "sh",
            &["-c", "test \"$CONDUCTOR_CLIENT_ID\" = synth && touch marker"],
        );
        let handle = supervisor.launch(&ctx).unwrap();
        let (exited, exit) = next_exit(&mut rx).await;

        assert_eq!(exited, handle);
        assert_eq!(exit.code, Some(0));
        assert!(ctx.working_dir.join("marker").exists());
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(tx);

        let first = supervisor.launch(&context(dir.path(), "sleep", &["30"])).unwrap();
        let second = supervisor.launch(&context(dir.path(), "sleep", &["30"])).unwrap();
        assert_ne!(first, second);

        assert!(supervisor.kill(&first));
        let (exited, exit) = next_exit(&mut rx).await;
        assert_eq!(exited, first);
        assert_eq!(exit.signal, Some(9));

        assert!(supervisor.terminate(&second, Signal::SIGTERM));
        let (exited, exit) = next_exit(&mut rx).await;
        assert_eq!(exited, second);
        assert_eq!(exit.signal, Some(15));
    }
}
