use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use session_conductor::client::PrefixMode;
use session_conductor::config::DaemonConfig;
use session_conductor::control::{self, ControlClient, ControlRequest, ControlResponse};
use session_conductor::session::{
    AddClientRequest, AddProxyRequest, ClientProperties, CommandOutput, SessionCommand, SessionDaemon,
};
use session_conductor::{logging, paths};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Launch, save and restore sessions of cooperating audio programs")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Config file (defaults to ~/.conductor/config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session root directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session daemon
    Daemon {
        /// Log file (defaults to ~/.conductor/daemon.log)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Log to stderr instead of a file
        #[arg(long)]
        stderr: bool,
    },

    /// Create a session and make it current
    New {
        path: PathBuf,
        /// Display name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Open an existing session
    Open { path: PathBuf },

    /// Save the current session
    Save,

    /// Save, stop all clients and unload the session
    Close,

    /// Cancel the running operation, or drop the session without saving
    Abort,

    /// Save the session under a new name and switch to the copy
    Duplicate { name: String },

    /// Switch to another session, keeping clients that support it
    Switch { path: PathBuf },

    /// Rename the current session (no client may be running)
    Rename { name: String },

    /// List sessions under the root
    List,

    /// Show the daemon's current state
    Status,

    /// Add a client speaking the session protocol
    Add {
        executable: String,
        /// Launch right away
        #[arg(long)]
        start: bool,
        #[arg(long)]
        label: Option<String>,
        /// Prefix the client directory with this text instead of the session name
        #[arg(long)]
        prefix: Option<String>,
        /// Prefix the client directory with the client name
        #[arg(long, conflicts_with = "prefix")]
        client_name_prefix: bool,
        #[arg(trailing_var_arg = true)]
        arguments: Vec<String>,
    },

    /// Add a program driven by signals
    AddProxy {
        executable: String,
        #[arg(long)]
        start: bool,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        icon: Option<String>,
        /// Config file passed to the program
        #[arg(long)]
        config_file: Option<PathBuf>,
        /// Copy the config file into the client directory
        #[arg(long, requires = "config_file")]
        copy_config: bool,
        /// Signal number that makes the program save
        #[arg(long)]
        save_signal: Option<i32>,
        /// Signal number that makes the program quit (default SIGTERM)
        #[arg(long)]
        stop_signal: Option<i32>,
        #[arg(trailing_var_arg = true)]
        arguments: Vec<String>,
    },

    /// Move a client to the trash
    Remove { client_id: String },

    /// Bring a client back from the trash
    Restore { client_id: String },

    /// Start a stopped client
    Launch { client_id: String },

    /// Ask a client to quit
    Stop { client_id: String },

    /// Kill a client immediately
    Kill { client_id: String },

    /// Save one client without writing the session file
    SaveClient { client_id: String },

    /// Change a client's label, description or icon
    Set {
        client_id: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        icon: Option<String>,
    },

    /// Print status events as they happen
    Watch,

    /// Close the session and stop the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::resolve(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.session_root = root;
    }

    match cli.command {
        Commands::Daemon { log_file, stderr } => {
            let log_file = match (stderr, log_file.or_else(|| config.log_file.clone())) {
                (true, _) => None,
                (false, Some(path)) => Some(path),
                (false, None) => Some(paths::default_log_path()?),
            };
            logging::init("info", log_file.as_deref())?;
            run_daemon(config).await
        }
        Commands::Watch => {
            logging::init("warn", None)?;
            watch(&config.control_socket_path()).await
        }
        command => {
            logging::init("warn", None)?;
            let command = session_command(command)?;
            run_command(&config.control_socket_path(), command).await
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let socket = config.control_socket_path();
    let listener = control::bind(&socket).await?;
    info!(
        root = %config.session_root.display(),
        build_sha = session_conductor::BUILD_SHA,
        "Daemon starting"
    );

    let (handle, mut session_task) = SessionDaemon::spawn(config)?;
    let server = tokio::spawn(control::serve(listener, handle.clone()));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let interrupted = tokio::select! {
        _ = &mut session_task => None,
        _ = tokio::signal::ctrl_c() => Some("SIGINT"),
        _ = sigterm.recv() => Some("SIGTERM"),
    };
    if let Some(signal) = interrupted {
        info!(signal, "Shutting down");
        if let Err(e) = handle.shutdown().await {
            warn!("Shutdown failed: {}", e);
        }
        let _ = session_task.await;
    }

    server.abort();
    let _ = std::fs::remove_file(&socket);
    info!("Daemon stopped");
    Ok(())
}

/// Maps a front-end subcommand to the command sent to the daemon.
fn session_command(command: Commands) -> Result<SessionCommand> {
    let command = match command {
        Commands::New { path, name } => SessionCommand::New {
            path: absolute(path)?,
            name,
        },
        Commands::Open { path } => SessionCommand::Open { path: absolute(path)? },
        Commands::Save => SessionCommand::Save,
        Commands::Close => SessionCommand::Close,
        Commands::Abort => SessionCommand::Abort,
        Commands::Duplicate { name } => SessionCommand::Duplicate { name },
        Commands::Switch { path } => SessionCommand::Switch { path: absolute(path)? },
        Commands::Rename { name } => SessionCommand::Rename { name },
        Commands::List => SessionCommand::List,
        Commands::Status => SessionCommand::Snapshot,
        Commands::Add {
            executable,
            start,
            label,
            prefix,
            client_name_prefix,
            arguments,
        } => {
            let mut request = AddClientRequest::new(&executable);
            request.arguments = arguments;
            request.start = start;
            request.label = label;
            request.prefix_mode = match (&prefix, client_name_prefix) {
                (Some(_), _) => PrefixMode::Custom,
                (None, true) => PrefixMode::ClientName,
                (None, false) => PrefixMode::SessionName,
            };
            request.custom_prefix = prefix;
            SessionCommand::AddClient(request)
        }
        Commands::AddProxy {
            executable,
            start,
            label,
            icon,
            config_file,
            copy_config,
            save_signal,
            stop_signal,
            arguments,
        } => {
            let mut request = AddProxyRequest::new(&executable);
            request.arguments = arguments;
            request.start = start;
            request.label = label;
            request.icon = icon;
            request.config_file = config_file.map(absolute).transpose()?;
            request.copy_config = copy_config;
            request.save_signal = save_signal;
            request.stop_signal = stop_signal;
            SessionCommand::AddProxy(request)
        }
        Commands::Remove { client_id } => SessionCommand::RemoveClient { client_id },
        Commands::Restore { client_id } => SessionCommand::RestoreClient { client_id },
        Commands::Launch { client_id } => SessionCommand::LaunchClient { client_id },
        Commands::Stop { client_id } => SessionCommand::StopClient { client_id },
        Commands::Kill { client_id } => SessionCommand::KillClient { client_id },
        Commands::SaveClient { client_id } => SessionCommand::SaveClient { client_id },
        Commands::Set {
            client_id,
            label,
            description,
            icon,
        } => SessionCommand::SetClientProperties {
            client_id,
            properties: ClientProperties {
                label,
                description,
                icon,
            },
        },
        Commands::Shutdown => SessionCommand::Shutdown,
        Commands::Daemon { .. } | Commands::Watch => {
            anyhow::bail!("Not a session command")
        }
    };
    Ok(command)
}

/// Relative paths on the command line are relative to the shell, not the daemon.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

async fn run_command(socket: &Path, command: SessionCommand) -> Result<()> {
    let response = control::send_request(socket, ControlRequest::Command { command }).await?;
    match response {
        ControlResponse::Output { output } => {
            print_output(output)?;
            Ok(())
        }
        ControlResponse::Error { error } => {
            anyhow::bail!("{} (code {})", error, error.code())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

fn print_output(output: CommandOutput) -> Result<()> {
    match output {
        CommandOutput::Done => println!("ok"),
        CommandOutput::ClientAdded { client_id } => println!("{}", client_id),
        CommandOutput::Sessions { sessions } => {
            for session in sessions {
                let saved = session
                    .saved_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never saved".to_string());
                println!("{}\t{}\t{}", session.name, saved, session.path.display());
            }
        }
        CommandOutput::Saved { report } => {
            for client_id in &report.saved {
                println!("saved   {}", client_id);
            }
            for client_id in &report.skipped {
                println!("skipped {}", client_id);
            }
            for failure in &report.failed {
                println!("failed  {}: {}", failure.client_id, failure.error);
            }
            if !report.persisted {
                println!("session file not written");
            }
        }
        CommandOutput::Snapshot { snapshot } => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}

async fn watch(socket: &Path) -> Result<()> {
    let mut feed = ControlClient::connect(socket).await?.subscribe().await?;
    while let Some(event) = feed.next_event().await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
