//! Client lifecycle transitions.
//!
//! `next_status` is the only place that decides which status follows which.
//! It is a pure function so the whole table can be exercised without processes.

use super::{ClientStatus, LastCommand};
use crate::error::{ClientError, ExitCause};
use crate::supervisor::ExitInfo;

/// Something that happened to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInput {
    /// Process spawned
    Launched,
    /// Executable missing or not runnable
    LaunchFailed,
    /// Valid announce received
    Announced,
    /// Client replied to open
    Opened,
    SaveRequested,
    SaveAcked,
    /// Save answered with an error or timed out
    SaveFailed,
    /// Kept alive across a session switch, asked to reopen
    SwitchRequested,
    QuitRequested,
    AnnounceTimedOut,
    /// Open answered with an error or timed out
    OpenFailed,
    /// Process exited; `failed` follows [`classify_exit`]
    Exited { failed: bool },
    Removed,
    Restored,
}

impl ClientInput {
    fn name(self) -> &'static str {
        match self {
            ClientInput::Launched => "launched",
            ClientInput::LaunchFailed => "launch_failed",
            ClientInput::Announced => "announced",
            ClientInput::Opened => "opened",
            ClientInput::SaveRequested => "save_requested",
            ClientInput::SaveAcked => "save_acked",
            ClientInput::SaveFailed => "save_failed",
            ClientInput::SwitchRequested => "switch_requested",
            ClientInput::QuitRequested => "quit_requested",
            ClientInput::AnnounceTimedOut => "announce_timed_out",
            ClientInput::OpenFailed => "open_failed",
            ClientInput::Exited { .. } => "exited",
            ClientInput::Removed => "removed",
            ClientInput::Restored => "restored",
        }
    }
}

/// Input not valid in the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ClientStatus,
    pub input: &'static str,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot apply '{}' in status '{}'", self.input, self.from)
    }
}

impl std::error::Error for TransitionError {}

/// Computes the status that follows `input` in `from`.
pub fn next_status(from: ClientStatus, input: ClientInput) -> Result<ClientStatus, TransitionError> {
    use ClientInput as I;
    use ClientStatus as S;

    let next = match (from, input) {
        (S::Stopped | S::Error | S::Noop, I::Launched) => S::Launch,
        (S::Stopped | S::Error | S::Noop, I::LaunchFailed) => S::Error,
        (S::Launch, I::Announced) => S::Open,
        (S::Launch, I::AnnounceTimedOut) => S::Error,
        (S::Open | S::Switch, I::Opened) => S::Ready,
        (S::Open | S::Switch, I::OpenFailed) => S::Error,
        (S::Ready, I::SaveRequested) => S::Save,
        (S::Save, I::SaveAcked | I::SaveFailed) => S::Ready,
        (S::Ready, I::SwitchRequested) => S::Switch,
        (s, I::QuitRequested) if s.is_running() => S::Quit,
        (s, I::Exited { failed }) if s.is_running() => {
            if failed {
                S::Error
            } else {
                S::Stopped
            }
        }
        (S::Stopped | S::Error, I::Removed) => S::Removed,
        (S::Removed, I::Restored) => S::Stopped,
        _ => {
            return Err(TransitionError {
                from,
                input: input.name(),
            })
        }
    };
    Ok(next)
}

/// How an exit is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub cause: ExitCause,
    pub error: Option<ClientError>,
}

impl ExitOutcome {
    pub fn input(&self) -> ClientInput {
        ClientInput::Exited {
            failed: self.error.is_some(),
        }
    }
}

/// Classifies a process exit. An exit is expected when the daemon asked the
/// client to stop, whatever the exit code; any other exit is a fault.
pub fn classify_exit(status: ClientStatus, last_command: LastCommand, exit: &ExitInfo) -> ExitOutcome {
    if status == ClientStatus::Quit || last_command == LastCommand::Stop {
        return ExitOutcome {
            cause: ExitCause::Expected,
            error: None,
        };
    }
    ExitOutcome {
        cause: ExitCause::Unexpected,
        error: Some(ClientError::UnexpectedExit {
            code: exit.code,
            signal: exit.signal,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientInput as I;
    use ClientStatus as S;

    #[test]
    fn test_happy_path() {
        let mut status = S::Stopped;
        for (input, expected) in [
            (I::Launched, S::Launch),
            (I::Announced, S::Open),
            (I::Opened, S::Ready),
            (I::SaveRequested, S::Save),
            (I::SaveAcked, S::Ready),
            (I::QuitRequested, S::Quit),
            (I::Exited { failed: false }, S::Stopped),
        ] {
            status = next_status(status, input).unwrap();
            assert_eq!(status, expected, "after {:?}", input);
        }
    }

    #[test]
    fn test_announce_timeout_is_error_and_relaunchable() {
        let status = next_status(S::Launch, I::AnnounceTimedOut).unwrap();
        assert_eq!(status, S::Error);
        assert!(!status.is_running());
        assert_eq!(next_status(status, I::Launched).unwrap(), S::Launch);
    }

    #[test]
    fn test_remove_only_when_not_running() {
        assert_eq!(next_status(S::Stopped, I::Removed).unwrap(), S::Removed);
        assert_eq!(next_status(S::Error, I::Removed).unwrap(), S::Removed);
        for status in [S::Launch, S::Ready, S::Save, S::Quit] {
            let err = next_status(status, I::Removed).unwrap_err();
            assert_eq!(err.from, status);
        }
        assert_eq!(next_status(S::Removed, I::Restored).unwrap(), S::Stopped);
    }

    #[test]
    fn test_out_of_order_inputs_rejected() {
        assert!(next_status(S::Stopped, I::Announced).is_err());
        assert!(next_status(S::Ready, I::Announced).is_err());
        assert!(next_status(S::Launch, I::SaveRequested).is_err());
        assert!(next_status(S::Stopped, I::Exited { failed: true }).is_err());
        assert!(next_status(S::Removed, I::Launched).is_err());
    }

    #[test]
    fn test_switch_reopen() {
        let status = next_status(S::Ready, I::SwitchRequested).unwrap();
        assert_eq!(status, S::Switch);
        assert_eq!(next_status(status, I::Opened).unwrap(), S::Ready);
    }

    #[test]
    fn test_classify_exit() {
        let clean = ExitInfo {
            code: Some(0),
            signal: None,
        };
        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };

        let outcome = classify_exit(S::Quit, LastCommand::Stop, &killed);
        assert_eq!(outcome.cause, ExitCause::Expected);
        assert_eq!(outcome.input(), I::Exited { failed: false });

        let outcome = classify_exit(S::Ready, LastCommand::Open, &clean);
        assert_eq!(outcome.cause, ExitCause::Unexpected);
        assert_eq!(
            outcome.error,
            Some(ClientError::UnexpectedExit {
                code: Some(0),
                signal: None
            })
        );
        assert_eq!(outcome.input(), I::Exited { failed: true });

        // A stop was issued but the status has not caught up yet
        let outcome = classify_exit(S::Ready, LastCommand::Stop, &killed);
        assert_eq!(outcome.cause, ExitCause::Expected);
    }
}
