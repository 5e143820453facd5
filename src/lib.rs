//! Session daemon that launches, saves and restores groups of cooperating
//! audio programs as named sessions.
//!
//! The daemon runs one session task ([`session::SessionDaemon`]) that owns all
//! state. Clients talk to it over the client bus ([`bus`]) using the line
//! protocol in [`protocol`]; front-ends use the control socket ([`control`]).

pub mod bus;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod paths;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod supervisor;

/// Git revision this build came from, or "unknown".
pub const BUILD_SHA: &str = env!("CONDUCTOR_GIT_SHA");
