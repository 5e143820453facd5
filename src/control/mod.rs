//! Front-end control socket.
//!
//! - **Protocol (`protocol.rs`)**: `ControlRequest` / `ControlResponse` NDJSON types.
//! - **Server (`server.rs`)**: per-connection tasks forwarding commands to the
//!   session task and streaming the status feed.
//! - **Client (`client.rs`)**: connection used by the CLI subcommands.

pub mod client;
pub mod protocol;
pub mod server;

#[cfg(test)]
#[path = "tests/control_tests.rs"]
mod control_tests;

pub use client::{send_request, ControlClient, StatusFeed};
pub use protocol::{ControlRequest, ControlResponse};
pub use server::{bind, serve};
