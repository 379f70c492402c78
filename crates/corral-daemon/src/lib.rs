//! `corrald`: the corral container daemon.
//!
//! Owns the container [`Registry`](corral_core::Registry) and serves the
//! newline-delimited JSON protocol in [`protocol`] over a Unix socket. Each
//! connection is handled on its own tokio task; lifecycle work runs on the
//! blocking pool. [`client`] is the blocking counterpart used by the `corral`
//! CLI.

pub mod client;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod server;

pub use client::Client;
pub use config::DaemonConfig;
pub use protocol::{Command, CommandKind, ProtocolError, Response};
pub use server::{dispatch, format_list, handle_connection, Server, ServerOptions};

use corral_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("state directory {0} is locked by another corrald")]
    Lock(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
