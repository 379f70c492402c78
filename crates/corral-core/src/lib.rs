//! Container lifecycle and supervision for corral.
//!
//! A `Container` owns one isolated process: its identity, limits, assembled
//! root filesystem and the `Created → Starting → Running → Stopping →
//! Stopped` state machine (`lifecycle`). The `Registry` is the daemon's
//! concurrent `id → Container` map and the entry point for run/stop/list.
//! Records are persisted as JSON under the state directory (`store`) so a
//! restarted daemon can pick up containers that are still alive.

pub mod container;
pub mod id;
pub mod lifecycle;
pub mod lock;
pub mod registry;
pub mod store;

pub use container::{Container, ContainerConfig, ContainerInfo};
pub use id::generate_id;
pub use lifecycle::{validate_transition, ContainerState};
pub use lock::StateLock;
pub use registry::{Registry, RegistryOptions, RunRequest};
pub use store::{ContainerRecord, ContainerStore};

use corral_layers::LayerError;
use corral_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("filesystem error: {0}")]
    Filesystem(#[from] LayerError),
    #[error("namespace error: {0}")]
    Namespace(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("container not found")]
    NotFound(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Resource(msg) => Self::Resource(msg),
            RuntimeError::Io(e) => Self::Io(e),
            other @ (RuntimeError::Namespace(_) | RuntimeError::Exec(_)) => {
                Self::Namespace(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_renders_exact_message() {
        let e = CoreError::NotFound("abc".to_owned());
        assert_eq!(e.to_string(), "container not found");
    }

    #[test]
    fn runtime_errors_map_to_kinds() {
        let e: CoreError = RuntimeError::Resource("pids.max".to_owned()).into();
        assert!(matches!(e, CoreError::Resource(ref m) if m == "pids.max"));

        let e: CoreError = RuntimeError::Namespace("EPERM".to_owned()).into();
        assert!(matches!(e, CoreError::Namespace(ref m) if m.contains("EPERM")));

        let e: CoreError = RuntimeError::Exec("no such file".to_owned()).into();
        assert!(matches!(e, CoreError::Namespace(_)));
    }

    #[test]
    fn layer_errors_become_filesystem_errors() {
        let e: CoreError = LayerError::DuplicateOrdinal(1).into();
        assert!(matches!(e, CoreError::Filesystem(_)));
    }
}
