use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Starting => write!(f, "starting"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopping => write!(f, "stopping"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Failed => write!(f, "failed"),
        }
    }
}

pub fn validate_transition(from: ContainerState, to: ContainerState) -> Result<(), CoreError> {
    use ContainerState::{Created, Failed, Running, Starting, Stopped, Stopping};

    let valid = matches!(
        (from, to),
        (Created, Starting | Stopped)
            | (Starting, Running | Stopping)
            | (Running, Stopping | Stopped)
            | (Stopping, Stopped)
            | (Created | Starting | Running | Stopping, Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
