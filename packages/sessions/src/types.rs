// ABOUTME: Session record and lifecycle state machine
// ABOUTME: Encodes which state changes the registry is allowed to make

use chrono::{DateTime, Utc};
use corral_sandbox::SandboxHandle;
use corral_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "created" => Ok(Self::Created),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    /// Edges of the lifecycle graph
    ///
    /// Created is never re-entered and Running is only reachable through
    /// Starting.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopping)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub sandbox: Option<SandboxHandle>,
    pub current_execution_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: SessionState::Created,
            sandbox: None,
            current_execution_id: None,
            error_message: None,
            created_at: now,
            last_active_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 6] = [
        SessionState::Created,
        SessionState::Starting,
        SessionState::Running,
        SessionState::Stopping,
        SessionState::Stopped,
        SessionState::Error,
    ];

    #[test]
    fn test_state_string_roundtrip() {
        for state in ALL {
            assert_eq!(SessionState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(SessionState::from_str("paused").is_err());
    }

    #[test]
    fn test_created_is_never_reentered() {
        for state in ALL {
            assert!(!state.can_transition_to(SessionState::Created));
        }
    }

    #[test]
    fn test_running_only_reachable_from_starting() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(SessionState::Running),
                state == SessionState::Starting,
                "{} -> running",
                state
            );
        }
    }
}
