// ABOUTME: Per-session execution slot guard
// ABOUTME: Holds the single running execution of a session and frees the slot exactly once

use crate::registry::SessionEntry;
use crate::storage::SessionStorage;
use corral_sandbox::SandboxHandle;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Why the holder of a slot is being asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// An explicit cancel request for this execution
    User,
    /// The session is being stopped or deleted
    SessionStopped,
    /// The sandbox failed a health check while the execution ran
    SandboxUnhealthy,
}

/// One-shot cancellation request carrying its reason
///
/// The first reason sticks; later requests only re-notify.
#[derive(Debug, Default)]
pub struct CancelSignal {
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self, reason: CancelReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            current.get_or_insert(reason);
        }
        self.notify.notify_one();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves once a cancellation has been requested
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

/// Occupant of a session's execution slot
#[derive(Debug, Clone)]
pub(crate) struct ActiveExecution {
    pub execution_id: String,
    pub cancel: Arc<CancelSignal>,
}

/// Proof that the holder owns the session's only execution slot
///
/// `release` consumes the guard; dropping an unreleased guard frees the slot
/// as well, so every exit path gives the slot back exactly once.
pub struct SlotGuard {
    session_id: String,
    execution_id: String,
    sandbox: SandboxHandle,
    cancel: Arc<CancelSignal>,
    entry: Arc<SessionEntry>,
    storage: SessionStorage,
    released: bool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("session_id", &self.session_id)
            .field("execution_id", &self.execution_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl SlotGuard {
    pub(crate) fn new(
        session_id: String,
        execution_id: String,
        sandbox: SandboxHandle,
        cancel: Arc<CancelSignal>,
        entry: Arc<SessionEntry>,
        storage: SessionStorage,
    ) -> Self {
        Self {
            session_id,
            execution_id,
            sandbox,
            cancel,
            entry,
            storage,
            released: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Sandbox the session was running on when the slot was taken
    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    /// Fired by `SessionRegistry::cancel_execution`, `stop` and `mark_unhealthy`
    pub fn cancel_signal(&self) -> Arc<CancelSignal> {
        Arc::clone(&self.cancel)
    }

    /// Give the slot back. Returns whether this call freed it.
    pub async fn release(mut self) -> bool {
        let freed = self.free();
        if freed {
            if let Err(e) = self
                .storage
                .clear_current_execution(&self.session_id, &self.execution_id)
                .await
            {
                warn!(
                    session_id = %self.session_id,
                    "Failed to clear current execution: {}", e
                );
            }
        }
        freed
    }

    fn free(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let freed = self.entry.clear_active(&self.execution_id);
        if freed {
            debug!(
                session_id = %self.session_id,
                execution_id = %self.execution_id,
                "Execution slot released"
            );
        }
        freed
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if !self.free() {
            return;
        }
        warn!(
            session_id = %self.session_id,
            execution_id = %self.execution_id,
            "Execution slot released without an explicit release"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let storage = self.storage.clone();
            let session_id = self.session_id.clone();
            let execution_id = self.execution_id.clone();
            handle.spawn(async move {
                if let Err(e) = storage
                    .clear_current_execution(&session_id, &execution_id)
                    .await
                {
                    warn!(session_id = %session_id, "Failed to clear current execution: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_cancel_reason_sticks() {
        let signal = Arc::new(CancelSignal::new());
        assert_eq!(signal.reason(), None);

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire(CancelReason::SandboxUnhealthy);
        signal.fire(CancelReason::User);

        assert_eq!(waiter.await.unwrap(), CancelReason::SandboxUnhealthy);
        assert_eq!(signal.reason(), Some(CancelReason::SandboxUnhealthy));
        // Already fired: resolves without waiting
        assert_eq!(signal.cancelled().await, CancelReason::SandboxUnhealthy);
    }
}
