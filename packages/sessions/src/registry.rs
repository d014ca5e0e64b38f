// ABOUTME: Session registry owning lifecycle transitions and execution slots
// ABOUTME: Serializes transitions per session and drives the sandbox provider

use crate::error::{Result, SessionError};
use crate::slot::{ActiveExecution, CancelReason, CancelSignal, SlotGuard};
use crate::storage::SessionStorage;
use crate::types::{Session, SessionState};
use chrono::Utc;
use corral_sandbox::{HealthStatus, SandboxHandle, SandboxProvider};
use corral_storage::generate_id;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// How long `stop` waits for a cancelled execution to give its slot back
const CANCEL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) struct EntryState {
    state: SessionState,
    sandbox: Option<SandboxHandle>,
    active: Option<ActiveExecution>,
}

/// In-memory companion of a session record
///
/// `transition` serializes lifecycle changes; `state` is a short-lived lock
/// that makes the Running check and the slot check-and-set one step.
#[derive(Debug)]
pub(crate) struct SessionEntry {
    transition: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<EntryState>,
    slot_freed: Notify,
}

impl SessionEntry {
    fn new(session: &Session) -> Self {
        Self {
            transition: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(EntryState {
                state: session.state,
                sandbox: session.sandbox.clone(),
                active: None,
            }),
            slot_freed: Notify::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Free the slot if `execution_id` holds it
    pub(crate) fn clear_active(&self, execution_id: &str) -> bool {
        let freed = {
            let mut state = self.lock_state();
            match &state.active {
                Some(active) if active.execution_id == execution_id => {
                    state.active = None;
                    true
                }
                _ => false,
            }
        };
        if freed {
            self.slot_freed.notify_waiters();
        }
        freed
    }

    fn active_execution(&self) -> Option<ActiveExecution> {
        self.lock_state().active.clone()
    }
}

pub struct SessionRegistry {
    storage: SessionStorage,
    provider: Arc<dyn SandboxProvider>,
    entries: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(storage: SessionStorage, provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            storage,
            provider,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> Arc<dyn SandboxProvider> {
        Arc::clone(&self.provider)
    }

    async fn entry(&self, id: &str) -> Result<Arc<SessionEntry>> {
        if let Some(entry) = self.read_entries().get(id) {
            return Ok(Arc::clone(entry));
        }

        let session = self.storage.get(id).await?;
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Arc::clone(
            entries
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(SessionEntry::new(&session))),
        ))
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_transition(&self, id: &str, entry: &SessionEntry) -> Result<OwnedMutexGuard<()>> {
        Arc::clone(&entry.transition)
            .try_lock_owned()
            .map_err(|_| SessionError::ConflictingTransition(id.to_string()))
    }

    /// Apply a lifecycle edge to both the in-memory entry and the record
    async fn transition(
        &self,
        entry: &SessionEntry,
        session: &mut Session,
        to: SessionState,
    ) -> Result<()> {
        let from = session.state;
        if !from.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                id: session.id.clone(),
                from,
                operation: to.as_str(),
            });
        }

        // The record is written first; a failed write leaves both sides at `from`
        let mut next = session.clone();
        next.state = to;
        next.last_active_at = Utc::now();
        self.storage.update(&next).await?;
        {
            let mut state = entry.lock_state();
            state.state = to;
            state.sandbox = next.sandbox.clone();
        }
        *session = next;

        info!(session_id = %session.id, %from, %to, "Session transition");
        Ok(())
    }

    fn overlay(&self, mut session: Session) -> Session {
        if let Some(entry) = self.read_entries().get(&session.id) {
            session.current_execution_id = entry.active_execution().map(|a| a.execution_id);
        }
        session
    }

    pub async fn create(&self) -> Result<Session> {
        let session = Session::new(generate_id("ses"));
        self.storage.insert(&session).await?;
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.id.clone(), Arc::new(SessionEntry::new(&session)));

        info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        let session = self.storage.get(id).await?;
        Ok(self.overlay(session))
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Session>, i64)> {
        let (sessions, total) = self.storage.list(limit, offset).await?;
        Ok((
            sessions.into_iter().map(|s| self.overlay(s)).collect(),
            total,
        ))
    }

    pub async fn list_in_states(&self, states: &[SessionState]) -> Result<Vec<Session>> {
        let sessions = self.storage.list_in_states(states).await?;
        Ok(sessions.into_iter().map(|s| self.overlay(s)).collect())
    }

    /// Provision a sandbox and bring the session to Running
    pub async fn start(&self, id: &str) -> Result<Session> {
        let entry = self.entry(id).await?;
        let _transition = self.begin_transition(id, &entry)?;
        let mut session = self.storage.get(id).await?;

        match session.state {
            SessionState::Created | SessionState::Stopped => {}
            from => {
                return Err(SessionError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    operation: "start",
                })
            }
        }

        // A sandbox retained by a failed stop is replaced, not reused
        if let Some(stale) = session.sandbox.take() {
            self.terminate_best_effort(&session.id, &stale).await;
        }

        self.transition(&entry, &mut session, SessionState::Starting)
            .await?;
        self.bring_up(&entry, &mut session).await?;
        Ok(session)
    }

    /// Starting → Running with a fresh sandbox, or Starting → Error
    async fn bring_up(&self, entry: &SessionEntry, session: &mut Session) -> Result<()> {
        let handle = match self.provider.provision(&session.id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id = %session.id, "Provisioning failed: {}", e);
                return self.fail_start(entry, session, e.to_string()).await;
            }
        };
        debug!(session_id = %session.id, sandbox_id = %handle.id, "Sandbox provisioned");

        match self.provider.health_check(&handle).await {
            HealthStatus::Healthy => {}
            HealthStatus::Unknown => {
                warn!(
                    session_id = %session.id,
                    sandbox_id = %handle.id,
                    "Sandbox health unknown after provisioning, continuing"
                );
            }
            HealthStatus::Unhealthy => {
                self.terminate_best_effort(&session.id, &handle).await;
                return self
                    .fail_start(
                        entry,
                        session,
                        "sandbox failed its first health check".to_string(),
                    )
                    .await;
            }
        }

        session.sandbox = Some(handle);
        session.error_message = None;
        self.transition(entry, session, SessionState::Running).await
    }

    async fn fail_start(
        &self,
        entry: &SessionEntry,
        session: &mut Session,
        reason: String,
    ) -> Result<()> {
        session.sandbox = None;
        session.error_message = Some(reason.clone());
        self.transition(entry, session, SessionState::Error).await?;
        Err(SessionError::SandboxUnavailable(reason))
    }

    async fn terminate_best_effort(&self, session_id: &str, handle: &SandboxHandle) -> bool {
        if handle.provider != self.provider.name() {
            warn!(
                session_id = %session_id,
                sandbox_id = %handle.id,
                "Sandbox belongs to provider {}, dropping reference",
                handle.provider
            );
            return true;
        }
        match self.provider.terminate(handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    sandbox_id = %handle.id,
                    "Failed to terminate sandbox: {}", e
                );
                false
            }
        }
    }

    /// Release the sandbox and move to Stopped
    ///
    /// Termination failures are recorded on the session, never returned.
    pub async fn stop(&self, id: &str) -> Result<Session> {
        let entry = self.entry(id).await?;
        let _transition = self.begin_transition(id, &entry)?;
        let mut session = self.storage.get(id).await?;

        match session.state {
            SessionState::Running | SessionState::Error => {}
            from => {
                return Err(SessionError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    operation: "stop",
                })
            }
        }

        self.stop_locked(&entry, &mut session).await?;
        Ok(session)
    }

    async fn stop_locked(&self, entry: &SessionEntry, session: &mut Session) -> Result<()> {
        self.transition(entry, session, SessionState::Stopping)
            .await?;
        self.wind_down(entry, session).await
    }

    /// Stopping → Stopped: cancel the active execution and release the sandbox
    async fn wind_down(&self, entry: &SessionEntry, session: &mut Session) -> Result<()> {
        self.drain_active(entry, &session.id).await;

        if let Some(handle) = session.sandbox.clone() {
            if self.terminate_best_effort(&session.id, &handle).await {
                session.sandbox = None;
            } else {
                session.error_message =
                    Some(format!("sandbox {} could not be terminated", handle.id));
            }
        }

        self.transition(entry, session, SessionState::Stopped).await
    }

    /// Cancel the running execution, if any, and wait for its slot
    async fn drain_active(&self, entry: &SessionEntry, session_id: &str) {
        let Some(active) = entry.active_execution() else {
            return;
        };
        info!(
            session_id = %session_id,
            execution_id = %active.execution_id,
            "Cancelling active execution"
        );
        active.cancel.fire(CancelReason::SessionStopped);

        let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
        loop {
            let freed = entry.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if entry.active_execution().is_none() {
                return;
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                warn!(
                    session_id = %session_id,
                    execution_id = %active.execution_id,
                    "Execution did not release its slot within {:?}",
                    CANCEL_GRACE
                );
                return;
            }
        }
    }

    /// Re-attach to a retained sandbox, falling back to a fresh one
    pub async fn reconnect(&self, id: &str) -> Result<Session> {
        let entry = self.entry(id).await?;
        let _transition = self.begin_transition(id, &entry)?;
        let mut session = self.storage.get(id).await?;

        let allowed = match session.state {
            SessionState::Error => true,
            SessionState::Stopped => session.sandbox.is_some(),
            _ => false,
        };
        if !allowed {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                from: session.state,
                operation: "reconnect",
            });
        }

        self.transition(&entry, &mut session, SessionState::Starting)
            .await?;

        if let Some(handle) = session.sandbox.clone() {
            let status = if handle.provider == self.provider.name() {
                self.provider.health_check(&handle).await
            } else {
                HealthStatus::Unhealthy
            };
            match status {
                HealthStatus::Healthy | HealthStatus::Unknown => {
                    info!(session_id = %id, sandbox_id = %handle.id, "Re-attached to sandbox");
                    session.error_message = None;
                    self.transition(&entry, &mut session, SessionState::Running)
                        .await?;
                    return Ok(session);
                }
                HealthStatus::Unhealthy => {
                    self.terminate_best_effort(id, &handle).await;
                    session.sandbox = None;
                }
            }
        }

        self.bring_up(&entry, &mut session).await?;
        Ok(session)
    }

    /// Stop if needed, release any retained sandbox and forget the session
    pub async fn delete(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        let _transition = self.begin_transition(id, &entry)?;
        let mut session = self.storage.get(id).await?;

        if session.state == SessionState::Running {
            self.stop_locked(&entry, &mut session).await?;
        } else {
            self.drain_active(&entry, id).await;
        }
        if let Some(handle) = session.sandbox.take() {
            self.terminate_best_effort(id, &handle).await;
        }

        self.storage.delete(id).await?;
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);

        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        self.storage.touch(id, Utc::now()).await?;
        Ok(())
    }

    /// Move a Running session to Error; skipped while a transition is in flight
    pub async fn mark_unhealthy(&self, id: &str, reason: &str) -> Result<bool> {
        let entry = self.entry(id).await?;
        let Ok(_transition) = self.begin_transition(id, &entry) else {
            return Ok(false);
        };
        let mut session = self.storage.get(id).await?;
        if session.state != SessionState::Running {
            return Ok(false);
        }

        if let Some(active) = entry.active_execution() {
            active.cancel.fire(CancelReason::SandboxUnhealthy);
        }
        session.error_message = Some(reason.to_string());
        self.transition(&entry, &mut session, SessionState::Error)
            .await?;
        warn!(session_id = %id, "Session marked unhealthy: {}", reason);
        Ok(true)
    }

    /// Stop a Running session that has no execution and no recent activity
    ///
    /// The idle check and the move out of Running happen under the slot lock,
    /// so an execution is either accepted before the check (and the session
    /// is kept) or rejected with `NotRunning`. Returns whether the session
    /// was stopped.
    pub async fn stop_if_idle(&self, id: &str, idle_timeout: Duration) -> Result<bool> {
        let Ok(idle_timeout) = chrono::Duration::from_std(idle_timeout) else {
            return Ok(false);
        };
        let entry = self.entry(id).await?;
        let Ok(_transition) = self.begin_transition(id, &entry) else {
            return Ok(false);
        };
        let mut session = self.storage.get(id).await?;
        if session.state != SessionState::Running {
            return Ok(false);
        }

        {
            let mut state = entry.lock_state();
            let idle = state.state == SessionState::Running
                && state.active.is_none()
                && Utc::now().signed_duration_since(session.last_active_at) > idle_timeout;
            if !idle {
                return Ok(false);
            }
            state.state = SessionState::Stopping;
        }

        if let Err(e) = self
            .transition(&entry, &mut session, SessionState::Stopping)
            .await
        {
            entry.lock_state().state = SessionState::Running;
            return Err(e);
        }
        info!(session_id = %id, "Reclaiming idle session");
        self.wind_down(&entry, &mut session).await?;
        Ok(true)
    }

    /// Sessions interrupted by a restart are moved to Error, keeping handles
    pub async fn recover(&self) -> Result<usize> {
        let interrupted = self
            .storage
            .list_in_states(&[
                SessionState::Starting,
                SessionState::Running,
                SessionState::Stopping,
            ])
            .await?;

        for mut session in interrupted.iter().cloned() {
            let previous = session.state;
            session.state = SessionState::Error;
            session.error_message = Some(format!("engine restarted while {}", previous));
            session.last_active_at = Utc::now();
            self.storage.update(&session).await?;
            self.storage.set_current_execution(&session.id, None).await?;
            self.entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(session.id.clone(), Arc::new(SessionEntry::new(&session)));
        }

        if !interrupted.is_empty() {
            info!("Recovered {} interrupted sessions", interrupted.len());
        }
        Ok(interrupted.len())
    }

    /// Take the session's execution slot
    ///
    /// Fails with `NotRunning` unless the session is Running and with
    /// `SessionBusy` when another execution holds the slot. The first caller
    /// wins; the check and the claim happen under one lock.
    pub async fn acquire_slot(&self, session_id: &str, execution_id: &str) -> Result<SlotGuard> {
        let entry = self.entry(session_id).await?;
        let cancel = Arc::new(CancelSignal::new());

        let sandbox = {
            let mut state = entry.lock_state();
            if state.state != SessionState::Running {
                return Err(SessionError::NotRunning {
                    id: session_id.to_string(),
                    state: state.state,
                });
            }
            if let Some(active) = &state.active {
                return Err(SessionError::SessionBusy {
                    session_id: session_id.to_string(),
                    execution_id: active.execution_id.clone(),
                });
            }
            let sandbox = state.sandbox.clone().ok_or_else(|| SessionError::NotRunning {
                id: session_id.to_string(),
                state: state.state,
            })?;
            state.active = Some(ActiveExecution {
                execution_id: execution_id.to_string(),
                cancel: Arc::clone(&cancel),
            });
            sandbox
        };

        let guard = SlotGuard::new(
            session_id.to_string(),
            execution_id.to_string(),
            sandbox,
            cancel,
            Arc::clone(&entry),
            self.storage.clone(),
        );

        if let Err(e) = self
            .storage
            .set_current_execution(session_id, Some(execution_id))
            .await
        {
            guard.release().await;
            return Err(e.into());
        }

        debug!(session_id = %session_id, execution_id = %execution_id, "Execution slot acquired");
        Ok(guard)
    }

    /// Signal the holder of the slot. Returns false when `execution_id` is not running.
    pub async fn cancel_execution(&self, session_id: &str, execution_id: &str) -> Result<bool> {
        let entry = self.entry(session_id).await?;
        match entry.active_execution() {
            Some(active) if active.execution_id == execution_id => {
                active.cancel.fire(CancelReason::User);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn active_execution(&self, session_id: &str) -> Result<Option<String>> {
        let entry = self.entry(session_id).await?;
        Ok(entry.active_execution().map(|a| a.execution_id))
    }

    /// Handle of a Running session's sandbox, for file access
    pub async fn running_sandbox(&self, session_id: &str) -> Result<SandboxHandle> {
        let entry = self.entry(session_id).await?;
        let state = entry.lock_state();
        match (&state.state, &state.sandbox) {
            (SessionState::Running, Some(handle)) => Ok(handle.clone()),
            (current, _) => Err(SessionError::NotRunning {
                id: session_id.to_string(),
                state: *current,
            }),
        }
    }
}
