// ABOUTME: Periodic health checking and idle reclamation for running sessions
// ABOUTME: Unhealthy sandboxes move their session to Error; idle sessions are stopped

use crate::registry::SessionRegistry;
use crate::types::SessionState;
use chrono::{DateTime, Utc};
use corral_sandbox::HealthStatus;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{error, info, warn};

/// Checks kept per session
const MAX_CHECKS_PER_SESSION: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub session_id: String,
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub response_time_ms: u64,
}

/// Outcome of one monitoring pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub checked: usize,
    pub marked_unhealthy: usize,
    pub reclaimed: usize,
}

pub struct SessionMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    /// Zero disables idle reclamation
    idle_timeout: Duration,
    checks: Arc<RwLock<HashMap<String, VecDeque<HealthCheck>>>>,
    running: Arc<RwLock<bool>>,
}

impl SessionMonitor {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_timeout,
            checks: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the monitoring loop. Calling twice is a no-op.
    pub async fn start(self: Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let monitor = self;
        tokio::spawn(async move {
            info!(
                "Session monitor started (interval {:?}, idle timeout {:?})",
                monitor.interval, monitor.idle_timeout
            );
            let mut ticker = time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !*monitor.running.read().await {
                    info!("Session monitor stopped");
                    break;
                }
                let report = monitor.run_once().await;
                if report.marked_unhealthy > 0 || report.reclaimed > 0 {
                    info!(
                        "Monitor pass: {} checked, {} unhealthy, {} reclaimed",
                        report.checked, report.marked_unhealthy, report.reclaimed
                    );
                }
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// One pass over every Running session
    pub async fn run_once(&self) -> MonitorReport {
        let mut report = MonitorReport::default();

        let sessions = match self.registry.list_in_states(&[SessionState::Running]).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("Failed to list running sessions: {}", e);
                return report;
            }
        };

        for session in sessions {
            if !self.idle_timeout.is_zero() {
                match self.registry.stop_if_idle(&session.id, self.idle_timeout).await {
                    Ok(true) => {
                        report.reclaimed += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(session_id = %session.id, "Idle reclamation failed: {}", e),
                }
            }

            let Some(handle) = session.sandbox.clone() else {
                continue;
            };
            let provider = self.registry.provider();
            let started = std::time::Instant::now();
            let status = provider.health_check(&handle).await;
            report.checked += 1;

            self.store_check(HealthCheck {
                session_id: session.id.clone(),
                sandbox_id: handle.id.clone(),
                timestamp: Utc::now(),
                status,
                response_time_ms: started.elapsed().as_millis() as u64,
            })
            .await;

            if status == HealthStatus::Unhealthy {
                match self
                    .registry
                    .mark_unhealthy(&session.id, "sandbox failed health check")
                    .await
                {
                    Ok(true) => report.marked_unhealthy += 1,
                    Ok(false) => {}
                    Err(e) => warn!(session_id = %session.id, "Failed to mark session unhealthy: {}", e),
                }
            }
        }

        report
    }

    async fn store_check(&self, check: HealthCheck) {
        let mut checks = self.checks.write().await;
        let session_checks = checks.entry(check.session_id.clone()).or_default();
        session_checks.push_back(check);
        while session_checks.len() > MAX_CHECKS_PER_SESSION {
            session_checks.pop_front();
        }
    }

    /// Most recent checks for a session, oldest first
    pub async fn recent_checks(&self, session_id: &str, limit: Option<usize>) -> Vec<HealthCheck> {
        let checks = self.checks.read().await;
        match checks.get(session_id) {
            Some(session_checks) => {
                let skip = limit
                    .map(|limit| session_checks.len().saturating_sub(limit))
                    .unwrap_or(0);
                session_checks.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn clear_checks(&self, session_id: &str) {
        self.checks.write().await.remove(session_id);
    }
}
