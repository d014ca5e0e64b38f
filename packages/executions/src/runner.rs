// ABOUTME: Runs executions inside session sandboxes under deadlines, turn limits and cancellation
// ABOUTME: Every run ends in one finish path that persists, releases the slot and reports the outcome

use crate::agent::{self, AgentLine, LineBuffer, MAX_TURNS_SUBTYPE};
use crate::error::{ExecutionError, Result};
use crate::storage::ExecutionStorage;
use crate::tools::{effective_tools, tools_required};
use crate::types::{ErrorDetail, Execution, ExecutionParams, ExecutionStatus};
use chrono::Utc;
use corral_sandbox::{ExecOutput, ExecRequest, OutputChunk, ProviderError, StreamType};
use corral_sessions::{CancelReason, SessionRegistry, SlotGuard};
use corral_storage::generate_id;
use corral_stream::{EventPayload, StreamGateway};
use corral_webhooks::{WebhookDispatcher, WebhookEvent, WebhookEventKind};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Extra time the provider allows past the runner's own deadline
const PROVIDER_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// How long an interrupted command gets to exit after being signalled
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub agent_program: String,
    pub tool_catalog: BTreeSet<String>,
    /// Treat an empty effective tool set as fatal even without an allow list
    pub require_tools: bool,
    pub working_dir: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            agent_program: "claude".to_string(),
            tool_catalog: BTreeSet::new(),
            require_tools: false,
            working_dir: None,
        }
    }
}

/// A submitted execution and a way to wait for its terminal record
pub struct ExecutionHandle {
    execution: Execution,
    completion: oneshot::Receiver<Execution>,
    storage: ExecutionStorage,
}

impl ExecutionHandle {
    /// The execution as it was when it started running
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub async fn wait(self) -> Result<Execution> {
        match self.completion.await {
            Ok(execution) => Ok(execution),
            // The run task is gone; the stored record is the best answer
            Err(_) => Ok(self
                .storage
                .get(&self.execution.session_id, &self.execution.id)
                .await?),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Interrupt {
    Cancelled(CancelReason),
    TimedOut,
    MaxTurns,
}

enum Step {
    Exited(std::result::Result<ExecOutput, ProviderError>),
    Interrupted(Interrupt),
}

#[derive(Debug)]
struct Outcome {
    status: ExecutionStatus,
    exit_code: Option<i64>,
    response: Option<String>,
    error: Option<String>,
    detail: Option<ErrorDetail>,
    turns: u32,
}

impl Outcome {
    fn failed(detail: ErrorDetail, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            exit_code: None,
            response: None,
            error: Some(error.into()),
            detail: Some(detail),
            turns: 0,
        }
    }
}

/// What the agent has said so far
#[derive(Debug, Default)]
struct Transcript {
    lines: LineBuffer,
    max_turns: u32,
    turns: u32,
    result_text: Option<String>,
    result_subtype: Option<String>,
}

impl Transcript {
    fn new(max_turns: u32) -> Self {
        Self {
            max_turns,
            ..Default::default()
        }
    }

    /// Record one line; returns the turn number for assistant lines
    fn observe(&mut self, line: &str) -> Option<u32> {
        match agent::parse_line(line) {
            AgentLine::Assistant => {
                self.turns += 1;
                Some(self.turns)
            }
            AgentLine::Result { subtype, text, .. } => {
                self.result_subtype = subtype;
                self.result_text = text;
                None
            }
            AgentLine::Event | AgentLine::Plain => None,
        }
    }

    fn turns_exceeded(&self) -> bool {
        self.max_turns > 0 && self.turns > self.max_turns
    }

    fn hit_turn_limit(&self) -> bool {
        self.turns_exceeded() || self.result_subtype.as_deref() == Some(MAX_TURNS_SUBTYPE)
    }
}

struct RunnerInner {
    registry: Arc<SessionRegistry>,
    storage: ExecutionStorage,
    gateway: Arc<StreamGateway>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    settings: RunnerSettings,
}

#[derive(Clone)]
pub struct ExecutionRunner {
    inner: Arc<RunnerInner>,
}

impl ExecutionRunner {
    /// `webhooks` receives every terminal outcome when set
    pub fn new(
        registry: Arc<SessionRegistry>,
        storage: ExecutionStorage,
        gateway: Arc<StreamGateway>,
        webhooks: Option<Arc<WebhookDispatcher>>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                registry,
                storage,
                gateway,
                webhooks,
                settings,
            }),
        }
    }

    /// Start an execution on a Running session with a free slot
    ///
    /// Returns once the execution is Running; the outcome arrives through
    /// the handle, the session stream and the execution record.
    pub async fn submit(
        &self,
        session_id: &str,
        prompt: &str,
        params: ExecutionParams,
    ) -> Result<ExecutionHandle> {
        if prompt.trim().is_empty() {
            return Err(ExecutionError::InvalidParams(
                "prompt must not be empty".to_string(),
            ));
        }
        params.validate().map_err(ExecutionError::InvalidParams)?;
        let params = params.normalized();

        let inner = &self.inner;
        let execution_id = generate_id("exe");
        let guard = inner
            .registry
            .acquire_slot(session_id, &execution_id)
            .await?;

        let required = tools_required(&params.allowed_tools, inner.settings.require_tools);
        let effective = effective_tools(
            &inner.settings.tool_catalog,
            &params.allowed_tools,
            &params.disallowed_tools,
        );
        let mut execution = Execution::queued(execution_id, session_id, prompt, params, effective);

        if let Err(e) = inner.storage.insert(&execution).await {
            guard.release().await;
            return Err(e.into());
        }
        let started_at = Utc::now();
        if let Err(e) = inner.storage.mark_running(&execution.id, started_at).await {
            guard.release().await;
            return Err(e.into());
        }
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(started_at);

        if let Err(e) = inner.registry.touch(session_id).await {
            debug!(session_id = %session_id, "Failed to record session activity: {}", e);
        }
        info!(
            session_id = %session_id,
            execution_id = %execution.id,
            max_turns = execution.max_turns,
            timeout_seconds = execution.timeout_seconds,
            "Execution started"
        );
        inner.gateway.publish(
            session_id,
            EventPayload::ExecutionStarted {
                execution_id: execution.id.clone(),
                prompt: execution.prompt.clone(),
            },
        );

        let (done, completion) = oneshot::channel();
        let running = execution.clone();
        let task_inner = Arc::clone(inner);
        tokio::spawn(async move {
            let finished = task_inner.run(guard, execution, required).await;
            let _ = done.send(finished);
        });

        Ok(ExecutionHandle {
            execution: running,
            completion,
            storage: inner.storage.clone(),
        })
    }

    /// Ask a running execution to stop. Returns false when it already finished.
    pub async fn cancel(&self, session_id: &str, execution_id: &str) -> Result<bool> {
        let execution = self.inner.storage.get(session_id, execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        let signalled = self
            .inner
            .registry
            .cancel_execution(session_id, execution_id)
            .await?;
        if signalled {
            info!(session_id = %session_id, execution_id = %execution_id, "Execution cancellation requested");
        }
        Ok(signalled)
    }

    pub async fn get(&self, session_id: &str, execution_id: &str) -> Result<Execution> {
        Ok(self.inner.storage.get(session_id, execution_id).await?)
    }

    pub async fn list(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Execution>, i64)> {
        // Unknown sessions are NotFound rather than an empty page
        self.inner.registry.get(session_id).await?;
        Ok(self.inner.storage.list(session_id, limit, offset).await?)
    }

    /// Fail executions that were in flight when the previous process exited
    pub async fn recover(&self) -> Result<u64> {
        let failed = self
            .inner
            .storage
            .fail_unfinished("engine restarted during execution")
            .await?;
        if failed > 0 {
            warn!("Marked {} interrupted executions as failed", failed);
        }
        Ok(failed)
    }
}

impl RunnerInner {
    async fn run(&self, guard: SlotGuard, execution: Execution, required: bool) -> Execution {
        let started = Instant::now();
        let outcome = if required && execution.effective_tools.is_empty() {
            Outcome::failed(
                ErrorDetail::NoToolsAvailable,
                "no tools remain after filtering",
            )
        } else {
            self.drive(&guard, &execution).await
        };
        self.finish(guard, execution, outcome, started.elapsed()).await
    }

    /// Run the agent until it exits or is interrupted
    async fn drive(&self, guard: &SlotGuard, execution: &Execution) -> Outcome {
        let provider = self.registry.provider();
        let handle = guard.sandbox().clone();
        let cancel = guard.cancel_signal();
        let timeout = Duration::from_secs(execution.timeout_seconds);

        let command = agent::build_command(
            &self.settings.agent_program,
            &execution.prompt,
            execution.max_turns,
            &execution.effective_tools,
            &execution.disallowed_tools,
        );
        let mut request = ExecRequest::new(
            execution.id.clone(),
            command,
            timeout + PROVIDER_TIMEOUT_GRACE,
        );
        request.working_dir = self.settings.working_dir.clone();

        let (sink, mut chunks) = mpsc::unbounded_channel::<OutputChunk>();
        let exec = provider.exec(&handle, request, Some(sink));
        tokio::pin!(exec);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut transcript = Transcript::new(execution.max_turns);
        let step = loop {
            tokio::select! {
                biased;
                reason = cancel.cancelled() => break Step::Interrupted(Interrupt::Cancelled(reason)),
                _ = &mut deadline => break Step::Interrupted(Interrupt::TimedOut),
                Some(chunk) = chunks.recv() => {
                    self.observe_chunk(execution, &mut transcript, chunk);
                    if transcript.turns_exceeded() {
                        break Step::Interrupted(Interrupt::MaxTurns);
                    }
                }
                result = &mut exec => break Step::Exited(result),
            }
        };

        match step {
            Step::Exited(result) => {
                while let Ok(chunk) = chunks.try_recv() {
                    self.observe_chunk(execution, &mut transcript, chunk);
                }
                if let Some(line) = transcript.lines.finish() {
                    self.observe_line(execution, &mut transcript, &line);
                }
                classify_exit(result, &transcript)
            }
            Step::Interrupted(interrupt) => {
                if let Err(e) = provider.cancel(&handle, &execution.id).await {
                    warn!(
                        execution_id = %execution.id,
                        "Failed to signal interrupted command: {}", e
                    );
                }
                if tokio::time::timeout(INTERRUPT_GRACE, &mut exec).await.is_err() {
                    warn!(
                        execution_id = %execution.id,
                        "Interrupted command did not exit within {:?}", INTERRUPT_GRACE
                    );
                }
                classify_interrupt(interrupt, &transcript, timeout)
            }
        }
    }

    fn observe_chunk(&self, execution: &Execution, transcript: &mut Transcript, chunk: OutputChunk) {
        if chunk.stream != StreamType::Stdout {
            return;
        }
        for line in transcript.lines.push(&chunk.data) {
            self.observe_line(execution, transcript, &line);
        }
    }

    fn observe_line(&self, execution: &Execution, transcript: &mut Transcript, line: &str) {
        let turn = transcript.observe(line);
        self.gateway.publish(
            &execution.session_id,
            EventPayload::Progress {
                execution_id: execution.id.clone(),
                text: line.to_string(),
                turn,
            },
        );
    }

    /// The single exit: persist, free the slot, then report
    async fn finish(
        &self,
        guard: SlotGuard,
        mut execution: Execution,
        outcome: Outcome,
        elapsed: Duration,
    ) -> Execution {
        execution.status = outcome.status;
        execution.exit_code = outcome.exit_code;
        execution.response = outcome.response;
        execution.error = outcome.error;
        execution.error_detail = outcome.detail;
        execution.turns = outcome.turns;
        execution.duration_ms = Some(elapsed.as_millis() as u64);
        execution.ended_at = Some(Utc::now());

        if let Err(e) = self.storage.complete(&execution).await {
            error!(execution_id = %execution.id, "Failed to persist execution outcome: {}", e);
        }
        // Activity is recorded while the slot is still held so the session never looks idle in between
        if let Err(e) = self.registry.touch(&execution.session_id).await {
            debug!(session_id = %execution.session_id, "Failed to record session activity: {}", e);
        }
        guard.release().await;

        info!(
            session_id = %execution.session_id,
            execution_id = %execution.id,
            status = %execution.status,
            duration_ms = execution.duration_ms.unwrap_or_default(),
            turns = execution.turns,
            "Execution finished"
        );

        self.gateway.publish(
            &execution.session_id,
            EventPayload::ExecutionCompleted {
                execution_id: execution.id.clone(),
                status: execution.status.as_str().to_string(),
                error_detail: execution.error_detail.map(|d| d.as_str().to_string()),
                summary: execution.summary(),
            },
        );

        if let Some(webhooks) = &self.webhooks {
            let kind = if execution.status == ExecutionStatus::Succeeded {
                WebhookEventKind::ExecutionCompleted
            } else {
                WebhookEventKind::ExecutionFailed
            };
            webhooks.dispatch(WebhookEvent::new(
                kind,
                execution.session_id.clone(),
                execution.id.clone(),
                json!({
                    "status": execution.status,
                    "error_detail": execution.error_detail,
                    "turns": execution.turns,
                    "summary": execution.summary(),
                }),
            ));
        }

        execution
    }
}

fn classify_exit(
    result: std::result::Result<ExecOutput, ProviderError>,
    transcript: &Transcript,
) -> Outcome {
    let turns = transcript.turns;
    match result {
        Ok(output) if transcript.hit_turn_limit() => Outcome {
            status: ExecutionStatus::Failed,
            exit_code: Some(output.exit_code),
            response: transcript.result_text.clone(),
            error: Some("agent exceeded its turn limit".to_string()),
            detail: Some(ErrorDetail::MaxTurnsExceeded),
            turns,
        },
        Ok(output) => {
            let response = transcript
                .result_text
                .clone()
                .unwrap_or_else(|| output.stdout_lossy().trim_end().to_string());
            let error = if output.exit_code == 0 {
                None
            } else {
                let stderr = output.stderr_lossy().trim().to_string();
                Some(if stderr.is_empty() {
                    format!("agent exited with code {}", output.exit_code)
                } else {
                    stderr
                })
            };
            Outcome {
                status: ExecutionStatus::Succeeded,
                exit_code: Some(output.exit_code),
                response: Some(response),
                error,
                detail: None,
                turns,
            }
        }
        Err(ProviderError::Timeout(limit)) => Outcome {
            status: ExecutionStatus::TimedOut,
            exit_code: None,
            response: transcript.result_text.clone(),
            error: Some(format!("execution exceeded {:?}", limit)),
            detail: Some(ErrorDetail::TimedOut),
            turns,
        },
        Err(e) => Outcome {
            turns,
            ..Outcome::failed(ErrorDetail::RunnerFault, e.to_string())
        },
    }
}

fn classify_interrupt(interrupt: Interrupt, transcript: &Transcript, timeout: Duration) -> Outcome {
    let (status, detail, error) = match interrupt {
        // Infrastructure failure, not a cancellation
        Interrupt::Cancelled(CancelReason::SandboxUnhealthy) => (
            ExecutionStatus::Failed,
            ErrorDetail::RunnerFault,
            "sandbox failed its health check during execution".to_string(),
        ),
        Interrupt::Cancelled(CancelReason::User | CancelReason::SessionStopped) => (
            ExecutionStatus::Cancelled,
            ErrorDetail::Cancelled,
            "execution was cancelled".to_string(),
        ),
        Interrupt::TimedOut => (
            ExecutionStatus::TimedOut,
            ErrorDetail::TimedOut,
            format!("execution exceeded {}s", timeout.as_secs()),
        ),
        Interrupt::MaxTurns => (
            ExecutionStatus::Failed,
            ErrorDetail::MaxTurnsExceeded,
            format!("agent exceeded {} turns", transcript.max_turns),
        ),
    };
    Outcome {
        status,
        exit_code: None,
        response: transcript.result_text.clone(),
        error: Some(error),
        detail: Some(detail),
        turns: transcript.turns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn output(exit_code: i64, stdout: &str, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_transcript_counts_turns() {
        let mut transcript = Transcript::new(2);
        assert_eq!(transcript.observe(r#"{"type":"system"}"#), None);
        assert_eq!(transcript.observe(r#"{"type":"assistant"}"#), Some(1));
        assert_eq!(transcript.observe(r#"{"type":"assistant"}"#), Some(2));
        assert!(!transcript.turns_exceeded());
        transcript.observe(r#"{"type":"assistant"}"#);
        assert!(transcript.turns_exceeded());
    }

    #[test]
    fn test_unlimited_turns() {
        let mut transcript = Transcript::new(0);
        for _ in 0..100 {
            transcript.observe(r#"{"type":"assistant"}"#);
        }
        assert!(!transcript.turns_exceeded());
    }

    #[test]
    fn test_result_line_is_the_response() {
        let mut transcript = Transcript::new(0);
        transcript.observe(r#"{"type":"result","subtype":"success","result":"All done"}"#);
        let outcome = classify_exit(Ok(output(0, "noise\n", "")), &transcript);
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.response.as_deref(), Some("All done"));
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn test_stdout_is_the_response_without_result_line() {
        let transcript = Transcript::new(0);
        let outcome = classify_exit(Ok(output(2, "partial output\n", "boom")), &transcript);
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.response.as_deref(), Some("partial output"));
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_agent_reported_turn_limit_is_failure() {
        let mut transcript = Transcript::new(5);
        transcript.observe(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#);
        let outcome = classify_exit(Ok(output(0, "", "")), &transcript);
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.detail, Some(ErrorDetail::MaxTurnsExceeded));
    }

    #[test]
    fn test_provider_errors() {
        let transcript = Transcript::new(0);
        let timed_out = classify_exit(
            Err(ProviderError::Timeout(Duration::from_secs(3))),
            &transcript,
        );
        assert_eq!(timed_out.status, ExecutionStatus::TimedOut);

        let fault = classify_exit(
            Err(ProviderError::ContainerError("exec failed".to_string())),
            &transcript,
        );
        assert_eq!(fault.status, ExecutionStatus::Failed);
        assert_eq!(fault.detail, Some(ErrorDetail::RunnerFault));
    }
}
