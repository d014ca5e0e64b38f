// ABOUTME: Execution record, parameters and terminal classification
// ABOUTME: An execution is Queued, then Running, then exactly one terminal status

use chrono::{DateTime, Utc};
use corral_storage::StorageError;
use corral_stream::CompletionSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
pub const MAX_TIMEOUT_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason attached to non-successful outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetail {
    NoToolsAvailable,
    MaxTurnsExceeded,
    RunnerFault,
    TimedOut,
    Cancelled,
}

impl ErrorDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoToolsAvailable => "NoToolsAvailable",
            Self::MaxTurnsExceeded => "MaxTurnsExceeded",
            Self::RunnerFault => "RunnerFault",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::NoToolsAvailable,
            Self::MaxTurnsExceeded,
            Self::RunnerFault,
            Self::TimedOut,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|detail| detail.as_str() == s)
    }
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Caller-supplied run limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Zero means unlimited
    #[serde(default)]
    pub max_turns: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default)]
    pub disallowed_tools: BTreeSet<String>,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            max_turns: 0,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            allowed_tools: BTreeSet::new(),
            disallowed_tools: BTreeSet::new(),
        }
    }
}

impl ExecutionParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(format!(
                "timeout_seconds must be between 1 and {}",
                MAX_TIMEOUT_SECONDS
            ));
        }
        if self
            .allowed_tools
            .iter()
            .chain(&self.disallowed_tools)
            .any(|tool| tool.trim().is_empty())
        {
            return Err("tool names must not be empty".to_string());
        }
        Ok(())
    }

    /// A tool named in both lists is dropped from the allow list
    pub fn normalized(mut self) -> Self {
        let disallowed = &self.disallowed_tools;
        self.allowed_tools.retain(|tool| !disallowed.contains(tool));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    pub max_turns: u32,
    pub timeout_seconds: u64,
    pub allowed_tools: BTreeSet<String>,
    pub disallowed_tools: BTreeSet<String>,
    pub effective_tools: BTreeSet<String>,
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub error_detail: Option<ErrorDetail>,
    pub duration_ms: Option<u64>,
    pub turns: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn queued(
        id: String,
        session_id: &str,
        prompt: &str,
        params: ExecutionParams,
        effective_tools: BTreeSet<String>,
    ) -> Self {
        Self {
            id,
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            max_turns: params.max_turns,
            timeout_seconds: params.timeout_seconds,
            allowed_tools: params.allowed_tools,
            disallowed_tools: params.disallowed_tools,
            effective_tools,
            status: ExecutionStatus::Queued,
            exit_code: None,
            response: None,
            error: None,
            error_detail: None,
            duration_ms: None,
            turns: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Succeeded with a zero exit code
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded && self.exit_code == Some(0)
    }

    pub fn summary(&self) -> CompletionSummary {
        CompletionSummary {
            success: self.is_success(),
            response: self.response.clone(),
            exit_code: self.exit_code,
            error: self.error.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_deny_list_wins_on_overlap() {
        let params = ExecutionParams {
            allowed_tools: set(&["Read", "Bash"]),
            disallowed_tools: set(&["Bash"]),
            ..Default::default()
        }
        .normalized();
        assert_eq!(params.allowed_tools, set(&["Read"]));
        assert_eq!(params.disallowed_tools, set(&["Bash"]));
    }

    #[test]
    fn test_params_validation() {
        assert!(ExecutionParams::default().validate().is_ok());
        let zero = ExecutionParams {
            timeout_seconds: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let blank = ExecutionParams {
            allowed_tools: set(&[" "]),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_params_defaults_from_json() {
        let params: ExecutionParams = serde_json::from_str(r#"{"max_turns": 2}"#).unwrap();
        assert_eq!(params.max_turns, 2);
        assert_eq!(params.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert!(params.allowed_tools.is_empty());
    }

    #[test]
    fn test_success_requires_zero_exit() {
        let mut execution = Execution::queued(
            "exe_1".to_string(),
            "ses_1",
            "hello",
            ExecutionParams::default(),
            BTreeSet::new(),
        );
        execution.status = ExecutionStatus::Succeeded;
        execution.exit_code = Some(2);
        assert!(!execution.summary().success);
        execution.exit_code = Some(0);
        assert!(execution.summary().success);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert_eq!(ExecutionStatus::from_str("timed_out").unwrap(), ExecutionStatus::TimedOut);
        assert_eq!(ErrorDetail::parse("MaxTurnsExceeded"), Some(ErrorDetail::MaxTurnsExceeded));
    }
}
