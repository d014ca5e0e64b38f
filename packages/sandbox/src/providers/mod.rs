// ABOUTME: Provider capability trait and shared types for sandbox backends
// ABOUTME: Defines provisioning, teardown, health, command execution and file access

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use docker::{DockerProvider, DockerSettings};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptedExec, ScriptedProvider};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Opaque reference to a provisioned sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub provider: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// The provider could not determine the state (e.g. daemon unreachable)
    Unknown,
}

/// A command to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Caller-chosen tag used to address this command in [`SandboxProvider::cancel`]
    pub tag: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// Hard upper bound enforced by the provider itself
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(tag: impl Into<String>, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            tag: tag.into(),
            command,
            env: HashMap::new(),
            working_dir: None,
            timeout,
        }
    }
}

/// Execution result from running a command in a sandbox
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stream: StreamType::Stdout,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Receives output as the command produces it
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
}

/// Capability every sandbox backend implements
///
/// The engine never talks to a container runtime directly; sessions hold a
/// [`SandboxHandle`] and route every operation through the provider that
/// issued it. File access is optional and defaults to `NotSupported`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Stable backend name, persisted alongside every handle
    fn name(&self) -> &str;

    /// Create and start a fresh sandbox for `session_id`
    async fn provision(&self, session_id: &str) -> Result<SandboxHandle>;

    /// Tear down a sandbox. Already-gone sandboxes are not an error.
    async fn terminate(&self, handle: &SandboxHandle) -> Result<()>;

    /// Never fails; an unreachable backend reports `Unknown`
    async fn health_check(&self, handle: &SandboxHandle) -> HealthStatus;

    /// Run a command to completion, forwarding output to `sink` when given
    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        sink: Option<OutputSink>,
    ) -> Result<ExecOutput>;

    /// Abort the running command started with `tag`. Unknown tags are a no-op.
    async fn cancel(&self, handle: &SandboxHandle, tag: &str) -> Result<()>;

    async fn list_files(&self, _handle: &SandboxHandle, _path: &str) -> Result<Vec<FileEntry>> {
        Err(ProviderError::NotSupported(format!(
            "{} does not support file listing",
            self.name()
        )))
    }

    async fn read_file(&self, _handle: &SandboxHandle, _path: &str) -> Result<Vec<u8>> {
        Err(ProviderError::NotSupported(format!(
            "{} does not support file reads",
            self.name()
        )))
    }

    async fn write_file(
        &self,
        _handle: &SandboxHandle,
        _path: &str,
        _contents: Vec<u8>,
    ) -> Result<()> {
        Err(ProviderError::NotSupported(format!(
            "{} does not support file writes",
            self.name()
        )))
    }

    async fn delete_path(
        &self,
        _handle: &SandboxHandle,
        _path: &str,
        _recursive: bool,
    ) -> Result<()> {
        Err(ProviderError::NotSupported(format!(
            "{} does not support deleting files",
            self.name()
        )))
    }

    async fn make_dir(&self, _handle: &SandboxHandle, _path: &str) -> Result<()> {
        Err(ProviderError::NotSupported(format!(
            "{} does not support creating directories",
            self.name()
        )))
    }
}

/// Validate a path supplied by a client for use inside a sandbox
///
/// Paths must be absolute, free of `..` components and NUL bytes. The
/// returned string is the normalized form (no `.` components, no trailing
/// slash except for the root).
pub fn validate_sandbox_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(ProviderError::InvalidPath("path is empty".to_string()));
    }
    if path.contains('\0') {
        return Err(ProviderError::InvalidPath(
            "path contains a NUL byte".to_string(),
        ));
    }

    let mut parts: Vec<&str> = Vec::new();
    let mut components = Path::new(path).components();
    match components.next() {
        Some(Component::RootDir) => {}
        _ => {
            return Err(ProviderError::InvalidPath(format!(
                "path must be absolute: {}",
                path
            )))
        }
    }

    for component in components {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                ProviderError::InvalidPath(format!("path is not valid UTF-8: {}", path))
            })?),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ProviderError::InvalidPath(format!(
                    "parent directory references are not allowed: {}",
                    path
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ProviderError::InvalidPath(path.to_string()))
            }
        }
    }

    Ok(format!("/{}", parts.join("/")))
}
