// ABOUTME: Sandbox provisioning capability used by the session registry and execution runner
// ABOUTME: Exposes the provider trait, the Docker backend and a scripted backend for tests

pub mod providers;

pub use providers::{
    validate_sandbox_path, DockerProvider, DockerSettings, ExecOutput, ExecRequest, FileEntry,
    FileKind, HealthStatus, OutputChunk, OutputSink, ProviderError, Result, SandboxHandle,
    SandboxProvider, StreamType,
};

#[cfg(any(test, feature = "test-utils"))]
pub use providers::{ScriptedExec, ScriptedProvider};
