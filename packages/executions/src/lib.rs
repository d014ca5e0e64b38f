// ABOUTME: Execution runner for Corral: prompted agent runs inside session sandboxes
// ABOUTME: Enforces tool filtering, turn limits and deadlines, then reports each outcome exactly once

pub mod agent;
pub mod error;
pub mod runner;
pub mod storage;
pub mod tools;
pub mod types;

pub use error::{ExecutionError, Result};
pub use runner::{ExecutionHandle, ExecutionRunner, RunnerSettings};
pub use storage::ExecutionStorage;
pub use types::{ErrorDetail, Execution, ExecutionParams, ExecutionStatus};
