// ABOUTME: In-process scripted provider for exercising the engine without a container runtime
// ABOUTME: Exec results, health, failures and an in-memory file tree are driven by the test

use super::{
    validate_sandbox_path, ExecOutput, ExecRequest, FileEntry, FileKind, HealthStatus,
    OutputChunk, OutputSink, ProviderError, Result, SandboxHandle, SandboxProvider,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Exit status reported for a command stopped through `cancel`
pub const CANCELLED_EXIT_CODE: i64 = 143;

/// What the next `exec` call does
#[derive(Debug, Clone)]
pub enum ScriptedExec {
    /// Emit each line on stdout, pausing `line_delay` before each, then exit
    Complete {
        lines: Vec<String>,
        stderr: String,
        exit_code: i64,
        line_delay: Duration,
    },
    /// Produce no output for the given duration, then exit successfully
    Sleep(Duration),
    /// Fail at the provider level
    Fault(String),
}

impl ScriptedExec {
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedExec::Complete {
            lines: lines.into_iter().map(Into::into).collect(),
            stderr: String::new(),
            exit_code: 0,
            line_delay: Duration::ZERO,
        }
    }

    pub fn with_exit_code(self, code: i64) -> Self {
        match self {
            ScriptedExec::Complete {
                lines,
                stderr,
                line_delay,
                ..
            } => ScriptedExec::Complete {
                lines,
                stderr,
                exit_code: code,
                line_delay,
            },
            other => other,
        }
    }

    pub fn with_stderr(self, text: impl Into<String>) -> Self {
        match self {
            ScriptedExec::Complete {
                lines,
                exit_code,
                line_delay,
                ..
            } => ScriptedExec::Complete {
                lines,
                stderr: text.into(),
                exit_code,
                line_delay,
            },
            other => other,
        }
    }

    pub fn with_line_delay(self, delay: Duration) -> Self {
        match self {
            ScriptedExec::Complete {
                lines,
                stderr,
                exit_code,
                ..
            } => ScriptedExec::Complete {
                lines,
                stderr,
                exit_code,
                line_delay: delay,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

struct ScriptState {
    next_id: u64,
    live: HashSet<String>,
    provision_failures: VecDeque<ProviderError>,
    provision_delay: Duration,
    terminate_failure: Option<String>,
    default_health: HealthStatus,
    health: HashMap<String, HealthStatus>,
    execs: VecDeque<ScriptedExec>,
    default_exec: ScriptedExec,
    requests: Vec<ExecRequest>,
    provisioned: Vec<SandboxHandle>,
    terminated: Vec<String>,
    cancelled: Vec<String>,
    running: HashMap<String, Arc<Notify>>,
    files: HashMap<String, BTreeMap<String, Node>>,
}

/// Provider double with fully scripted behaviour
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                next_id: 0,
                live: HashSet::new(),
                provision_failures: VecDeque::new(),
                provision_delay: Duration::ZERO,
                terminate_failure: None,
                default_health: HealthStatus::Healthy,
                health: HashMap::new(),
                execs: VecDeque::new(),
                default_exec: ScriptedExec::lines(Vec::<String>::new()),
                requests: Vec::new(),
                provisioned: Vec::new(),
                terminated: Vec::new(),
                cancelled: Vec::new(),
                running: HashMap::new(),
                files: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A panicking test thread must not cascade into unrelated assertions
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a behaviour for the next `exec` call
    pub fn push_exec(&self, exec: ScriptedExec) {
        self.lock().execs.push_back(exec);
    }

    /// Behaviour used once the queue is empty
    pub fn set_default_exec(&self, exec: ScriptedExec) {
        self.lock().default_exec = exec;
    }

    pub fn fail_next_provision(&self, message: impl Into<String>) {
        self.lock()
            .provision_failures
            .push_back(ProviderError::ContainerError(message.into()));
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        self.lock().provision_delay = delay;
    }

    /// Make every `terminate` fail until cleared with `None`
    pub fn set_terminate_failure(&self, message: Option<&str>) {
        self.lock().terminate_failure = message.map(str::to_string);
    }

    pub fn set_health(&self, sandbox_id: &str, status: HealthStatus) {
        self.lock().health.insert(sandbox_id.to_string(), status);
    }

    pub fn set_default_health(&self, status: HealthStatus) {
        self.lock().default_health = status;
    }

    pub fn provisioned(&self) -> Vec<SandboxHandle> {
        self.lock().provisioned.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.lock().requests.clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_live(&self, sandbox_id: &str) -> bool {
        self.lock().live.contains(sandbox_id)
    }

    fn require_live(&self, handle: &SandboxHandle) -> Result<()> {
        if self.lock().live.contains(&handle.id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound(handle.id.clone()))
        }
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(&self, session_id: &str) -> Result<SandboxHandle> {
        let delay = self.lock().provision_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(err) = state.provision_failures.pop_front() {
            return Err(err);
        }
        state.next_id += 1;
        let handle = SandboxHandle::new(
            format!("sbx-{}-{}", state.next_id, session_id),
            "scripted",
        );
        state.live.insert(handle.id.clone());
        state.provisioned.push(handle.clone());

        let mut tree = BTreeMap::new();
        tree.insert("/workspace".to_string(), Node::Dir);
        state.files.insert(handle.id.clone(), tree);
        Ok(handle)
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<()> {
        let mut state = self.lock();
        if let Some(message) = &state.terminate_failure {
            return Err(ProviderError::ContainerError(message.clone()));
        }
        state.live.remove(&handle.id);
        state.files.remove(&handle.id);
        state.terminated.push(handle.id.clone());
        Ok(())
    }

    async fn health_check(&self, handle: &SandboxHandle) -> HealthStatus {
        let state = self.lock();
        if let Some(status) = state.health.get(&handle.id) {
            return *status;
        }
        if state.live.contains(&handle.id) {
            state.default_health
        } else {
            HealthStatus::Unhealthy
        }
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        sink: Option<OutputSink>,
    ) -> Result<ExecOutput> {
        self.require_live(handle)?;

        let cancel = Arc::new(Notify::new());
        let script = {
            let mut state = self.lock();
            state.requests.push(request.clone());
            state
                .running
                .insert(request.tag.clone(), Arc::clone(&cancel));
            state
                .execs
                .pop_front()
                .unwrap_or_else(|| state.default_exec.clone())
        };

        let run = async {
            let mut stdout = Vec::new();
            match script {
                ScriptedExec::Complete {
                    lines,
                    stderr,
                    exit_code,
                    line_delay,
                } => {
                    for line in lines {
                        if !line_delay.is_zero() {
                            tokio::time::sleep(line_delay).await;
                        }
                        let data = format!("{}\n", line).into_bytes();
                        stdout.extend_from_slice(&data);
                        if let Some(sink) = &sink {
                            let _ = sink.send(OutputChunk::stdout(data));
                        }
                    }
                    Ok((exit_code, stdout, stderr.into_bytes()))
                }
                ScriptedExec::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok((0, stdout, Vec::new()))
                }
                ScriptedExec::Fault(message) => Err(ProviderError::ContainerError(message)),
            }
        };

        let result = tokio::select! {
            outcome = tokio::time::timeout(request.timeout, run) => match outcome {
                Ok(Ok((exit_code, stdout, stderr))) => Ok(ExecOutput { exit_code, stdout, stderr }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ProviderError::Timeout(request.timeout)),
            },
            _ = cancel.notified() => Ok(ExecOutput {
                exit_code: CANCELLED_EXIT_CODE,
                stdout: Vec::new(),
                stderr: b"terminated".to_vec(),
            }),
        };

        self.lock().running.remove(&request.tag);
        result
    }

    async fn cancel(&self, _handle: &SandboxHandle, tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.cancelled.push(tag.to_string());
        if let Some(notify) = state.running.get(tag) {
            notify.notify_one();
        }
        Ok(())
    }

    async fn list_files(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<FileEntry>> {
        let path = validate_sandbox_path(path)?;
        let state = self.lock();
        let tree = state
            .files
            .get(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;
        if path != "/" && !matches!(tree.get(&path), Some(Node::Dir)) {
            return Err(ProviderError::NotFound(path));
        }

        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        Ok(tree
            .iter()
            .filter_map(|(entry_path, node)| {
                let name = entry_path.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                let (kind, size) = match node {
                    Node::File(data) => (FileKind::File, data.len() as u64),
                    Node::Dir => (FileKind::Directory, 0),
                };
                Some(FileEntry {
                    name: name.to_string(),
                    path: entry_path.clone(),
                    kind,
                    size,
                })
            })
            .collect())
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>> {
        let path = validate_sandbox_path(path)?;
        let state = self.lock();
        match state.files.get(&handle.id).and_then(|tree| tree.get(&path)) {
            Some(Node::File(data)) => Ok(data.clone()),
            _ => Err(ProviderError::NotFound(path)),
        }
    }

    async fn write_file(&self, handle: &SandboxHandle, path: &str, contents: Vec<u8>) -> Result<()> {
        let path = validate_sandbox_path(path)?;
        let mut state = self.lock();
        let tree = state
            .files
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;

        // Mirror `mkdir -p` on the parent
        let mut current = String::new();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            current.push('/');
            current.push_str(segment);
            match tree.get(&current) {
                Some(Node::File(_)) => return Err(ProviderError::InvalidPath(current)),
                Some(Node::Dir) => {}
                None => {
                    tree.insert(current.clone(), Node::Dir);
                }
            }
        }
        if matches!(tree.get(&path), Some(Node::Dir)) {
            return Err(ProviderError::InvalidPath(format!("{} is a directory", path)));
        }
        tree.insert(path, Node::File(contents));
        Ok(())
    }

    async fn delete_path(&self, handle: &SandboxHandle, path: &str, recursive: bool) -> Result<()> {
        let path = validate_sandbox_path(path)?;
        if path == "/" {
            return Err(ProviderError::InvalidPath(
                "refusing to delete the sandbox root".to_string(),
            ));
        }
        let mut state = self.lock();
        let tree = state
            .files
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;

        let prefix = format!("{}/", path);
        match tree.get(&path) {
            None => Err(ProviderError::NotFound(path)),
            Some(Node::File(_)) => {
                tree.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => {
                let has_children = tree.keys().any(|key| key.starts_with(&prefix));
                if has_children && !recursive {
                    return Err(ProviderError::ContainerError(format!(
                        "{}: directory not empty",
                        path
                    )));
                }
                tree.retain(|key, _| key != &path && !key.starts_with(&prefix));
                Ok(())
            }
        }
    }

    async fn make_dir(&self, handle: &SandboxHandle, path: &str) -> Result<()> {
        let path = validate_sandbox_path(path)?;
        let mut state = self.lock();
        let tree = state
            .files
            .get_mut(&handle.id)
            .ok_or_else(|| ProviderError::NotFound(handle.id.clone()))?;
        if path == "/" {
            return Ok(());
        }
        let mut current = String::new();
        for segment in path.trim_start_matches('/').split('/') {
            current.push('/');
            current.push_str(segment);
            match tree.get(&current) {
                Some(Node::File(_)) => return Err(ProviderError::InvalidPath(current)),
                Some(Node::Dir) => {}
                None => {
                    tree.insert(current.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_exec_streams_lines_and_records_request() {
        let provider = ScriptedProvider::new();
        let handle = provider.provision("ses_1").await.unwrap();
        provider.push_exec(ScriptedExec::lines(["one", "two"]).with_exit_code(2));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ExecRequest::new("exe_1", vec!["agent".to_string()], Duration::from_secs(5));
        let output = provider.exec(&handle, request, Some(tx)).await.unwrap();

        assert_eq!(output.exit_code, 2);
        assert_eq!(output.stdout_lossy(), "one\ntwo\n");
        assert_eq!(rx.recv().await.unwrap().data, b"one\n");
        assert_eq!(rx.recv().await.unwrap().data, b"two\n");
        assert_eq!(provider.exec_requests()[0].tag, "exe_1");
    }

    #[tokio::test]
    async fn test_cancel_stops_running_exec() {
        let provider = Arc::new(ScriptedProvider::new());
        let handle = provider.provision("ses_1").await.unwrap();
        provider.push_exec(ScriptedExec::Sleep(Duration::from_secs(30)));

        let task = {
            let provider = Arc::clone(&provider);
            let handle = handle.clone();
            tokio::spawn(async move {
                let request = ExecRequest::new("exe_c", vec!["agent".to_string()], Duration::from_secs(60));
                provider.exec(&handle, request, None).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        provider.cancel(&handle, "exe_c").await.unwrap();

        let output = task.await.unwrap().unwrap();
        assert_eq!(output.exit_code, CANCELLED_EXIT_CODE);
        assert_eq!(provider.cancelled(), vec!["exe_c".to_string()]);
    }

    #[tokio::test]
    async fn test_exec_timeout_is_reported() {
        let provider = ScriptedProvider::new();
        let handle = provider.provision("ses_1").await.unwrap();
        provider.push_exec(ScriptedExec::Sleep(Duration::from_secs(5)));

        let request = ExecRequest::new("exe_t", vec!["agent".to_string()], Duration::from_millis(50));
        let result = provider.exec(&handle, request, None).await;
        assert_eq!(result, Err(ProviderError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_health_reflects_termination() {
        let provider = ScriptedProvider::new();
        let handle = provider.provision("ses_1").await.unwrap();
        assert_eq!(provider.health_check(&handle).await, HealthStatus::Healthy);

        provider.terminate(&handle).await.unwrap();
        assert_eq!(provider.health_check(&handle).await, HealthStatus::Unhealthy);
        assert!(provider.exec(
            &handle,
            ExecRequest::new("exe_x", vec!["true".to_string()], Duration::from_secs(1)),
            None
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_file_tree_operations() {
        let provider = ScriptedProvider::new();
        let handle = provider.provision("ses_1").await.unwrap();

        provider
            .write_file(&handle, "/workspace/src/main.rs", b"fn main() {}".to_vec())
            .await
            .unwrap();
        provider.make_dir(&handle, "/workspace/docs").await.unwrap();

        let listing = provider.list_files(&handle, "/workspace").await.unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "src"]);

        assert_eq!(
            provider.read_file(&handle, "/workspace/src/main.rs").await.unwrap(),
            b"fn main() {}"
        );

        assert!(provider.delete_path(&handle, "/workspace/src", false).await.is_err());
        provider.delete_path(&handle, "/workspace/src", true).await.unwrap();
        assert!(matches!(
            provider.read_file(&handle, "/workspace/src/main.rs").await,
            Err(ProviderError::NotFound(_))
        ));
    }
}
