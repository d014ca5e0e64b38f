// ABOUTME: Docker provider implementation for local container-based sandboxes
// ABOUTME: Uses bollard to provision containers, run agent commands and access files

use super::{
    validate_sandbox_path, ExecOutput, ExecRequest, FileEntry, FileKind, HealthStatus,
    OutputChunk, OutputSink, ProviderError, Result, SandboxHandle, SandboxProvider, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "docker";
const LABEL_PREFIX: &str = "corral.sandbox";
const PID_DIR: &str = "/tmp";
/// Exit status the file helpers use to signal a missing path
const MISSING_PATH_EXIT: i64 = 3;

/// Resource and image settings applied to every container
#[derive(Debug, Clone, PartialEq)]
pub struct DockerSettings {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_cores: f32,
    pub network_mode: String,
    pub working_dir: String,
    pub pull_timeout: Duration,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/corral-dev/agent-sandbox:latest".to_string(),
            memory_mb: 2048,
            cpu_cores: 2.0,
            network_mode: "bridge".to_string(),
            working_dir: "/workspace".to_string(),
            pull_timeout: Duration::from_secs(600),
        }
    }
}

pub struct DockerProvider {
    client: Docker,
    settings: DockerSettings,
    /// Cache of successfully pulled images to avoid redundant pulls
    /// Key: image name, Value: timestamp when pulled
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// Tags of commands currently running, keyed by container id
    running: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl DockerProvider {
    /// Connect to the local Docker daemon
    pub fn new(settings: DockerSettings) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, settings: DockerSettings) -> Self {
        Self {
            client,
            settings,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    fn container_config(&self, session_id: &str) -> Config<String> {
        let labels = HashMap::from([
            (format!("{}.managed", LABEL_PREFIX), "true".to_string()),
            (format!("{}.session", LABEL_PREFIX), session_id.to_string()),
        ]);

        let host_config = bollard::models::HostConfig {
            memory: Some((self.settings.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((self.settings.cpu_cores as f64 * 1_000_000_000.0) as i64),
            network_mode: Some(self.settings.network_mode.clone()),
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(self.settings.image.clone()),
            // Keep the container alive between executions
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(self.settings.working_dir.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        {
            let cache = self.image_cache.read().await;
            if cache.contains_key(image) {
                debug!("Image {} found in cache, skipping pull", image);
                if self.image_exists(image).await? {
                    return Ok(());
                }
            }
        }
        if self.image_exists(image).await? {
            self.image_cache
                .write()
                .await
                .insert(image.to_string(), chrono::Utc::now());
            return Ok(());
        }

        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.settings.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.settings.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(status) = &info.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                }
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.settings.pull_timeout
            ))),
        }
    }

    fn pid_file(tag: &str) -> Result<String> {
        let valid = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ProviderError::InternalError(format!(
                "invalid exec tag: {}",
                tag
            )));
        }
        Ok(format!("{}/.corral-exec-{}.pid", PID_DIR, tag))
    }

    /// Run `command` inside the container, collecting output
    async fn run(
        &self,
        container_id: &str,
        command: Vec<String>,
        env: Vec<String>,
        working_dir: Option<String>,
        sink: Option<&OutputSink>,
    ) -> Result<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(command),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(map_container_error)?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_container_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    let (stream, message) = match msg {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            (StreamType::Stdout, message)
                        }
                        Ok(LogOutput::StdErr { message }) => (StreamType::Stderr, message),
                        Ok(_) => continue,
                        Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
                    };
                    match stream {
                        StreamType::Stdout => stdout.extend_from_slice(&message),
                        StreamType::Stderr => stderr.extend_from_slice(&message),
                    }
                    if let Some(sink) = sink {
                        // A dropped receiver only means nobody is watching
                        let _ = sink.send(OutputChunk {
                            timestamp: chrono::Utc::now(),
                            stream,
                            data: message.to_vec(),
                        });
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ContainerError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(map_container_error)?;

        Ok(ExecOutput {
            exit_code: exec_inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Run a shell snippet with positional arguments
    async fn run_shell(&self, container_id: &str, script: &str, args: &[&str]) -> Result<ExecOutput> {
        let mut command = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "corral".to_string(),
        ];
        command.extend(args.iter().map(|a| a.to_string()));
        self.run(container_id, command, Vec::new(), None, None).await
    }

    async fn signal_tag(&self, container_id: &str, tag: &str) -> Result<()> {
        let pid_file = Self::pid_file(tag)?;
        let output = self
            .run_shell(
                container_id,
                r#"test -f "$1" || exit 0; kill -TERM "$(cat "$1")" 2>/dev/null; rm -f "$1""#,
                &[&pid_file],
            )
            .await?;
        if output.exit_code != 0 {
            warn!(
                "Signalling exec {} in {} exited with {}: {}",
                tag,
                container_id,
                output.exit_code,
                output.stderr_lossy().trim()
            );
        }
        Ok(())
    }

    async fn untrack(&self, container_id: &str, tag: &str) {
        let mut running = self.running.write().await;
        if let Some(tags) = running.get_mut(container_id) {
            tags.remove(tag);
            if tags.is_empty() {
                running.remove(container_id);
            }
        }
    }
}

fn map_container_error(e: bollard::errors::Error) -> ProviderError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::NotFound(message),
        other => ProviderError::ContainerError(other.to_string()),
    }
}

fn check_file_result(output: &ExecOutput, path: &str) -> Result<()> {
    match output.exit_code {
        0 => Ok(()),
        MISSING_PATH_EXIT => Err(ProviderError::NotFound(path.to_string())),
        code => Err(ProviderError::ContainerError(format!(
            "{} (exit {}): {}",
            path,
            code,
            output.stderr_lossy().trim()
        ))),
    }
}

fn parse_listing(dir: &str, raw: &str) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = raw
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let kind = match fields.next()? {
                "f" => FileKind::File,
                "d" => FileKind::Directory,
                "l" => FileKind::Symlink,
                _ => FileKind::Other,
            };
            let size = fields.next()?.parse().unwrap_or(0);
            let name = fields.next()?.to_string();
            let path = if dir == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", dir, name)
            };
            Some(FileEntry {
                name,
                path,
                kind,
                size,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

fn single_file_tar(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    archive.append_data(&mut header, name, contents)?;
    archive.into_inner()
}

fn split_parent(path: &str) -> Result<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((_, "")) | None => Err(ProviderError::InvalidPath(format!(
            "not a file path: {}",
            path
        ))),
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn provision(&self, session_id: &str) -> Result<SandboxHandle> {
        let name = format!("corral-{}", session_id);
        info!("Provisioning container {} for session {}", name, session_id);

        self.ensure_image(&self.settings.image).await?;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.container_config(session_id))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!("Failed to start container {}: {}", container.id, e);
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(cleanup) = self
                .client
                .remove_container(&container.id, Some(options))
                .await
            {
                warn!("Failed to remove unstarted container {}: {}", container.id, cleanup);
            }
            return Err(ProviderError::ContainerError(e.to_string()));
        }

        Ok(SandboxHandle::new(container.id, PROVIDER_NAME))
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<()> {
        info!("Removing container: {}", handle.id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        let result = match self.client.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", handle.id);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        };
        if result.is_ok() {
            self.running.write().await.remove(&handle.id);
        }
        result
    }

    async fn health_check(&self, handle: &SandboxHandle) -> HealthStatus {
        match self
            .client
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => match inspect.state.and_then(|state| state.running) {
                Some(true) => HealthStatus::Healthy,
                Some(false) => HealthStatus::Unhealthy,
                None => HealthStatus::Unknown,
            },
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => HealthStatus::Unhealthy,
            Err(e) => {
                warn!("Health check for {} failed: {}", handle.id, e);
                HealthStatus::Unknown
            }
        }
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        sink: Option<OutputSink>,
    ) -> Result<ExecOutput> {
        let pid_file = Self::pid_file(&request.tag)?;
        if request.command.is_empty() {
            return Err(ProviderError::InternalError("empty command".to_string()));
        }
        debug!(
            "Executing {} in container {}: {:?}",
            request.tag, handle.id, request.command
        );

        // Record the shell pid so cancel can signal the command from inside
        let mut command = vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo $$ > "$0"; exec "$@""#.to_string(),
            pid_file,
        ];
        command.extend(request.command);

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let working_dir = request
            .working_dir
            .or_else(|| Some(self.settings.working_dir.clone()));

        self.running
            .write()
            .await
            .entry(handle.id.clone())
            .or_default()
            .insert(request.tag.clone());

        let result = tokio::time::timeout(
            request.timeout,
            self.run(&handle.id, command, env, working_dir, sink.as_ref()),
        )
        .await;

        let outcome = match result {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    "Exec {} in {} exceeded {:?}, signalling",
                    request.tag, handle.id, request.timeout
                );
                if let Err(e) = self.signal_tag(&handle.id, &request.tag).await {
                    warn!("Failed to stop timed out exec {}: {}", request.tag, e);
                }
                Err(ProviderError::Timeout(request.timeout))
            }
        };

        self.untrack(&handle.id, &request.tag).await;
        outcome
    }

    async fn cancel(&self, handle: &SandboxHandle, tag: &str) -> Result<()> {
        let is_running = self
            .running
            .read()
            .await
            .get(&handle.id)
            .map(|tags| tags.contains(tag))
            .unwrap_or(false);
        if !is_running {
            debug!("No running exec {} in {}", tag, handle.id);
            return Ok(());
        }
        info!("Cancelling exec {} in container {}", tag, handle.id);
        self.signal_tag(&handle.id, tag).await
    }

    async fn list_files(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<FileEntry>> {
        let path = validate_sandbox_path(path)?;
        let output = self
            .run_shell(
                &handle.id,
                r#"test -d "$1" || exit 3; find "$1" -mindepth 1 -maxdepth 1 -printf '%y\t%s\t%f\n'"#,
                &[&path],
            )
            .await?;
        check_file_result(&output, &path)?;
        Ok(parse_listing(&path, &output.stdout_lossy()))
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>> {
        let path = validate_sandbox_path(path)?;
        let output = self
            .run_shell(&handle.id, r#"test -f "$1" || exit 3; cat -- "$1""#, &[&path])
            .await?;
        check_file_result(&output, &path)?;
        Ok(output.stdout)
    }

    async fn write_file(&self, handle: &SandboxHandle, path: &str, contents: Vec<u8>) -> Result<()> {
        let path = validate_sandbox_path(path)?;
        let (parent, name) = split_parent(&path)?;

        let output = self
            .run_shell(&handle.id, r#"mkdir -p -- "$1""#, &[parent])
            .await?;
        check_file_result(&output, parent)?;

        let tar_data = single_file_tar(name, &contents)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;
        let options = UploadToContainerOptions {
            path: parent.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(&handle.id, Some(options), tar_data.into())
            .await
            .map_err(map_container_error)?;

        debug!("Wrote {} bytes to {}:{}", contents.len(), handle.id, path);
        Ok(())
    }

    async fn delete_path(&self, handle: &SandboxHandle, path: &str, recursive: bool) -> Result<()> {
        let path = validate_sandbox_path(path)?;
        if path == "/" {
            return Err(ProviderError::InvalidPath(
                "refusing to delete the sandbox root".to_string(),
            ));
        }
        let script = if recursive {
            r#"test -e "$1" || test -L "$1" || exit 3; rm -rf -- "$1""#
        } else {
            r#"test -e "$1" || test -L "$1" || exit 3; if [ -d "$1" ] && [ ! -L "$1" ]; then rmdir -- "$1"; else rm -f -- "$1"; fi"#
        };
        let output = self.run_shell(&handle.id, script, &[&path]).await?;
        check_file_result(&output, &path)
    }

    async fn make_dir(&self, handle: &SandboxHandle, path: &str) -> Result<()> {
        let path = validate_sandbox_path(path)?;
        let output = self
            .run_shell(&handle.id, r#"mkdir -p -- "$1""#, &[&path])
            .await?;
        check_file_result(&output, &path)
    }
}
