// ABOUTME: Docker provider implementation of the isolated execution backend
// ABOUTME: Uses bollard to run one locked-down, network-less container per session phase

use super::{OutputChunk, Phase, PhaseEvent, PhaseSpec, PhaseStream, Provider, ProviderError, Result, StreamType};
use async_stream::try_stream;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mount point of the session workspace inside every execution unit
pub const WORKSPACE_MOUNT: &str = "/workspace";

const LABEL_PREFIX: &str = "coderun";

/// Exit status a shell reports for a command it cannot find
pub const COMMAND_NOT_FOUND_EXIT_CODE: i64 = 127;

pub struct DockerProvider {
    client: Docker,
    /// Cache of successfully pulled images to avoid redundant pulls
    /// Key: image name (e.g., "gcc:latest"), Value: timestamp when pulled
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    /// Create a new Docker provider with custom pull timeout
    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Create with a specific Docker connection and custom timeout
    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    async fn create_phase_container(&self, spec: &PhaseSpec) -> Result<String> {
        let name = container_name(&spec.session_id, spec.phase);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let user = workspace_owner(&spec.workspace).await;
        let container = self
            .client
            .create_container(Some(options), container_config(spec, user))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        for warning in &container.warnings {
            warn!(container = %name, "Docker warning: {}", warning);
        }
        debug!(container_id = %container.id, container = %name, "Created container");

        Ok(container.id)
    }
}

fn container_name(session_id: &str, phase: Phase) -> String {
    format!("{}-{}-{}", LABEL_PREFIX, session_id, phase)
}

/// `uid:gid` owning the workspace directory.
///
/// Running the unit as that user lets it write the bind mount with every
/// capability dropped, and leaves files the server can delete afterwards.
#[cfg(unix)]
async fn workspace_owner(workspace: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;

    match tokio::fs::metadata(workspace).await {
        Ok(metadata) => Some(format!("{}:{}", metadata.uid(), metadata.gid())),
        Err(e) => {
            warn!(workspace = %workspace.display(), "Cannot read workspace owner: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
async fn workspace_owner(_workspace: &Path) -> Option<String> {
    None
}

/// Translate a phase spec into a bollard container config.
///
/// The policy is fixed: no network, memory ceiling without extra swap,
/// CFS period/quota, no capabilities, no privilege escalation.
fn container_config(spec: &PhaseSpec, user: Option<String>) -> Config<String> {
    let labels = HashMap::from([
        (format!("{}.managed", LABEL_PREFIX), "true".to_string()),
        (format!("{}.session_id", LABEL_PREFIX), spec.session_id.clone()),
        (format!("{}.phase", LABEL_PREFIX), spec.phase.to_string()),
    ]);

    let memory = spec.limits.memory_bytes();
    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:rw",
            spec.workspace.display(),
            WORKSPACE_MOUNT
        )]),
        memory: Some(memory),
        memory_swap: Some(memory),
        cpu_period: Some(spec.limits.cpu_period),
        cpu_quota: Some(spec.limits.cpu_quota),
        network_mode: spec
            .limits
            .network_disabled
            .then(|| "none".to_string()),
        cap_drop: Some(vec!["ALL".to_string()]),
        privileged: Some(false),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        user,
        env: Some(vec!["HOME=/tmp".to_string()]),
        working_dir: Some(WORKSPACE_MOUNT.to_string()),
        network_disabled: Some(spec.limits.network_disabled),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn to_chunk(output: LogOutput) -> Option<OutputChunk> {
    let (stream, data) = match output {
        LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
        LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
        LogOutput::Console { message } => (StreamType::Stdout, message.to_vec()),
        LogOutput::StdIn { .. } => return None,
    };

    Some(OutputChunk {
        timestamp: chrono::Utc::now(),
        stream,
        data,
    })
}

/// Whether a start failure means the command's program does not exist
fn is_missing_executable(error: &bollard::errors::Error) -> bool {
    match error {
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            message.contains("exec")
                && (message.contains("executable file not found")
                    || message.contains("no such file or directory"))
        }
        _ => false,
    }
}

/// The phase outcome of a program that could not be found
fn command_not_found(command: &[String]) -> PhaseStream {
    let program = command.first().map(String::as_str).unwrap_or_default();
    let events = vec![
        Ok(PhaseEvent::Output(OutputChunk {
            timestamp: chrono::Utc::now(),
            stream: StreamType::Stderr,
            data: format!("{}: command not found\n", program).into_bytes(),
        })),
        Ok(PhaseEvent::Exited(COMMAND_NOT_FOUND_EXIT_CODE)),
    ];
    Box::pin(futures::stream::iter(events))
}

async fn wait_for_exit(client: &Docker, container_id: &str, timeout: Duration) -> Result<i64> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut wait = client.wait_container(container_id, Some(options));

    match tokio::time::timeout(timeout, wait.next()).await {
        Err(_) => Err(ProviderError::WaitTimeout(timeout)),
        Ok(None) => Err(ProviderError::ProtocolError(
            "wait stream closed without an exit status".to_string(),
        )),
        Ok(Some(Ok(response))) => Ok(response.status_code),
        // bollard reports nonzero exits as an error carrying the code
        Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => Ok(code),
        Ok(Some(Err(e))) => Err(ProviderError::ContainerError(e.to_string())),
    }
}

async fn remove_container(client: &Docker, container_id: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };

    match client.remove_container(container_id, Some(options)).await {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            debug!(container_id = %container_id, "Container already removed");
            Ok(())
        }
        Err(e) => Err(ProviderError::ContainerError(e.to_string())),
    }
}

/// Force-removes its container on drop unless disarmed.
struct ContainerGuard {
    client: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(client: Docker, container_id: String) -> Self {
        Self {
            client,
            container_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let client = self.client.clone();
        let container_id = std::mem::take(&mut self.container_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = remove_container(&client, &container_id).await {
                        warn!(container_id = %container_id, "Failed to remove abandoned container: {}", e);
                    } else {
                        info!(container_id = %container_id, "Removed abandoned container");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %container_id, "No runtime available, container left behind");
            }
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
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

    async fn pull_image(&self, image: &str) -> Result<()> {
        {
            let cache = self.image_cache.read().await;
            if cache.contains_key(image) && self.image_exists(image).await? {
                debug!("Image {} found in cache, skipping pull", image);
                return Ok(());
            }
        }

        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                let mut cache = self.image_cache.write().await;
                cache.insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn run_phase(&self, spec: PhaseSpec) -> Result<PhaseStream> {
        let container_id = self.create_phase_container(&spec).await?;
        let mut guard = ContainerGuard::new(self.client.clone(), container_id.clone());

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            if !is_missing_executable(&e) {
                return Err(ProviderError::ContainerError(e.to_string()));
            }
            info!(
                session_id = %spec.session_id,
                phase = %spec.phase,
                "Phase command not found: {}", e
            );
            remove_container(&self.client, &container_id).await?;
            guard.disarm();
            return Ok(command_not_found(&spec.command));
        }

        info!(
            session_id = %spec.session_id,
            phase = %spec.phase,
            container_id = %container_id,
            "Started execution unit"
        );

        let client = self.client.clone();
        let stream = try_stream! {
            let mut guard = guard;
            let deadline = spec
                .phase_timeout
                .map(|limit| (Instant::now() + limit, limit));

            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut logs = client.logs(&container_id, Some(options));

            loop {
                let next = match deadline {
                    Some((at, limit)) => tokio::time::timeout_at(at, logs.next())
                        .await
                        .map_err(|_| {
                            warn!(container_id = %container_id, "Phase exceeded {:?}, removing container", limit);
                            ProviderError::PhaseTimeout(limit)
                        })?,
                    None => logs.next().await,
                };

                let Some(item) = next else { break };
                let output = item.map_err(|e| ProviderError::StreamError(e.to_string()))?;
                if let Some(chunk) = to_chunk(output) {
                    yield PhaseEvent::Output(chunk);
                }
            }

            let exit_code = wait_for_exit(&client, &container_id, spec.wait_timeout).await?;
            remove_container(&client, &container_id).await?;
            guard.disarm();

            debug!(
                container_id = %container_id,
                exit_code,
                "Execution unit finished and removed"
            );
            yield PhaseEvent::Exited(exit_code);
        };

        Ok(Box::pin(stream))
    }
}
