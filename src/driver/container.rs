//! Remote-container Worker Driver variant. Wraps a `bollard::Docker` handle
//! connected over the default unix socket — the same pairing the reference
//! codebase's `DockerSandbox` uses for its pipeline containers, generalized
//! from a single hard-coded pipeline shape to the driver-agnostic
//! launch/poll/terminate contract in [`crate::driver`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::driver::{DriverError, LaunchHandle, WorkerDriver, WorkerSpec, WorkerState};

/// Launches workers as Docker containers. `ContainerDriver::new` returns
/// `None`, not an error, when the daemon does not answer a `ping()` —
/// unavailability of a container runtime is a deployment fact, not a bug.
pub struct ContainerDriver {
    docker: Docker,
    image: String,
    /// Buffered log lines per container id, drained by `drain_output`.
    /// Shared with the background log-follow task spawned by `launch`,
    /// which is the only writer; `drain_output` and `terminate` are the
    /// only readers/removers.
    lines: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// The write half of an `attach_container` stream opened lazily by the
    /// first `send_input`, kept alive so later calls reuse the connection.
    stdins: Mutex<HashMap<String, Pin<Box<dyn AsyncWrite + Send>>>>,
}

impl ContainerDriver {
    pub async fn new(image: impl Into<String>) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self {
            docker,
            image: image.into(),
            lines: Arc::new(Mutex::new(HashMap::new())),
            stdins: Mutex::new(HashMap::new()),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DriverError::LaunchFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerDriver for ContainerDriver {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle, DriverError> {
        self.ensure_image(&self.image).await?;

        let env: Vec<String> = spec
            .env_map()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut labels = HashMap::new();
        labels.insert("forge.role".to_string(), spec.role.as_str().to_string());
        labels.insert("forge.feature".to_string(), spec.feature_id.to_string());

        let container_config = ContainerConfig {
            image: Some(self.image.clone()),
            cmd: if spec.argv_extra.is_empty() {
                None
            } else {
                Some(spec.argv_extra.clone())
            },
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig::default()),
            ..Default::default()
        };

        let name = format!("forge-worker-{}-{}", spec.feature_id, spec.role.as_str());
        let create_opts = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        self.lines.lock().await.insert(response.id.clone(), Vec::new());
        let docker = self.docker.clone();
        let cid = response.id.clone();
        let lines = self.lines.clone();
        tokio::spawn(async move {
            let opts = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&cid, Some(opts));
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                let text = String::from_utf8_lossy(&chunk.into_bytes()).into_owned();
                let mut buf = lines.lock().await;
                let Some(entry) = buf.get_mut(&cid) else { break };
                entry.extend(text.lines().map(str::to_string));
            }
        });

        Ok(LaunchHandle(response.id))
    }

    async fn poll(&self, handle: &LaunchHandle) -> Result<WorkerState, DriverError> {
        let inspect = self
            .docker
            .inspect_container(&handle.0, None)
            .await
            .map_err(|_| DriverError::NotFound)?;

        let state = inspect.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            return Ok(WorkerState::Coding);
        }
        match state.exit_code {
            Some(0) => Ok(WorkerState::Completed { exit_code: 0 }),
            Some(code) => Ok(WorkerState::Failed {
                exit_code: Some(code as i32),
            }),
            // Container created but not yet started, or status unreported.
            None => Ok(WorkerState::Started),
        }
    }

    async fn drain_output(&self, handle: &LaunchHandle) -> Result<Vec<String>, DriverError> {
        let mut lines = self.lines.lock().await;
        Ok(lines.get_mut(&handle.0).map(std::mem::take).unwrap_or_default())
    }

    async fn terminate(&self, handle: &LaunchHandle, _reason: &str) -> Result<(), DriverError> {
        let stop_opts = StopContainerOptions { t: 10 };
        let _ = self.docker.stop_container(&handle.0, Some(stop_opts)).await;
        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let _ = self.docker.remove_container(&handle.0, Some(remove_opts)).await;
        self.lines.lock().await.remove(&handle.0);
        self.stdins.lock().await.remove(&handle.0);
        Ok(())
    }

    async fn send_input(&self, handle: &LaunchHandle, text: &str) -> Result<(), DriverError> {
        let mut stdins = self.stdins.lock().await;
        if !stdins.contains_key(&handle.0) {
            let opts = AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(false),
                ..Default::default()
            };
            let AttachContainerResults { output: _, input } = self
                .docker
                .attach_container(&handle.0, Some(opts))
                .await
                .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;
            stdins.insert(handle.0.clone(), input);
        }
        let stdin = stdins.get_mut(&handle.0).expect("just inserted above");
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))
    }
}
