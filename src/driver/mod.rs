//! Worker Driver — a single contract with two variants (local-process and
//! remote-container) that launches one worker and drives it to a terminal
//! state. The contract never leaks platform-specific types to callers: a
//! [`WorkerState`] enum and, on termination, an optional exit code plus stop
//! reason is everything the Pipeline Engine and Work-Session Manager see.

pub mod container;
pub mod local;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::DriverError;
use crate::ids::{FeatureId, ProjectId};
use crate::store::types::AgentRole;

pub use container::ContainerDriver;
pub use local::LocalProcessDriver;

/// Everything a worker entrypoint needs to know about the task it was
/// launched for. Every Worker Driver variant sets these as environment
/// variables on the spawned process or container.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub role: AgentRole,
    pub repo_url: String,
    pub feature_id: FeatureId,
    pub project_id: ProjectId,
    pub feature_name: String,
    pub feature_description: String,
    pub base_branch: String,
    /// Extra argv appended after the fixed entrypoint script.
    pub argv_extra: Vec<String>,
    /// Installation token for the external system, re-resolved by the
    /// Pipeline Engine at the start of every stage (§9 "per-pipeline retry
    /// token refresh"). `None` when no external-system integration is
    /// configured for the project.
    pub access_token: Option<String>,
}

impl WorkerSpec {
    /// The environment map handed to every worker, regardless of driver
    /// variant, per the fixed contract.
    pub fn env_map(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("AGENT_ROLE".to_string(), self.role.as_str().to_string());
        env.insert("REPO_URL".to_string(), self.repo_url.clone());
        env.insert("FEATURE_ID".to_string(), self.feature_id.to_string());
        env.insert("PROJECT_ID".to_string(), self.project_id.to_string());
        env.insert("FEATURE_NAME".to_string(), self.feature_name.clone());
        env.insert(
            "FEATURE_DESCRIPTION".to_string(),
            self.feature_description.clone(),
        );
        env.insert("BASE_BRANCH".to_string(), self.base_branch.clone());
        if let Some(token) = &self.access_token {
            env.insert("ACCESS_TOKEN".to_string(), token.clone());
        }
        env
    }
}

/// The driver-agnostic lifecycle state of a launched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Started,
    Coding,
    Completed { exit_code: i32 },
    Failed { exit_code: Option<i32> },
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Completed { .. } | WorkerState::Failed { .. })
    }
}

/// Opaque handle to a launched worker. Each driver variant stores whatever
/// it needs (a container id, a child process id) behind this handle and the
/// caller never inspects it directly.
#[derive(Debug, Clone)]
pub struct LaunchHandle(pub String);

/// A contract implemented once per backing mechanism. The Pipeline Engine
/// and Work-Session Manager depend only on this trait, never on `bollard`
/// or `tokio::process` directly.
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle, DriverError>;

    /// Poll for the current state of a previously launched worker.
    async fn poll(&self, handle: &LaunchHandle) -> Result<WorkerState, DriverError>;

    /// Lines of output produced since the last call, if any. Every driver
    /// implementation buffers output for in-process replay: the
    /// local-process driver from the child's stdout, the container driver
    /// from `docker logs --follow` into the same per-handle buffer.
    async fn drain_output(&self, handle: &LaunchHandle) -> Result<Vec<String>, DriverError>;

    /// Request termination with a human-readable reason (used on timeout
    /// and on cancellation).
    async fn terminate(&self, handle: &LaunchHandle, reason: &str) -> Result<(), DriverError>;

    /// Write `text` followed by a newline to the worker's stdin. Only
    /// meaningful for workers launched for an interactive work session;
    /// pipeline stage workers never call this.
    async fn send_input(&self, handle: &LaunchHandle, text: &str) -> Result<(), DriverError>;
}
