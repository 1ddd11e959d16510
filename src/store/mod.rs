//! Store Gateway — the persistent-operations interface the rest of the
//! control-plane depends on. The real store (a database service fronted by
//! whatever persistence layer an installation chooses) lives outside this
//! crate; `Store` is the contract, and `memory::MemoryStore` is a reference
//! implementation used by tests and the `serve --store memory` CLI mode.

pub mod memory;
pub mod types;

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::ids::{AgentRunId, FeatureId, JobId, ProjectId, ThreadId};
use types::*;

/// Partial update for [`Project`]; a field left `None` is left unchanged.
/// Nullable columns (`repo_url`, `issue_tracker_ref`) use the
/// outer-`Option` = "touch it", inner-`Option` = "new value" convention so a
/// patch can distinguish "leave as-is" from "clear it".
#[derive(Debug, Default, Clone)]
pub struct ProjectPatch {
    pub repo_url: Option<Option<String>>,
    pub default_branch: Option<String>,
    pub concurrency_cap: Option<u32>,
    pub issue_tracker_ref: Option<Option<String>>,
    pub active: Option<bool>,
}

/// Partial update for [`Feature`], same convention as [`ProjectPatch`].
#[derive(Debug, Default, Clone)]
pub struct FeaturePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub category: Option<String>,
    pub issue_tracker_ref: Option<Option<String>>,
}

/// The closed set of named operations the control-plane performs against
/// persistent state. Every method may fail with [`StoreError::Transient`]
/// (caller retries) or a permanent variant (caller surfaces).
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_active_projects(&self) -> Result<Vec<Project>, StoreError>;
    async fn get_project(&self, id: ProjectId) -> Result<Project, StoreError>;
    async fn create_project(
        &self,
        name: &str,
        repo_url: Option<String>,
        default_branch: &str,
        concurrency_cap: u32,
        issue_tracker_ref: Option<String>,
    ) -> Result<Project, StoreError>;
    async fn update_project(&self, id: ProjectId, patch: ProjectPatch) -> Result<Project, StoreError>;

    /// Features with status `pending` and every dependency `passing`.
    async fn list_ready_features(&self, project: ProjectId) -> Result<Vec<Feature>, StoreError>;
    async fn get_feature(&self, id: FeatureId) -> Result<Feature, StoreError>;
    async fn list_features(&self, project: ProjectId) -> Result<Vec<Feature>, StoreError>;
    async fn create_feature(
        &self,
        project_id: ProjectId,
        name: &str,
        description: &str,
        priority: i32,
        category: &str,
        dependencies: Vec<FeatureId>,
        issue_tracker_ref: Option<String>,
    ) -> Result<Feature, StoreError>;
    async fn update_feature(&self, id: FeatureId, patch: FeaturePatch) -> Result<Feature, StoreError>;
    async fn delete_feature(&self, id: FeatureId) -> Result<(), StoreError>;
    /// Adds `dependency` to `feature`'s dependency set. Fails with
    /// [`StoreError::CyclicDependency`] if doing so would create a cycle.
    async fn add_dependency(&self, feature: FeatureId, dependency: FeatureId) -> Result<(), StoreError>;
    async fn remove_dependency(&self, feature: FeatureId, dependency: FeatureId) -> Result<(), StoreError>;

    /// Atomic CAS from `pending` to `in_progress`. Fails with
    /// [`StoreError::AlreadyClaimed`] if the precondition is violated.
    async fn claim_feature(&self, feature: FeatureId, agent_id: &str) -> Result<(), StoreError>;
    async fn mark_feature_review_ready(&self, feature: FeatureId) -> Result<(), StoreError>;
    async fn mark_feature_failing(&self, feature: FeatureId) -> Result<(), StoreError>;
    async fn transition_review_ready_to_passing(&self, feature: FeatureId) -> Result<(), StoreError>;
    /// Operator-triggered reset of a `failing` feature back to `pending`.
    async fn reset_feature_to_pending(&self, feature: FeatureId) -> Result<(), StoreError>;

    async fn create_agent_run(
        &self,
        project_id: ProjectId,
        feature_id: FeatureId,
        role: AgentRole,
        agent_id: &str,
    ) -> Result<AgentRunId, StoreError>;
    async fn get_agent_run(&self, id: AgentRunId) -> Result<AgentRun, StoreError>;
    async fn update_agent_status(
        &self,
        run_id: AgentRunId,
        status: AgentRunStatus,
    ) -> Result<(), StoreError>;
    async fn complete_agent_run(
        &self,
        run_id: AgentRunId,
        status: AgentRunStatus,
        summary: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn create_message(
        &self,
        run_id: AgentRunId,
        thread_id: Option<ThreadId>,
        sender: MessageSender,
        message_type: MessageType,
        role: AgentRole,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<AgentMessage, StoreError>;
    async fn list_messages(
        &self,
        run_id: AgentRunId,
        since: Option<u64>,
        sender: Option<MessageSender>,
    ) -> Result<Vec<AgentMessage>, StoreError>;
    async fn list_messages_by_thread(
        &self,
        thread_id: ThreadId,
        since: Option<u64>,
    ) -> Result<Vec<AgentMessage>, StoreError>;

    async fn create_thread(
        &self,
        agent_id: &str,
        project_id: ProjectId,
        title: Option<String>,
        mode: ThreadMode,
    ) -> Result<AgentThread, StoreError>;
    async fn get_thread(&self, agent_id: &str, thread_id: ThreadId) -> Result<AgentThread, StoreError>;
    async fn find_thread(
        &self,
        agent_id: &str,
        thread_id: ThreadId,
    ) -> Result<Option<AgentThread>, StoreError>;
    async fn update_thread_status(
        &self,
        thread_id: ThreadId,
        status: ThreadStatus,
    ) -> Result<(), StoreError>;

    async fn enqueue_job(
        &self,
        agent_id: &str,
        project_id: ProjectId,
        prompt: &str,
        thread_id: Option<ThreadId>,
        queued_by: QueuedBy,
        feature_id: Option<FeatureId>,
    ) -> Result<QueueEntry, StoreError>;
    async fn dequeue_job(&self, agent_id: &str) -> Result<Option<QueueEntry>, StoreError>;
    async fn peek_job(&self, agent_id: &str) -> Result<Option<QueueEntry>, StoreError>;
    async fn remove_job(&self, agent_id: &str, job_id: JobId) -> Result<(), StoreError>;
    async fn reorder_job(
        &self,
        agent_id: &str,
        job_id: JobId,
        new_position: i64,
    ) -> Result<(), StoreError>;
    async fn list_queue(&self, agent_id: &str) -> Result<Vec<QueueEntry>, StoreError>;
    async fn mark_job_completed(&self, agent_id: &str, job_id: JobId) -> Result<(), StoreError>;
    async fn mark_job_failed(
        &self,
        agent_id: &str,
        job_id: JobId,
        message: &str,
    ) -> Result<(), StoreError>;
}
