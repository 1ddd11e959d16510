//! In-memory reference implementation of [`Store`].
//!
//! Not a production store — it exists so the rest of the crate is runnable
//! and testable without an external database, the same role
//! `FactoryDb::new_in_memory()` plays for the reference codebase's own test
//! suite. It enforces every invariant in the data model itself (CAS
//! semantics, the feature status DAG, queue ordering) so property tests can
//! run against it directly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::StoreError;
use crate::ids::{AgentRunId, FeatureId, JobId, ProjectId, ThreadId};
use crate::store::types::*;
use crate::store::{FeaturePatch, ProjectPatch, Store};

#[derive(Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    features: HashMap<FeatureId, Feature>,
    runs: HashMap<AgentRunId, AgentRun>,
    messages: Vec<AgentMessage>,
    threads: HashMap<ThreadId, AgentThread>,
    queues: HashMap<String, Vec<QueueEntry>>,
    next_project_id: i64,
    next_feature_id: i64,
    next_run_id: i64,
    next_thread_id: i64,
    next_job_id: i64,
    next_message_id: i64,
}

/// In-memory `Store`. Cheap to clone (an `Arc` internally via the caller),
/// guarded by a plain `std::sync::Mutex` that is never held across an
/// `.await` point.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a project directly, bypassing `create_project` (test/dev
    /// convenience for fixtures that need a specific id or concurrency cap).
    pub fn seed_project(&self, project: Project) {
        self.lock().projects.insert(project.id, project);
    }

    /// Seed a feature directly (test/dev convenience, see `seed_project`).
    pub fn seed_feature(&self, feature: Feature) {
        self.lock().features.insert(feature.id, feature);
    }
}

fn is_ready(feature: &Feature, features: &HashMap<FeatureId, Feature>) -> bool {
    feature.status == FeatureStatus::Pending
        && feature.dependencies.iter().all(|dep| {
            features
                .get(dep)
                .map(|f| f.status == FeatureStatus::Passing)
                .unwrap_or(false)
        })
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_active_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self
            .lock()
            .projects
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project, StoreError> {
        self.lock()
            .projects
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "project",
                id: id.to_string(),
            })
    }

    async fn create_project(
        &self,
        name: &str,
        repo_url: Option<String>,
        default_branch: &str,
        concurrency_cap: u32,
        issue_tracker_ref: Option<String>,
    ) -> Result<Project, StoreError> {
        let mut inner = self.lock();
        inner.next_project_id += 1;
        let project = Project {
            id: ProjectId(inner.next_project_id),
            name: name.to_string(),
            repo_url,
            default_branch: default_branch.to_string(),
            concurrency_cap,
            issue_tracker_ref,
            active: true,
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn update_project(&self, id: ProjectId, patch: ProjectPatch) -> Result<Project, StoreError> {
        let mut inner = self.lock();
        let project = inner.projects.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "project",
            id: id.to_string(),
        })?;
        if let Some(repo_url) = patch.repo_url {
            project.repo_url = repo_url;
        }
        if let Some(default_branch) = patch.default_branch {
            project.default_branch = default_branch;
        }
        if let Some(cap) = patch.concurrency_cap {
            project.concurrency_cap = cap;
        }
        if let Some(issue_tracker_ref) = patch.issue_tracker_ref {
            project.issue_tracker_ref = issue_tracker_ref;
        }
        if let Some(active) = patch.active {
            project.active = active;
        }
        Ok(project.clone())
    }

    async fn list_ready_features(&self, project: ProjectId) -> Result<Vec<Feature>, StoreError> {
        let inner = self.lock();
        let mut ready: Vec<Feature> = inner
            .features
            .values()
            .filter(|f| f.project_id == project && is_ready(f, &inner.features))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(ready)
    }

    async fn get_feature(&self, id: FeatureId) -> Result<Feature, StoreError> {
        self.lock()
            .features
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "feature",
                id: id.to_string(),
            })
    }

    async fn list_features(&self, project: ProjectId) -> Result<Vec<Feature>, StoreError> {
        Ok(self
            .lock()
            .features
            .values()
            .filter(|f| f.project_id == project)
            .cloned()
            .collect())
    }

    async fn create_feature(
        &self,
        project_id: ProjectId,
        name: &str,
        description: &str,
        priority: i32,
        category: &str,
        dependencies: Vec<FeatureId>,
        issue_tracker_ref: Option<String>,
    ) -> Result<Feature, StoreError> {
        let mut inner = self.lock();
        inner.next_feature_id += 1;
        let now = Utc::now();
        let feature = Feature {
            id: FeatureId(inner.next_feature_id),
            project_id,
            name: name.to_string(),
            description: description.to_string(),
            priority,
            category: category.to_string(),
            status: FeatureStatus::Pending,
            dependencies,
            issue_tracker_ref,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
        };
        inner.features.insert(feature.id, feature.clone());
        Ok(feature)
    }

    async fn update_feature(&self, id: FeatureId, patch: FeaturePatch) -> Result<Feature, StoreError> {
        let mut inner = self.lock();
        let feature = inner.features.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "feature",
            id: id.to_string(),
        })?;
        if let Some(name) = patch.name {
            feature.name = name;
        }
        if let Some(description) = patch.description {
            feature.description = description;
        }
        if let Some(priority) = patch.priority {
            feature.priority = priority;
        }
        if let Some(category) = patch.category {
            feature.category = category;
        }
        if let Some(issue_tracker_ref) = patch.issue_tracker_ref {
            feature.issue_tracker_ref = issue_tracker_ref;
        }
        feature.updated_at = Utc::now();
        Ok(feature.clone())
    }

    async fn delete_feature(&self, id: FeatureId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.features.remove(&id).ok_or(StoreError::NotFound {
            kind: "feature",
            id: id.to_string(),
        })?;
        for feature in inner.features.values_mut() {
            feature.dependencies.retain(|dep| *dep != id);
        }
        Ok(())
    }

    async fn add_dependency(&self, feature: FeatureId, dependency: FeatureId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.features.contains_key(&feature) {
            return Err(StoreError::NotFound {
                kind: "feature",
                id: feature.to_string(),
            });
        }
        if !inner.features.contains_key(&dependency) {
            return Err(StoreError::NotFound {
                kind: "feature",
                id: dependency.to_string(),
            });
        }
        if feature == dependency || reaches(&inner.features, dependency, feature) {
            return Err(StoreError::CyclicDependency { feature, dependency });
        }
        let f = inner.features.get_mut(&feature).expect("checked above");
        if !f.dependencies.contains(&dependency) {
            f.dependencies.push(dependency);
            f.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn remove_dependency(&self, feature: FeatureId, dependency: FeatureId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let f = inner.features.get_mut(&feature).ok_or(StoreError::NotFound {
            kind: "feature",
            id: feature.to_string(),
        })?;
        f.dependencies.retain(|dep| *dep != dependency);
        f.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_feature(&self, feature: FeatureId, agent_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let f = inner.features.get_mut(&feature).ok_or(StoreError::NotFound {
            kind: "feature",
            id: feature.to_string(),
        })?;
        if f.status != FeatureStatus::Pending {
            return Err(StoreError::AlreadyClaimed(feature));
        }
        f.status = FeatureStatus::InProgress;
        f.assigned_agent = Some(agent_id.to_string());
        f.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_feature_review_ready(&self, feature: FeatureId) -> Result<(), StoreError> {
        transition(&mut self.lock().features, feature, FeatureStatus::ReviewReady)
    }

    async fn mark_feature_failing(&self, feature: FeatureId) -> Result<(), StoreError> {
        transition(&mut self.lock().features, feature, FeatureStatus::Failing)
    }

    async fn transition_review_ready_to_passing(&self, feature: FeatureId) -> Result<(), StoreError> {
        transition(&mut self.lock().features, feature, FeatureStatus::Passing)
    }

    async fn reset_feature_to_pending(&self, feature: FeatureId) -> Result<(), StoreError> {
        transition(&mut self.lock().features, feature, FeatureStatus::Pending)
    }

    async fn create_agent_run(
        &self,
        project_id: ProjectId,
        feature_id: FeatureId,
        role: AgentRole,
        agent_id: &str,
    ) -> Result<AgentRunId, StoreError> {
        let mut inner = self.lock();
        inner.next_run_id += 1;
        let id = AgentRunId(inner.next_run_id);
        inner.runs.insert(
            id,
            AgentRun {
                id,
                project_id,
                feature_id,
                agent_id: agent_id.to_string(),
                role,
                status: AgentRunStatus::Started,
                started_at: Utc::now(),
                completed_at: None,
                summary: None,
                error_message: None,
            },
        );
        Ok(id)
    }

    async fn get_agent_run(&self, id: AgentRunId) -> Result<AgentRun, StoreError> {
        self.lock().runs.get(&id).cloned().ok_or(StoreError::NotFound {
            kind: "agent_run",
            id: id.to_string(),
        })
    }

    async fn update_agent_status(
        &self,
        run_id: AgentRunId,
        status: AgentRunStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let run = inner.runs.get_mut(&run_id).ok_or(StoreError::NotFound {
            kind: "agent_run",
            id: run_id.to_string(),
        })?;
        if run.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: run.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        run.status = status;
        Ok(())
    }

    async fn complete_agent_run(
        &self,
        run_id: AgentRunId,
        status: AgentRunStatus,
        summary: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Permanent(format!(
                "{} is not a terminal status",
                status.as_str()
            )));
        }
        let mut inner = self.lock();
        let run = inner.runs.get_mut(&run_id).ok_or(StoreError::NotFound {
            kind: "agent_run",
            id: run_id.to_string(),
        })?;
        if run.status.is_terminal() {
            // completeAgentRun is called at most once per run lifetime.
            return Ok(());
        }
        run.status = status;
        run.completed_at = Some(Utc::now());
        run.summary = summary;
        run.error_message = error_message;
        Ok(())
    }

    async fn create_message(
        &self,
        run_id: AgentRunId,
        thread_id: Option<ThreadId>,
        sender: MessageSender,
        message_type: MessageType,
        role: AgentRole,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<AgentMessage, StoreError> {
        let mut inner = self.lock();
        inner.next_message_id += 1;
        let seq = inner.messages.len() as u64;
        let msg = AgentMessage {
            id: inner.next_message_id,
            run_id,
            thread_id,
            sender,
            message_type,
            role,
            content: content.to_string(),
            seq,
            metadata,
        };
        inner.messages.push(msg.clone());
        Ok(msg)
    }

    async fn list_messages(
        &self,
        run_id: AgentRunId,
        since: Option<u64>,
        sender: Option<MessageSender>,
    ) -> Result<Vec<AgentMessage>, StoreError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| m.run_id == run_id)
            .filter(|m| since.map(|s| m.seq > s).unwrap_or(true))
            .filter(|m| sender.map(|s| m.sender == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_messages_by_thread(
        &self,
        thread_id: ThreadId,
        since: Option<u64>,
    ) -> Result<Vec<AgentMessage>, StoreError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| m.thread_id == Some(thread_id))
            .filter(|m| since.map(|s| m.seq > s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_thread(
        &self,
        agent_id: &str,
        project_id: ProjectId,
        title: Option<String>,
        mode: ThreadMode,
    ) -> Result<AgentThread, StoreError> {
        let mut inner = self.lock();
        inner.next_thread_id += 1;
        let id = ThreadId(inner.next_thread_id);
        let now = Utc::now();
        let thread = AgentThread {
            id,
            agent_id: agent_id.to_string(),
            project_id,
            title: title.unwrap_or_default(),
            mode,
            status: ThreadStatus::Active,
            created_at: now,
            updated_at: now,
        };
        inner.threads.insert(id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, agent_id: &str, thread_id: ThreadId) -> Result<AgentThread, StoreError> {
        self.find_thread(agent_id, thread_id)
            .await?
            .ok_or(StoreError::NotFound {
                kind: "thread",
                id: thread_id.to_string(),
            })
    }

    async fn find_thread(
        &self,
        agent_id: &str,
        thread_id: ThreadId,
    ) -> Result<Option<AgentThread>, StoreError> {
        Ok(self
            .lock()
            .threads
            .get(&thread_id)
            .filter(|t| t.agent_id == agent_id)
            .cloned())
    }

    async fn update_thread_status(
        &self,
        thread_id: ThreadId,
        status: ThreadStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let thread = inner.threads.get_mut(&thread_id).ok_or(StoreError::NotFound {
            kind: "thread",
            id: thread_id.to_string(),
        })?;
        thread.status = status;
        thread.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue_job(
        &self,
        agent_id: &str,
        project_id: ProjectId,
        prompt: &str,
        thread_id: Option<ThreadId>,
        queued_by: QueuedBy,
        feature_id: Option<FeatureId>,
    ) -> Result<QueueEntry, StoreError> {
        let mut inner = self.lock();
        inner.next_job_id += 1;
        let job_id = JobId(inner.next_job_id);
        let queue = inner.queues.entry(agent_id.to_string()).or_default();
        let position = queue
            .iter()
            .map(|e| e.position)
            .max()
            .map(|p| p + QUEUE_POSITION_STEP)
            .unwrap_or(QUEUE_POSITION_STEP);
        let entry = QueueEntry {
            agent_id: agent_id.to_string(),
            job_id,
            project_id,
            prompt: prompt.to_string(),
            thread_id,
            queued_by,
            status: JobStatus::Queued,
            position,
            queued_at: Utc::now(),
            feature_id,
        };
        queue.push(entry.clone());
        Ok(entry)
    }

    async fn dequeue_job(&self, agent_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(agent_id) else {
            return Ok(None);
        };
        let next = queue
            .iter_mut()
            .filter(|e| e.status == JobStatus::Queued)
            .min_by_key(|e| e.position);
        match next {
            Some(entry) => {
                entry.status = JobStatus::Processing;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn peek_job(&self, agent_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self
            .lock()
            .queues
            .get(agent_id)
            .and_then(|q| q.iter().filter(|e| e.status == JobStatus::Queued).min_by_key(|e| e.position))
            .cloned())
    }

    async fn remove_job(&self, agent_id: &str, job_id: JobId) -> Result<(), StoreError> {
        if let Some(queue) = self.lock().queues.get_mut(agent_id) {
            queue.retain(|e| e.job_id != job_id);
        }
        Ok(())
    }

    async fn reorder_job(
        &self,
        agent_id: &str,
        job_id: JobId,
        new_position: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let queue = inner.queues.get_mut(agent_id).ok_or(StoreError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })?;
        let entry = queue
            .iter_mut()
            .find(|e| e.job_id == job_id)
            .ok_or(StoreError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        entry.position = new_position;
        Ok(())
    }

    async fn list_queue(&self, agent_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let mut entries = self.lock().queues.get(agent_id).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.position);
        Ok(entries)
    }

    async fn mark_job_completed(&self, agent_id: &str, job_id: JobId) -> Result<(), StoreError> {
        set_job_status(&mut self.lock(), agent_id, job_id, JobStatus::Completed)
    }

    async fn mark_job_failed(
        &self,
        agent_id: &str,
        job_id: JobId,
        _message: &str,
    ) -> Result<(), StoreError> {
        set_job_status(&mut self.lock(), agent_id, job_id, JobStatus::Failed)
    }
}

/// Whether `target` is reachable from `start` by following dependency
/// edges — used to reject an `add_dependency` call that would close a cycle.
fn reaches(features: &HashMap<FeatureId, Feature>, start: FeatureId, target: FeatureId) -> bool {
    let mut stack = vec![start];
    let mut seen = std::collections::HashSet::new();
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(feature) = features.get(&current) {
            stack.extend(feature.dependencies.iter().copied());
        }
    }
    false
}

fn transition(
    features: &mut HashMap<FeatureId, Feature>,
    feature_id: FeatureId,
    target: FeatureStatus,
) -> Result<(), StoreError> {
    let feature = features.get_mut(&feature_id).ok_or(StoreError::NotFound {
        kind: "feature",
        id: feature_id.to_string(),
    })?;
    if !feature.status.can_transition_to(target) {
        return Err(StoreError::InvalidTransition {
            from: feature.status.as_str().to_string(),
            to: target.as_str().to_string(),
        });
    }
    feature.status = target;
    feature.updated_at = Utc::now();
    Ok(())
}

fn set_job_status(
    inner: &mut Inner,
    agent_id: &str,
    job_id: JobId,
    status: JobStatus,
) -> Result<(), StoreError> {
    let queue = inner.queues.get_mut(agent_id).ok_or(StoreError::NotFound {
        kind: "job",
        id: job_id.to_string(),
    })?;
    let entry = queue
        .iter_mut()
        .find(|e| e.job_id == job_id)
        .ok_or(StoreError::NotFound {
            kind: "job",
            id: job_id.to_string(),
        })?;
    entry.status = status;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_feature(id: i64, project: ProjectId, deps: Vec<FeatureId>) -> Feature {
        let now = Utc::now();
        Feature {
            id: FeatureId(id),
            project_id: project,
            name: format!("feature-{id}"),
            description: String::new(),
            priority: 1,
            category: "general".into(),
            status: FeatureStatus::Pending,
            dependencies: deps,
            issue_tracker_ref: None,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn ready_features_exclude_unsatisfied_dependencies() {
        let store = MemoryStore::new();
        let project = ProjectId(1);
        let mut dep = sample_feature(1, project, vec![]);
        dep.status = FeatureStatus::InProgress;
        store.seed_feature(dep);
        store.seed_feature(sample_feature(2, project, vec![FeatureId(1)]));

        let ready = store.list_ready_features(project).await.unwrap();
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn ready_features_include_satisfied_dependencies() {
        let store = MemoryStore::new();
        let project = ProjectId(1);
        let mut dep = sample_feature(1, project, vec![]);
        dep.status = FeatureStatus::Passing;
        store.seed_feature(dep);
        store.seed_feature(sample_feature(2, project, vec![FeatureId(1)]));

        let ready = store.list_ready_features(project).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, FeatureId(2));
    }

    #[tokio::test]
    async fn claim_feature_is_a_one_shot_cas() {
        let store = MemoryStore::new();
        let project = ProjectId(1);
        store.seed_feature(sample_feature(1, project, vec![]));

        store.claim_feature(FeatureId(1), "agent-a").await.unwrap();
        let err = store.claim_feature(FeatureId(1), "agent-b").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyClaimed(_)));
    }

    #[tokio::test]
    async fn feature_transition_rejects_non_dag_moves() {
        let store = MemoryStore::new();
        store.seed_feature(sample_feature(1, ProjectId(1), vec![]));
        let err = store
            .transition_review_ready_to_passing(FeatureId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn complete_agent_run_is_idempotent() {
        let store = MemoryStore::new();
        let run_id = store
            .create_agent_run(ProjectId(1), FeatureId(1), AgentRole::Coder, "agent-a")
            .await
            .unwrap();
        store
            .complete_agent_run(run_id, AgentRunStatus::Completed, Some("ok".into()), None)
            .await
            .unwrap();
        // A second terminal write must not overwrite the first.
        store
            .complete_agent_run(run_id, AgentRunStatus::Failed, None, Some("late".into()))
            .await
            .unwrap();
        let run = store.get_agent_run(run_id).await.unwrap();
        assert_eq!(run.status, AgentRunStatus::Completed);
        assert_eq!(run.summary.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn queue_dequeues_in_strictly_increasing_position_order() {
        let store = MemoryStore::new();
        let agent = "coder";
        for prompt in ["p1", "p2", "p3"] {
            store
                .enqueue_job(agent, ProjectId(1), prompt, None, QueuedBy::Auto, None)
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        while let Some(entry) = store.dequeue_job(agent).await.unwrap() {
            seen.push(entry.prompt);
        }
        assert_eq!(seen, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn create_and_update_project_round_trip() {
        let store = MemoryStore::new();
        let project = store
            .create_project("demo", Some("https://example.invalid/repo.git".into()), "main", 2, None)
            .await
            .unwrap();
        assert_eq!(project.name, "demo");

        let updated = store
            .update_project(
                project.id,
                ProjectPatch {
                    concurrency_cap: Some(5),
                    repo_url: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.concurrency_cap, 5);
        assert_eq!(updated.repo_url, None);
        assert_eq!(updated.default_branch, "main");
    }

    #[tokio::test]
    async fn create_update_and_delete_feature_round_trip() {
        let store = MemoryStore::new();
        let feature = store
            .create_feature(ProjectId(1), "widget", "does widget things", 1, "general", vec![], None)
            .await
            .unwrap();
        assert_eq!(feature.status, FeatureStatus::Pending);

        let updated = store
            .update_feature(
                feature.id,
                FeaturePatch {
                    priority: Some(9),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, 9);

        store.delete_feature(feature.id).await.unwrap();
        let err = store.get_feature(feature.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn add_dependency_rejects_cycles() {
        let store = MemoryStore::new();
        let a = store
            .create_feature(ProjectId(1), "a", "", 1, "general", vec![], None)
            .await
            .unwrap();
        let b = store
            .create_feature(ProjectId(1), "b", "", 1, "general", vec![], None)
            .await
            .unwrap();
        store.add_dependency(b.id, a.id).await.unwrap();

        let err = store.add_dependency(a.id, b.id).await.unwrap_err();
        assert!(matches!(err, StoreError::CyclicDependency { .. }));

        let err = store.add_dependency(a.id, a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::CyclicDependency { .. }));
    }

    #[tokio::test]
    async fn remove_dependency_is_idempotent() {
        let store = MemoryStore::new();
        let a = store
            .create_feature(ProjectId(1), "a", "", 1, "general", vec![], None)
            .await
            .unwrap();
        let b = store
            .create_feature(ProjectId(1), "b", "", 1, "general", vec![a.id], None)
            .await
            .unwrap();
        store.remove_dependency(b.id, a.id).await.unwrap();
        let reloaded = store.get_feature(b.id).await.unwrap();
        assert!(reloaded.dependencies.is_empty());
        // Removing again is a no-op, not an error.
        store.remove_dependency(b.id, a.id).await.unwrap();
    }

    #[tokio::test]
    async fn queue_positions_use_sparse_1024_steps() {
        let store = MemoryStore::new();
        let a = store
            .enqueue_job("coder", ProjectId(1), "p1", None, QueuedBy::Auto, None)
            .await
            .unwrap();
        let b = store
            .enqueue_job("coder", ProjectId(1), "p2", None, QueuedBy::Auto, None)
            .await
            .unwrap();
        assert_eq!(a.position, 1024);
        assert_eq!(b.position, 2048);
    }
}
