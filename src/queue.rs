//! Queue Manager — per-agent FIFO queue of ad-hoc prompts with auto-drain
//! on idle (§4.I). Thin pass-throughs to the Store for everything but the
//! "is this agent idle, should we fire `processNext`" decision, which is
//! the one piece of logic this component actually owns.

use std::sync::Arc;
use std::sync::OnceLock;

use tracing::{error, info, warn};

use crate::errors::StoreError;
use crate::ids::{FeatureId, JobId, ProjectId, ThreadId};
use crate::store::types::{QueueEntry, QueuedBy, ThreadMode};
use crate::store::Store;
use crate::work_session::WorkSessionManager;

/// Wired to the [`WorkSessionManager`] after both are constructed, since
/// each depends on the other (§9 cyclic coupling note): the Queue Manager
/// calls `startSession` to drain a job, the Work-Session Manager calls
/// `processNext` when a session ends.
pub struct QueueManager {
    store: Arc<dyn Store>,
    work_sessions: OnceLock<Arc<WorkSessionManager>>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            work_sessions: OnceLock::new(),
        })
    }

    /// One-shot setter. Panics if called twice — a construction bug, not a
    /// runtime condition.
    pub fn attach_work_sessions(&self, work_sessions: Arc<WorkSessionManager>) {
        self.work_sessions
            .set(work_sessions)
            .unwrap_or_else(|_| panic!("QueueManager::attach_work_sessions called twice"));
    }

    fn work_sessions(&self) -> &Arc<WorkSessionManager> {
        self.work_sessions
            .get()
            .expect("QueueManager used before attach_work_sessions")
    }

    /// `true` if the agent has no active work session and can be handed the
    /// next queued job directly.
    pub fn is_idle(&self, agent_id: &str) -> bool {
        self.work_sessions().list_sessions(agent_id).is_empty()
    }

    pub async fn enqueue(
        self: &Arc<Self>,
        agent_id: &str,
        project_id: ProjectId,
        prompt: &str,
        thread_id: Option<ThreadId>,
        queued_by: QueuedBy,
        feature_id: Option<FeatureId>,
    ) -> Result<QueueEntry, StoreError> {
        let entry = self
            .store
            .enqueue_job(agent_id, project_id, prompt, thread_id, queued_by, feature_id)
            .await?;

        if self.is_idle(agent_id) {
            let this = self.clone();
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                this.process_next(&agent_id).await;
            });
        }

        Ok(entry)
    }

    pub async fn dequeue(&self, agent_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        self.store.dequeue_job(agent_id).await
    }

    pub async fn peek(&self, agent_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        self.store.peek_job(agent_id).await
    }

    pub async fn remove(&self, agent_id: &str, job_id: JobId) -> Result<(), StoreError> {
        self.store.remove_job(agent_id, job_id).await
    }

    pub async fn reorder(&self, agent_id: &str, job_id: JobId, new_position: i64) -> Result<(), StoreError> {
        self.store.reorder_job(agent_id, job_id, new_position).await
    }

    pub async fn list_queue(&self, agent_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
        self.store.list_queue(agent_id).await
    }

    pub async fn queue_depth(&self, agent_id: &str) -> Result<usize, StoreError> {
        Ok(self.store.list_queue(agent_id).await?.len())
    }

    /// Drain the next queued job for `agent_id`, if any. Called on enqueue
    /// into an idle agent and on work-session end (§4.I, §4.H).
    pub async fn process_next(self: &Arc<Self>, agent_id: &str) {
        let entry = match self.dequeue(agent_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "queue", agent = agent_id, error = %e, "failed to dequeue, aborting drain");
                return;
            }
        };

        let thread_id = match entry.thread_id {
            Some(id) => id,
            None => match self
                .store
                .create_thread(agent_id, entry.project_id, Some(title_from_prompt(&entry.prompt)), ThreadMode::Work)
                .await
            {
                Ok(thread) => thread.id,
                Err(e) => {
                    error!(target: "queue", agent = agent_id, job = %entry.job_id, error = %e, "failed to create thread for queued job");
                    let _ = self
                        .store
                        .mark_job_failed(agent_id, entry.job_id, &format!("thread creation failed: {e}"))
                        .await;
                    return;
                }
            },
        };

        let project = match self.store.get_project(entry.project_id).await {
            Ok(p) => p,
            Err(e) => {
                error!(target: "queue", agent = agent_id, job = %entry.job_id, error = %e, "project lookup failed for queued job");
                let _ = self
                    .store
                    .mark_job_failed(agent_id, entry.job_id, &format!("project lookup failed: {e}"))
                    .await;
                return;
            }
        };

        let result = self
            .work_sessions()
            .start_session(agent_id, project.id, thread_id, &entry.prompt)
            .await;

        match result {
            Ok(_) => {
                info!(target: "queue", agent = agent_id, job = %entry.job_id, "queued job dispatched to a work session");
                if let Err(e) = self.store.mark_job_completed(agent_id, entry.job_id).await {
                    warn!(target: "queue", agent = agent_id, job = %entry.job_id, error = %e, "failed to mark job completed");
                }
            }
            Err(e) => {
                warn!(target: "queue", agent = agent_id, job = %entry.job_id, error = %e, "work session failed to start for queued job");
                let _ = self
                    .store
                    .mark_job_failed(agent_id, entry.job_id, &e.to_string())
                    .await;
            }
        }
    }
}

fn title_from_prompt(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt);
    if first_line.len() > 60 {
        format!("{}...", &first_line[..57])
    } else {
        first_line.to_string()
    }
}
