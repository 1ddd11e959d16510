//! Work-Session Manager — long-lived interactive worker lifecycle (§4.H).
//! Unlike a pipeline stage, a work session is not tied to a feature; it is a
//! standing conversation between a human and one agent identity, multiplexed
//! over the same [`crate::driver::WorkerDriver`]/[`crate::bus::StreamBus`]
//! contracts the Pipeline Engine uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::bus::{BusEvent, StreamBus};
use crate::driver::{LaunchHandle, WorkerDriver, WorkerSpec};
use crate::errors::{DriverError, StoreError};
use crate::ids::{AgentRunId, FeatureId, ProjectId, ThreadId};
use crate::queue::QueueManager;
use crate::store::types::{AgentRole, AgentRunStatus, MessageSender, MessageType};
use crate::store::Store;

/// Interactive work sessions are not attached to any feature; this sentinel
/// distinguishes them in the `AgentRun` table without widening the Store
/// contract's `feature_id` to `Option<FeatureId>` for every other caller.
pub const NO_FEATURE: FeatureId = FeatureId(0);

/// Longest stdout line the decoder accepts before treating it as malformed
/// rather than buffering it unbounded (§9).
const MAX_LINE_LEN: usize = 64 * 1024;

const WATCH_INTERVAL: Duration = Duration::from_millis(500);
const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum WorkSessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("no active work session for run {0}")]
    NotFound(AgentRunId),
}

impl From<WorkSessionError> for crate::errors::ApiError {
    fn from(err: WorkSessionError) -> Self {
        match err {
            WorkSessionError::Store(e) => e.into(),
            WorkSessionError::Driver(e) => crate::errors::ApiError::Internal(e.to_string()),
            WorkSessionError::NotFound(id) => {
                crate::errors::ApiError::NotFound(format!("work session for run {id} not found"))
            }
        }
    }
}

/// Public, read-only view of an active session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkSession {
    pub run_id: AgentRunId,
    pub agent_id: String,
    pub project_id: ProjectId,
    pub thread_id: ThreadId,
    pub started_at: DateTime<Utc>,
}

struct SessionEntry {
    session: WorkSession,
    handle: LaunchHandle,
    last_activity: Arc<std::sync::Mutex<Instant>>,
    ending: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<AgentRunId, SessionEntry>,
    by_key: HashMap<(String, ThreadId), AgentRunId>,
}

/// Owns every active [`WorkSession`] and the background tasks watching them.
pub struct WorkSessionManager {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkerDriver>,
    bus: StreamBus,
    queue: Arc<QueueManager>,
    inner: tokio::sync::Mutex<Inner>,
    inactivity_timeout: Duration,
}

impl WorkSessionManager {
    pub fn new(store: Arc<dyn Store>, driver: Arc<dyn WorkerDriver>, bus: StreamBus, queue: Arc<QueueManager>) -> Arc<Self> {
        Arc::new(Self {
            store,
            driver,
            bus,
            queue,
            inner: tokio::sync::Mutex::new(Inner::default()),
            inactivity_timeout: Duration::from_secs(30 * 60),
        })
    }

    pub fn with_inactivity_timeout(mut self: Arc<Self>, timeout: Duration) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_inactivity_timeout must be called before sharing the manager")
            .inactivity_timeout = timeout;
        self
    }

    /// Active sessions for one agent identity — "idle" per §4.I is exactly
    /// this list being empty.
    pub fn list_sessions(&self, agent_id: &str) -> Vec<WorkSession> {
        // `try_lock` is safe here: the lock is never held across an await
        // except inside `start_session`/`end_session`, neither of which
        // blocks indefinitely, and a momentary busy manager reporting "not
        // idle" is the conservative (safe) answer for the Queue Manager.
        match self.inner.try_lock() {
            Ok(inner) => inner
                .sessions
                .values()
                .filter(|e| e.session.agent_id == agent_id)
                .map(|e| e.session.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Start (or reuse) an interactive session for `(agent_id, thread_id)`.
    /// Concurrent calls for the same key are serialized by `inner`'s lock so
    /// at most one worker is ever spawned for a given thread (property 12).
    pub async fn start_session(
        self: &Arc<Self>,
        agent_id: &str,
        project_id: ProjectId,
        thread_id: ThreadId,
        prompt: &str,
    ) -> Result<AgentRunId, WorkSessionError> {
        let mut inner = self.inner.lock().await;
        if let Some(&run_id) = inner.by_key.get(&(agent_id.to_string(), thread_id)) {
            return Ok(run_id);
        }

        let run_id = self
            .store
            .create_agent_run(project_id, NO_FEATURE, AgentRole::Coder, agent_id)
            .await?;

        let project = self.store.get_project(project_id).await?;
        let spec = WorkerSpec {
            role: AgentRole::Coder,
            repo_url: project.repo_url.unwrap_or_default(),
            feature_id: NO_FEATURE,
            project_id,
            feature_name: format!("work-session-{thread_id}"),
            feature_description: prompt.to_string(),
            base_branch: project.default_branch,
            argv_extra: vec!["--interactive".to_string()],
            access_token: None,
        };

        let handle = match self.driver.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self
                    .store
                    .complete_agent_run(
                        run_id,
                        AgentRunStatus::Failed,
                        None,
                        Some(format!("Launch failure: {e}")),
                    )
                    .await;
                return Err(e.into());
            }
        };

        self.bus.emit(&run_id.to_string(), BusEvent::ThinkingStart);

        let session = WorkSession {
            run_id,
            agent_id: agent_id.to_string(),
            project_id,
            thread_id,
            started_at: Utc::now(),
        };
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));
        let ending = Arc::new(AtomicBool::new(false));
        inner.sessions.insert(
            run_id,
            SessionEntry {
                session: session.clone(),
                handle: handle.clone(),
                last_activity: last_activity.clone(),
                ending: ending.clone(),
            },
        );
        inner.by_key.insert((agent_id.to_string(), thread_id), run_id);
        drop(inner);

        let this = self.clone();
        let agent_id_owned = agent_id.to_string();
        tokio::spawn(async move {
            this.watch(run_id, agent_id_owned, handle, last_activity, ending).await;
        });

        Ok(run_id)
    }

    /// Write `text` to the session's worker stdin and reset its inactivity
    /// clock. Fails if no session is active for `run_id`.
    pub async fn send_message(&self, run_id: AgentRunId, text: &str) -> Result<(), WorkSessionError> {
        let (handle, last_activity) = {
            let inner = self.inner.lock().await;
            let entry = inner.sessions.get(&run_id).ok_or(WorkSessionError::NotFound(run_id))?;
            (entry.handle.clone(), entry.last_activity.clone())
        };
        self.driver.send_input(&handle, text).await?;
        *last_activity.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
        Ok(())
    }

    /// Gracefully end a session: ask the worker to exit, wait briefly, force
    /// terminate if still alive, finalize the run as `completed`, then give
    /// the agent's queue a chance to drain (§4.I property 10).
    pub async fn end_session(&self, run_id: AgentRunId) -> Result<(), WorkSessionError> {
        let agent_id = self.end_session_inner(run_id).await?;
        self.queue.process_next(&agent_id).await;
        Ok(())
    }

    async fn end_session_inner(&self, run_id: AgentRunId) -> Result<String, WorkSessionError> {
        let entry = {
            let mut inner = self.inner.lock().await;
            inner.sessions.remove(&run_id)
        };
        let Some(entry) = entry else {
            return Err(WorkSessionError::NotFound(run_id));
        };
        entry.ending.store(true, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().await;
            inner.by_key.remove(&(entry.session.agent_id.clone(), entry.session.thread_id));
        }

        let _ = self.driver.send_input(&entry.handle, "/exit").await;
        let deadline = Instant::now() + GRACEFUL_SHUTDOWN_GRACE;
        loop {
            match self.driver.poll(&entry.handle).await {
                Ok(state) if state.is_terminal() => break,
                _ if Instant::now() >= deadline => {
                    let _ = self.driver.terminate(&entry.handle, "graceful shutdown timed out").await;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        let _ = self
            .store
            .complete_agent_run(run_id, AgentRunStatus::Completed, None, None)
            .await;
        self.bus.emit(&run_id.to_string(), BusEvent::ThinkingEnd);
        info!(target: "work_session", run = %run_id, "session ended");
        Ok(entry.session.agent_id)
    }

    /// End every active session, best-effort and concurrently — used on
    /// process shutdown (§5). Does not drain queues: a shutdown is not the
    /// moment to dispatch fresh work sessions that would outlive it.
    pub async fn cleanup(&self) {
        let run_ids: Vec<AgentRunId> = {
            let inner = self.inner.lock().await;
            inner.sessions.keys().copied().collect()
        };
        let mut handles = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            handles.push(self.end_session_inner(run_id));
        }
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(target: "work_session", error = %e, "error ending session during cleanup");
            }
        }
    }

    async fn watch(
        self: Arc<Self>,
        run_id: AgentRunId,
        agent_id: String,
        handle: LaunchHandle,
        last_activity: Arc<std::sync::Mutex<Instant>>,
        ending: Arc<AtomicBool>,
    ) {
        let topic = run_id.to_string();
        loop {
            tokio::time::sleep(WATCH_INTERVAL).await;
            if ending.load(Ordering::SeqCst) {
                return;
            }

            let elapsed = last_activity.lock().unwrap_or_else(|p| p.into_inner()).elapsed();
            if elapsed > self.inactivity_timeout {
                warn!(target: "work_session", run = %run_id, "session inactive, terminating");
                let _ = self.driver.terminate(&handle, "inactivity timeout").await;
                let _ = self
                    .store
                    .complete_agent_run(run_id, AgentRunStatus::Completed, None, Some("timed out".to_string()))
                    .await;
                self.bus
                    .emit(&topic, BusEvent::StreamError("Session timed out".to_string()));
                self.forget(run_id).await;
                self.queue.process_next(&agent_id).await;
                return;
            }

            match self.driver.drain_output(&handle).await {
                Ok(lines) => {
                    for line in lines {
                        for event in decode_line(&line, MAX_LINE_LEN) {
                            if let BusEvent::Token(text) = &event {
                                let _ = self
                                    .store
                                    .create_message(
                                        run_id,
                                        None,
                                        MessageSender::Agent,
                                        MessageType::Message,
                                        AgentRole::Coder,
                                        text,
                                        None,
                                    )
                                    .await;
                            }
                            self.bus.emit(&topic, event);
                        }
                    }
                }
                Err(DriverError::NotFound) => {
                    warn!(target: "work_session", run = %run_id, "worker disappeared, finalizing as failed");
                    self.fail_abnormally(run_id, &agent_id, &topic, "worker not found").await;
                    return;
                }
                Err(e) => {
                    warn!(target: "work_session", run = %run_id, error = %e, "drain_output failed");
                }
            }

            match self.driver.poll(&handle).await {
                Ok(state) if state.is_terminal() => {
                    let exit_code = match state {
                        crate::driver::WorkerState::Completed { exit_code } => Some(exit_code),
                        crate::driver::WorkerState::Failed { exit_code } => exit_code,
                        _ => None,
                    };
                    if matches!(exit_code, Some(0)) {
                        let _ = self
                            .store
                            .complete_agent_run(run_id, AgentRunStatus::Completed, None, None)
                            .await;
                        self.bus.emit(&topic, BusEvent::ThinkingEnd);
                        self.forget(run_id).await;
                    } else {
                        self.fail_abnormally(run_id, &agent_id, &topic, "worker exited abnormally").await;
                    }
                    self.queue.process_next(&agent_id).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(target: "work_session", run = %run_id, error = %e, "poll failed"),
            }
        }
    }

    async fn fail_abnormally(&self, run_id: AgentRunId, agent_id: &str, topic: &str, reason: &str) {
        let _ = self
            .store
            .complete_agent_run(run_id, AgentRunStatus::Failed, None, Some(reason.to_string()))
            .await;
        self.bus.emit(topic, BusEvent::StreamError(reason.to_string()));
        self.forget(run_id).await;
        let _ = agent_id;
    }

    async fn forget(&self, run_id: AgentRunId) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.sessions.remove(&run_id) {
            inner.by_key.remove(&(entry.session.agent_id, entry.session.thread_id));
        }
    }
}

/// Decode one line of the interactive worker's stdout into zero or more
/// Stream Bus events (§4.H, §4.H.1). Any line over `max_line_len` or that
/// fails to parse as JSON is treated as malformed and skipped silently.
fn decode_line(raw: &str, max_line_len: usize) -> Vec<BusEvent> {
    if raw.len() > max_line_len {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "assistant" => {
            if let Some(subtype) = value.get("subtype").and_then(Value::as_str) {
                match subtype {
                    "start" => return vec![BusEvent::ThinkingStart],
                    "end" => return vec![BusEvent::ThinkingEnd],
                    _ => {}
                }
            }
            value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| blocks.iter().filter_map(content_block_event).collect())
                .unwrap_or_default()
        }
        "content_block_delta" => {
            if value.pointer("/delta/type").and_then(Value::as_str) == Some("text_delta")
                && let Some(text) = value.pointer("/delta/text").and_then(Value::as_str)
            {
                vec![BusEvent::Token(text.to_string())]
            } else {
                Vec::new()
            }
        }
        "tool_use" => {
            let name = value.get("name").and_then(Value::as_str).unwrap_or("");
            let input = value.get("input").cloned().unwrap_or(Value::Null);
            vec![BusEvent::Token(crate::stream::describe_tool_use(name, &input))]
        }
        "result" => {
            let mut events = Vec::new();
            if let Some(result) = value.get("result").and_then(Value::as_str) {
                events.push(BusEvent::Token(result.to_string()));
            }
            events.push(BusEvent::ThinkingEnd);
            events
        }
        _ => Vec::new(),
    }
}

fn content_block_event(block: &Value) -> Option<BusEvent> {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => block
            .get("text")
            .and_then(Value::as_str)
            .map(|t| BusEvent::Token(t.to_string())),
        Some("tool_use") => {
            let name = block.get("name").and_then(Value::as_str).unwrap_or("");
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            Some(BusEvent::Token(crate::stream::describe_tool_use(name, &input)))
        }
        _ => None,
    }
}
