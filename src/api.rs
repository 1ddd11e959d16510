//! HTTP control-plane surface — a thin `axum` binding over the components
//! in the rest of this crate (§4.K). Routing, `AppState`, and the
//! `ApiError -> (StatusCode, Json)` mapping follow the reference codebase's
//! `factory::api`/`factory::server` split: one handler per route, a
//! `Router<SharedState>` builder, and a top-level `build_router`/
//! `start_server` pair using `axum::serve` with `with_graceful_shutdown`.
//! This module contains no orchestration logic of its own — every handler
//! is a direct call into the Store, Concurrency Manager, Queue Manager,
//! Work-Session Manager, or Pipeline Engine.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::bus::{BusEvent, StreamBus};
use crate::concurrency::ConcurrencyManager;
use crate::credentials::CredentialProvider;
use crate::driver::WorkerDriver;
use crate::errors::ApiError;
use crate::ids::{AgentRunId, FeatureId, JobId, ProjectId, ThreadId};
use crate::monitor::MonitorConfig;
use crate::pipeline::{PipelineConfig, PipelineEngine, PipelineLimits};
use crate::queue::QueueManager;
use crate::store::types::{
    AgentMessage, AgentRun, Feature, FeatureStatus, MessageSender, MessageType, Project,
    QueueEntry, QueuedBy, ThreadMode,
};
use crate::store::{FeaturePatch, ProjectPatch, Store};
use crate::watcher::SlotGuard;
use crate::work_session::{WorkSession, WorkSessionManager};

/// Shared state handed to every handler. Built once in the binary's `serve`
/// entry point and cloned (cheaply — everything inside is an `Arc`) into
/// the router.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub driver: Arc<dyn WorkerDriver>,
    pub bus: StreamBus,
    pub concurrency: Arc<ConcurrencyManager>,
    pub queue: Arc<QueueManager>,
    pub work_sessions: Arc<WorkSessionManager>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub limits: PipelineLimits,
    pub monitor: MonitorConfig,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

/// A `serde` helper that distinguishes "field absent" from "field present
/// with value `null`" for patch bodies using the outer/inner `Option`
/// convention `ProjectPatch`/`FeaturePatch` already use.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

// ── Router ──────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).patch(update_project))
        .route(
            "/api/projects/{id}/features",
            get(list_features).post(create_feature),
        )
        .route("/api/projects/{id}/features/bulk", post(bulk_create_features))
        .route(
            "/api/features/{id}",
            patch(update_feature).delete(delete_feature),
        )
        .route("/api/features/{id}/dependencies", post(add_dependency))
        .route(
            "/api/features/{id}/dependencies/{dep_id}",
            delete(remove_dependency),
        )
        .route("/api/features/{id}/assign", post(assign_feature))
        .route(
            "/api/agents/{name}/work-sessions",
            get(list_work_sessions).post(create_work_session),
        )
        .route("/api/work-sessions/{id}", delete(end_work_session))
        .route(
            "/api/agent-runs/{id}/messages",
            get(list_messages).post(post_message),
        )
        .route("/api/agent-runs/{id}/messages/stream", get(stream_messages))
        .route(
            "/api/agents/{name}/queue",
            get(list_queue).post(enqueue_job),
        )
        .route("/api/agents/{name}/queue/{job_id}", delete(remove_queue_job))
        .route("/api/agent-runs/{id}/create-pr", post(create_pr))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve forever, honoring `SIGTERM`/`SIGINT` for graceful
/// shutdown (§5). The caller is responsible for stopping the Watcher and
/// draining work sessions after this future resolves.
pub async fn start_server(bind_address: &str, state: SharedState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    let local_addr = listener.local_addr()?;
    info!(target: "api", addr = %local_addr, "control-plane HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target: "api", "shutdown signal received");
}

// ── Health ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    timestamp: chrono::DateTime<Utc>,
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}

// ── Projects ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    repo_url: Option<String>,
    #[serde(default = "default_branch")]
    default_branch: String,
    #[serde(default = "default_concurrency_cap")]
    concurrency_cap: u32,
    issue_tracker_ref: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_concurrency_cap() -> u32 {
    1
}

async fn list_projects(State(state): State<SharedState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.store.list_active_projects().await?))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .store
        .create_project(
            &req.name,
            req.repo_url,
            &req.default_branch,
            req.concurrency_cap,
            req.issue_tracker_ref,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.store.get_project(id).await?))
}

#[derive(Deserialize, Default)]
struct UpdateProjectRequest {
    #[serde(default, deserialize_with = "deserialize_some")]
    repo_url: Option<Option<String>>,
    default_branch: Option<String>,
    concurrency_cap: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_some")]
    issue_tracker_ref: Option<Option<String>>,
    active: Option<bool>,
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<ProjectId>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let patch = ProjectPatch {
        repo_url: req.repo_url,
        default_branch: req.default_branch,
        concurrency_cap: req.concurrency_cap,
        issue_tracker_ref: req.issue_tracker_ref,
        active: req.active,
    };
    Ok(Json(state.store.update_project(id, patch).await?))
}

// ── Features ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateFeatureRequest {
    name: String,
    description: String,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    dependencies: Vec<FeatureId>,
    issue_tracker_ref: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

async fn list_features(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<Vec<Feature>>, ApiError> {
    Ok(Json(state.store.list_features(project_id).await?))
}

async fn create_feature(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
    Json(req): Json<CreateFeatureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let feature = state
        .store
        .create_feature(
            project_id,
            &req.name,
            &req.description,
            req.priority,
            &req.category,
            req.dependencies,
            req.issue_tracker_ref,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(feature)))
}

#[derive(Deserialize)]
struct BulkCreateFeaturesRequest {
    features: Vec<CreateFeatureRequest>,
}

async fn bulk_create_features(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
    Json(req): Json<BulkCreateFeaturesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut created = Vec::with_capacity(req.features.len());
    for f in req.features {
        let feature = state
            .store
            .create_feature(
                project_id,
                &f.name,
                &f.description,
                f.priority,
                &f.category,
                f.dependencies,
                f.issue_tracker_ref,
            )
            .await?;
        created.push(feature);
    }
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Deserialize, Default)]
struct UpdateFeatureRequest {
    name: Option<String>,
    description: Option<String>,
    priority: Option<i32>,
    category: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    issue_tracker_ref: Option<Option<String>>,
}

async fn update_feature(
    State(state): State<SharedState>,
    Path(id): Path<FeatureId>,
    Json(req): Json<UpdateFeatureRequest>,
) -> Result<Json<Feature>, ApiError> {
    let patch = FeaturePatch {
        name: req.name,
        description: req.description,
        priority: req.priority,
        category: req.category,
        issue_tracker_ref: req.issue_tracker_ref,
    };
    Ok(Json(state.store.update_feature(id, patch).await?))
}

async fn delete_feature(
    State(state): State<SharedState>,
    Path(id): Path<FeatureId>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_feature(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AddDependencyRequest {
    dependency_id: FeatureId,
}

async fn add_dependency(
    State(state): State<SharedState>,
    Path(id): Path<FeatureId>,
    Json(req): Json<AddDependencyRequest>,
) -> Result<StatusCode, ApiError> {
    state.store.add_dependency(id, req.dependency_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_dependency(
    State(state): State<SharedState>,
    Path((id, dep_id)): Path<(FeatureId, FeatureId)>,
) -> Result<StatusCode, ApiError> {
    state.store.remove_dependency(id, dep_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Manual assignment ────────────────────────────────────────────────

#[derive(Deserialize)]
struct AssignFeatureRequest {
    agent_name: String,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AssignOutcome {
    Dispatched { feature_id: FeatureId },
    Queued { job_id: JobId, position: i64 },
}

/// Pre-flight per §6: project must have a repo configured, the feature
/// must be `pending`, and the concurrency cap must not be exceeded — if it
/// would be, the assignment is queued via the Queue Manager instead of
/// rejected outright.
async fn assign_feature(
    State(state): State<SharedState>,
    Path(id): Path<FeatureId>,
    Json(req): Json<AssignFeatureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let feature = state.store.get_feature(id).await?;
    let project = state.store.get_project(feature.project_id).await?;

    if project.repo_url.is_none() {
        return Err(ApiError::BadRequest(format!(
            "project {} has no repo configured",
            project.id
        )));
    }
    if feature.status != FeatureStatus::Pending {
        return Err(ApiError::Conflict(format!("feature {id} is not pending")));
    }

    if !state.concurrency.can_start(project.id, project.concurrency_cap) {
        let entry = state
            .queue
            .enqueue(
                &req.agent_name,
                project.id,
                &feature.description,
                None,
                QueuedBy::User,
                Some(id),
            )
            .await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(AssignOutcome::Queued {
                job_id: entry.job_id,
                position: entry.position,
            }),
        ));
    }

    state
        .concurrency
        .acquire(project.id, id)
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    if let Err(e) = state.store.claim_feature(id, &req.agent_name).await {
        state.concurrency.release(project.id, id);
        return Err(e.into());
    }

    let pipeline_config = PipelineConfig {
        project_id: project.id,
        feature_id: id,
        repo_url: project.repo_url.clone().unwrap_or_default(),
        feature_name: feature.name.clone(),
        feature_description: feature.description.clone(),
        base_branch: project.default_branch.clone(),
        limits: state.limits,
        monitor: state.monitor,
        external_issue_id: feature.issue_tracker_ref.clone(),
        issue_tracker_api_base: project.issue_tracker_ref.clone().unwrap_or_default(),
    };
    let engine = PipelineEngine::new(
        state.store.clone(),
        state.driver.clone(),
        state.bus.clone(),
        state.credentials.clone(),
    );

    let concurrency = state.concurrency.clone();
    let project_id = project.id;
    let feature_id = id;
    tokio::spawn(async move {
        let _guard = SlotGuard {
            concurrency,
            project_id,
            feature_id,
        };
        if let Err(e) = engine.run(pipeline_config).await {
            warn!(target: "api", feature = %feature_id, error = %e, "manually-assigned pipeline returned an error");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AssignOutcome::Dispatched { feature_id: id }),
    ))
}

// ── Work sessions ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateWorkSessionRequest {
    project_id: ProjectId,
    thread_id: Option<ThreadId>,
    prompt: String,
}

#[derive(Serialize)]
struct CreateWorkSessionResponse {
    run_id: AgentRunId,
    thread_id: ThreadId,
}

async fn create_work_session(
    State(state): State<SharedState>,
    Path(agent_name): Path<String>,
    Json(req): Json<CreateWorkSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread_id = match req.thread_id {
        Some(id) => id,
        None => {
            state
                .store
                .create_thread(&agent_name, req.project_id, None, ThreadMode::Work)
                .await?
                .id
        }
    };
    let run_id = state
        .work_sessions
        .start_session(&agent_name, req.project_id, thread_id, &req.prompt)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateWorkSessionResponse { run_id, thread_id }),
    ))
}

async fn list_work_sessions(
    State(state): State<SharedState>,
    Path(agent_name): Path<String>,
) -> Json<Vec<WorkSession>> {
    Json(state.work_sessions.list_sessions(&agent_name))
}

async fn end_work_session(
    State(state): State<SharedState>,
    Path(run_id): Path<AgentRunId>,
) -> Result<StatusCode, ApiError> {
    state.work_sessions.end_session(run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Chat messages ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
    #[serde(default)]
    message_type: Option<MessageType>,
    metadata: Option<serde_json::Value>,
}

/// Persist the message, then — if `run_id` is an active work session —
/// forward it to the worker's stdin. A pipeline-stage run has no
/// interactive process to forward to; the persisted row is the entire
/// effect there (a chat-responder collaborator would pick it up from the
/// store, same as it would for a work session's persisted transcript).
async fn post_message(
    State(state): State<SharedState>,
    Path(run_id): Path<AgentRunId>,
    Json(req): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.store.get_agent_run(run_id).await?;
    let message_type = req.message_type.unwrap_or(MessageType::Message);
    let message = state
        .store
        .create_message(
            run_id,
            None,
            MessageSender::User,
            message_type,
            run.role,
            &req.content,
            req.metadata,
        )
        .await?;

    if let Err(e) = state.work_sessions.send_message(run_id, &req.content).await {
        if !matches!(e, crate::work_session::WorkSessionError::NotFound(_)) {
            warn!(target: "api", run = %run_id, error = %e, "failed to forward message to work session");
        }
    }

    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    since: Option<u64>,
    sender: Option<MessageSender>,
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(run_id): Path<AgentRunId>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<AgentMessage>>, ApiError> {
    Ok(Json(
        state.store.list_messages(run_id, query.since, query.sender).await?,
    ))
}

/// SSE stream of one agent-run's chat events. Sends the initial batch from
/// the store (honoring `Last-Event-ID` / `?since=` for reconnects), then
/// multiplexes live Stream Bus events with a 1 s poll of newly persisted
/// messages, closing with a `close` event once the run reaches a terminal
/// status (§6).
async fn stream_messages(
    State(state): State<SharedState>,
    Path(run_id): Path<AgentRunId>,
    headers: HeaderMap,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.store.get_agent_run(run_id).await?;

    let since = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or(query.since);

    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
    let store = state.store.clone();
    let bus = state.bus.clone();
    tokio::spawn(async move {
        run_message_stream(store, bus, run_id, since, tx).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn run_message_stream(
    store: Arc<dyn Store>,
    bus: StreamBus,
    run_id: AgentRunId,
    since: Option<u64>,
    tx: tokio::sync::mpsc::Sender<Event>,
) {
    let mut last_seq = since;

    if !send_new_messages(&store, run_id, &mut last_seq, &tx).await {
        return;
    }

    let (_replay, mut subscription) = bus.subscribe(&run_id.to_string());
    let mut poll = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { continue };
                if tx.send(bus_event(&event)).await.is_err() {
                    return;
                }
            }
            _ = poll.tick() => {
                if !send_new_messages(&store, run_id, &mut last_seq, &tx).await {
                    return;
                }

                match store.get_agent_run(run_id).await {
                    Ok(run) if run.status.is_terminal() => {
                        let _ = tx.send(close_event(&run)).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "api", run = %run_id, error = %e, "agent run disappeared mid-stream");
                        return;
                    }
                }
            }
        }
    }
}

/// Fetch and forward messages newer than `*last_seq`, advancing it.
/// Returns `false` if the receiver hung up and the stream should end.
async fn send_new_messages(
    store: &Arc<dyn Store>,
    run_id: AgentRunId,
    last_seq: &mut Option<u64>,
    tx: &tokio::sync::mpsc::Sender<Event>,
) -> bool {
    match store.list_messages(run_id, *last_seq, None).await {
        Ok(messages) => {
            for message in &messages {
                *last_seq = Some(last_seq.map_or(message.seq, |s| s.max(message.seq)));
                if tx.send(message_event(message)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            warn!(target: "api", run = %run_id, error = %e, "failed to poll for new messages");
            true
        }
    }
}

fn message_event(message: &AgentMessage) -> Event {
    Event::default()
        .event("message")
        .id(message.seq.to_string())
        .json_data(message)
        .unwrap_or_else(|_| Event::default().event("message"))
}

fn bus_event(event: &BusEvent) -> Event {
    match event {
        BusEvent::ThinkingStart => Event::default().event("thinking_start"),
        BusEvent::Token(text) => Event::default().event("token").data(text.clone()),
        BusEvent::ThinkingEnd => Event::default().event("thinking_end"),
        BusEvent::StreamError(reason) => Event::default().event("stream_error").data(reason.clone()),
    }
}

fn close_event(run: &AgentRun) -> Event {
    Event::default()
        .event("close")
        .json_data(serde_json::json!({ "status": run.status.as_str() }))
        .unwrap_or_else(|_| Event::default().event("close"))
}

// ── Queue ────────────────────────────────────────────────────────────

async fn list_queue(
    State(state): State<SharedState>,
    Path(agent_name): Path<String>,
) -> Result<Json<Vec<QueueEntry>>, ApiError> {
    Ok(Json(state.queue.list_queue(&agent_name).await?))
}

#[derive(Deserialize)]
struct EnqueueRequest {
    project_id: ProjectId,
    prompt: String,
    thread_id: Option<ThreadId>,
}

async fn enqueue_job(
    State(state): State<SharedState>,
    Path(agent_name): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .queue
        .enqueue(&agent_name, req.project_id, &req.prompt, req.thread_id, QueuedBy::User, None)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_queue_job(
    State(state): State<SharedState>,
    Path((agent_name, job_id)): Path<(String, JobId)>,
) -> Result<StatusCode, ApiError> {
    state.queue.remove(&agent_name, job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── PR from chat ─────────────────────────────────────────────────────

/// Opening the pull request against the hosting provider is a collaborator
/// outside this core (§6); this handler records the intent and transitions
/// the feature so the rest of the control-plane sees the feature as done.
async fn create_pr(
    State(state): State<SharedState>,
    Path(run_id): Path<AgentRunId>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.store.get_agent_run(run_id).await?;
    let feature = state.store.get_feature(run.feature_id).await?;
    if feature.status != FeatureStatus::ReviewReady {
        return Err(ApiError::Conflict(format!(
            "feature {} is not review_ready",
            feature.id
        )));
    }

    let pr_url = format!("https://example.invalid/pulls/{}", feature.id);
    state.store.transition_review_ready_to_passing(feature.id).await?;
    let message = state
        .store
        .create_message(
            run_id,
            None,
            MessageSender::System,
            MessageType::PrCreated,
            run.role,
            &pr_url,
            Some(serde_json::json!({ "pr_url": pr_url })),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::driver::local::LocalProcessDriver;
    use crate::store::memory::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let driver: Arc<dyn WorkerDriver> = Arc::new(LocalProcessDriver::new("true", "/tmp"));
        let bus = StreamBus::new();
        let concurrency = Arc::new(ConcurrencyManager::new());
        let queue = QueueManager::new(store.clone());
        let work_sessions = WorkSessionManager::new(store.clone(), driver.clone(), bus.clone(), queue.clone());
        queue.attach_work_sessions(work_sessions.clone());
        Arc::new(AppState {
            store,
            driver,
            bus,
            concurrency,
            queue,
            work_sessions,
            credentials: Arc::new(StaticCredentialProvider::new(None)),
            limits: PipelineLimits::default(),
            monitor: MonitorConfig::default(),
            started_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = build_router(test_state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_and_get_project_round_trip() {
        let app = build_router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"name": "demo"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let project: Project = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(project.name, "demo");
        assert_eq!(project.default_branch, "main");

        let req = Request::builder()
            .uri(format!("/api/projects/{}", project.id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_missing_project_is_404() {
        let app = build_router(test_state());
        let req = Request::builder().uri("/api/projects/9999").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn assign_rejects_feature_without_repo() {
        let state = test_state();
        let project = state
            .store
            .create_project("demo", None, "main", 2, None)
            .await
            .unwrap();
        let feature = state
            .store
            .create_feature(project.id, "widget", "does widget things", 1, "general", vec![], None)
            .await
            .unwrap();
        let app = build_router(state);

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/features/{}/assign", feature.id))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"agent_name": "coder"}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn assign_dispatches_when_capacity_available() {
        let state = test_state();
        let project = state
            .store
            .create_project("demo", Some("https://example.invalid/repo.git".into()), "main", 2, None)
            .await
            .unwrap();
        let feature = state
            .store
            .create_feature(project.id, "widget", "does widget things", 1, "general", vec![], None)
            .await
            .unwrap();
        let app = build_router(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/features/{}/assign", feature.id))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"agent_name": "coder"}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let reloaded = state.store.get_feature(feature.id).await.unwrap();
        assert_eq!(reloaded.status, FeatureStatus::InProgress);
    }

    #[tokio::test]
    async fn assign_queues_when_cap_exhausted() {
        let state = test_state();
        let project = state
            .store
            .create_project("demo", Some("https://example.invalid/repo.git".into()), "main", 1, None)
            .await
            .unwrap();
        state.concurrency.acquire(project.id, FeatureId(999)).unwrap();
        let feature = state
            .store
            .create_feature(project.id, "widget", "does widget things", 1, "general", vec![], None)
            .await
            .unwrap();
        let app = build_router(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/features/{}/assign", feature.id))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"agent_name": "coder"}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        // Still pending: it was queued, not dispatched.
        let reloaded = state.store.get_feature(feature.id).await.unwrap();
        assert_eq!(reloaded.status, FeatureStatus::Pending);
        let queued = state.queue.list_queue("coder").await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn post_and_list_messages_round_trip() {
        let state = test_state();
        let project = state.store.create_project("demo", None, "main", 2, None).await.unwrap();
        let run_id = state
            .store
            .create_agent_run(project.id, FeatureId(1), crate::store::types::AgentRole::Coder, "coder")
            .await
            .unwrap();
        let app = build_router(state);

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/agent-runs/{}/messages", run_id))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"content": "hello"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = Request::builder()
            .uri(format!("/api/agent-runs/{}/messages", run_id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let messages: Vec<AgentMessage> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn create_pr_rejects_feature_not_review_ready() {
        let state = test_state();
        let project = state.store.create_project("demo", None, "main", 2, None).await.unwrap();
        let feature = state
            .store
            .create_feature(project.id, "widget", "", 1, "general", vec![], None)
            .await
            .unwrap();
        let run_id = state
            .store
            .create_agent_run(project.id, feature.id, crate::store::types::AgentRole::Tester, "tester")
            .await
            .unwrap();
        let app = build_router(state);

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/agent-runs/{}/create-pr", run_id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
