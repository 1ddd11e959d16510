//! Pipeline Engine — the fixed four-stage sequence
//! `architect -> coder -> [reviewer <-> coder] -> tester -> finalize`
//! applied to one feature. The heart of the control-plane (§4.F).

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{BusEvent, StreamBus};
use crate::credentials::CredentialProvider;
use crate::driver::{WorkerDriver, WorkerSpec};
use crate::errors::PipelineError;
use crate::ids::{AgentRunId, FeatureId, ProjectId};
use crate::monitor::{AgentRunMonitor, MonitorConfig, MonitorOutcome};
use crate::store::Store;
use crate::store::types::{AgentRole, AgentRunStatus, MessageSender, MessageType};
use crate::sync_hook::{ExternalSyncHook, SyncHookConfig};

/// Retry/cycle bounds; defaults match §4.F.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_step_retries: u32,
    pub max_review_cycles: u32,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_step_retries: 1,
            max_review_cycles: 1,
        }
    }
}

/// Everything one pipeline run needs about the feature it is working: its
/// identity plus the metadata handed to every worker's environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project_id: ProjectId,
    pub feature_id: FeatureId,
    pub repo_url: String,
    pub feature_name: String,
    pub feature_description: String,
    pub base_branch: String,
    pub limits: PipelineLimits,
    pub monitor: MonitorConfig,
    /// Static (non-secret) external-system addressing for the Sync Hook;
    /// the access token itself is re-resolved per stage, never cached here.
    pub external_issue_id: Option<String>,
    pub issue_tracker_api_base: String,
}

/// Outcome of one stage run, after retries.
enum StageResult {
    Success { run_id: AgentRunId, exit_code: i32 },
    Failure { run_id: AgentRunId, exit_code: Option<i32>, reason: String },
}

pub struct PipelineEngine {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkerDriver>,
    bus: StreamBus,
    credentials: Arc<dyn CredentialProvider>,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn WorkerDriver>,
        bus: StreamBus,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            store,
            driver,
            bus,
            credentials,
        }
    }

    /// Resolve a fresh token from the installation credentials and build a
    /// Sync Hook around it. Called at the start of every stage (and at
    /// pipeline start/success/failure) rather than once per run, per §9's
    /// "per-pipeline retry token refresh" note — the token may have expired
    /// since the last call.
    async fn sync_hook(&self, config: &PipelineConfig) -> ExternalSyncHook {
        let access_token = self.credentials.resolve_token(config.project_id).await;
        ExternalSyncHook::new(SyncHookConfig {
            access_token,
            external_issue_id: config.external_issue_id.clone(),
            feature_name: config.feature_name.clone(),
            api_base: config.issue_tracker_api_base.clone(),
        })
    }

    /// Run the full pipeline for one feature to its terminal outcome.
    /// Never panics through to the caller on a stage failure — the
    /// feature's store state is the signal of record.
    pub async fn run(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        info!(target: "pipeline", feature = %config.feature_id, "pipeline starting");
        self.sync_hook(&config).await.on_pipeline_start().await;

        let mut context = Vec::new();

        let architect = self
            .run_stage_with_retry(&config, AgentRole::Architect, &mut context)
            .await;
        let architect_run = match architect {
            StageResult::Success { run_id, .. } => run_id,
            StageResult::Failure { reason, .. } => {
                return self.fail_feature(&config, "architect", &reason).await;
            }
        };
        let _ = architect_run;

        let coder = self.run_stage_with_retry(&config, AgentRole::Coder, &mut context).await;
        let mut coder_run = match coder {
            StageResult::Success { run_id, .. } => run_id,
            StageResult::Failure { reason, .. } => {
                return self.fail_feature(&config, "coder", &reason).await;
            }
        };

        // Review cycle: reviewer exit 0 = approve, 2 = request changes
        // (re-run coder then reviewer, bounded), anything else = failure.
        let mut reviewer_run = None;
        let mut cycles = 0;
        loop {
            let reviewer = self.run_reviewer_stage(&config, &mut context).await;
            match reviewer {
                StageResult::Success { run_id, .. } => {
                    reviewer_run = Some(run_id);
                    break;
                }
                StageResult::Failure {
                    run_id,
                    exit_code: Some(2),
                    ..
                } => {
                    reviewer_run = Some(run_id);
                    if cycles >= config.limits.max_review_cycles {
                        warn!(
                            target: "pipeline",
                            feature = %config.feature_id,
                            cycles,
                            "reviewer still requested changes after max review cycles; proceeding to tester anyway"
                        );
                        break;
                    }
                    cycles += 1;
                    let coder_retry = self.run_stage_with_retry(&config, AgentRole::Coder, &mut context).await;
                    coder_run = match coder_retry {
                        StageResult::Success { run_id, .. } => run_id,
                        StageResult::Failure { reason, .. } => {
                            return self.fail_feature(&config, "coder", &reason).await;
                        }
                    };
                    // loop back to re-run the reviewer
                }
                StageResult::Failure { reason, .. } => {
                    return self.fail_feature(&config, "reviewer", &reason).await;
                }
            }
        }
        let _ = reviewer_run;
        let _ = coder_run;

        let tester = self.run_stage_with_retry(&config, AgentRole::Tester, &mut context).await;
        let tester_run = match tester {
            StageResult::Success { run_id, .. } => run_id,
            StageResult::Failure { reason, .. } => {
                return self.fail_feature(&config, "tester", &reason).await;
            }
        };

        self.pass_feature(&config, tester_run).await
    }

    /// One stage, retried up to `limits.max_step_retries` times on failure.
    async fn run_stage_with_retry(&self, config: &PipelineConfig, role: AgentRole, context: &mut Vec<String>) -> StageResult {
        let mut attempts = 0;
        loop {
            let result = self.run_stage_once(config, role, context).await;
            match result {
                StageResult::Success { .. } => return result,
                StageResult::Failure { .. } if attempts < config.limits.max_step_retries => {
                    attempts += 1;
                    warn!(target: "pipeline", feature = %config.feature_id, role = %role, attempts, "stage failed, retrying");
                }
                StageResult::Failure { .. } => return result,
            }
        }
    }

    /// The reviewer is not retried by [`run_stage_with_retry`]'s generic
    /// policy: exit code 2 ("request changes") is a distinct signal the
    /// review cycle handles explicitly, never a transient-failure retry.
    /// Any other non-zero exit is a genuine reviewer error and does use
    /// the normal step-retry budget.
    async fn run_reviewer_stage(&self, config: &PipelineConfig, context: &mut Vec<String>) -> StageResult {
        let mut attempts = 0;
        loop {
            let result = self.run_stage_once(config, AgentRole::Reviewer, context).await;
            match &result {
                StageResult::Success { .. } => return result,
                StageResult::Failure { exit_code: Some(2), .. } => return result,
                StageResult::Failure { .. } if attempts < config.limits.max_step_retries => {
                    attempts += 1;
                    warn!(target: "pipeline", feature = %config.feature_id, attempts, "reviewer stage errored, retrying");
                }
                StageResult::Failure { .. } => return result,
            }
        }
    }

    /// One run of one stage: create the AgentRun, launch the worker, drive
    /// it to terminal via a Monitor.
    async fn run_stage_once(&self, config: &PipelineConfig, role: AgentRole, context: &mut Vec<String>) -> StageResult {
        let agent_id = format!("{}-{}", role.as_str(), config.feature_id);
        let run_id = match self
            .store
            .create_agent_run(config.project_id, config.feature_id, role, &agent_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return StageResult::Failure {
                    run_id: AgentRunId(0),
                    exit_code: None,
                    reason: format!("failed to create agent run: {e}"),
                };
            }
        };

        self.collect_new_context(run_id, context).await;

        // Re-resolved on every call, not cached on the engine or the config:
        // the token may have expired since the previous stage ran.
        let access_token = self.credentials.resolve_token(config.project_id).await;

        let spec = WorkerSpec {
            role,
            repo_url: config.repo_url.clone(),
            feature_id: config.feature_id,
            project_id: config.project_id,
            feature_name: config.feature_name.clone(),
            feature_description: config.feature_description.clone(),
            base_branch: config.base_branch.clone(),
            argv_extra: Vec::new(),
            access_token,
        };

        let handle = match self.driver.launch(&spec).await {
            Ok(h) => h,
            Err(e) => {
                let reason = format!("Launch failure: {e}");
                let _ = self
                    .store
                    .complete_agent_run(run_id, AgentRunStatus::Failed, None, Some(reason.clone()))
                    .await;
                return StageResult::Failure {
                    run_id,
                    exit_code: None,
                    reason,
                };
            }
        };

        let role_status = match role {
            AgentRole::Architect => AgentRunStatus::Thinking,
            AgentRole::Coder => AgentRunStatus::Coding,
            AgentRole::Reviewer => AgentRunStatus::Reviewing,
            AgentRole::Tester => AgentRunStatus::Testing,
        };

        let monitor = AgentRunMonitor::new(self.store.clone(), self.driver.clone(), self.bus.clone(), config.monitor);
        match monitor.run(run_id, &handle, role_status).await {
            MonitorOutcome::Completed { exit_code } => StageResult::Success { run_id, exit_code },
            MonitorOutcome::Failed { exit_code, reason } => StageResult::Failure { run_id, exit_code, reason },
            MonitorOutcome::TimedOut => StageResult::Failure {
                run_id,
                exit_code: None,
                reason: "timed out".to_string(),
            },
        }
    }

    /// Poll for any new user messages on the feature since the last poll
    /// and accumulate them as context for the next stage. This is not
    /// required to affect the worker (it is passed through the environment
    /// or a file, if at all) but its collection must be observable.
    async fn collect_new_context(&self, run_id: AgentRunId, context: &mut Vec<String>) {
        match self.store.list_messages(run_id, None, Some(MessageSender::User)).await {
            Ok(messages) => {
                for m in messages {
                    context.push(m.content);
                }
            }
            Err(e) => {
                warn!(target: "pipeline", run_id = %run_id, error = %e, "failed to poll for new context messages");
            }
        }
    }

    async fn fail_feature(&self, config: &PipelineConfig, failed_step: &str, message: &str) -> Result<(), PipelineError> {
        if let Err(e) = self.store.mark_feature_failing(config.feature_id).await {
            warn!(target: "pipeline", feature = %config.feature_id, error = %e, "failed to mark feature failing");
        }
        self.sync_hook(config).await.on_pipeline_failure(failed_step, message).await;
        Ok(())
    }

    async fn pass_feature(&self, config: &PipelineConfig, tester_run: AgentRunId) -> Result<(), PipelineError> {
        if let Err(e) = self.store.mark_feature_review_ready(config.feature_id).await {
            warn!(target: "pipeline", feature = %config.feature_id, error = %e, "failed to mark feature review ready");
            return Err(PipelineError::Store(e));
        }
        if let Err(e) = self
            .store
            .create_message(
                tester_run,
                None,
                MessageSender::System,
                MessageType::PrReady,
                AgentRole::Tester,
                "All pipeline stages passed; a pull request may now be opened.",
                None,
            )
            .await
        {
            warn!(target: "pipeline", feature = %config.feature_id, error = %e, "failed to post pr_ready message");
        }
        self.sync_hook(config).await.on_pipeline_success(None).await;
        info!(target: "pipeline", feature = %config.feature_id, "pipeline finished: review_ready");
        Ok(())
    }

    /// Emit a `StreamError` on a run's Stream Bus topic; used by callers
    /// that want a listener-visible signal beyond the store write.
    pub fn emit_error(&self, run_id: AgentRunId, message: &str) {
        self.bus.emit(&run_id.to_string(), BusEvent::StreamError(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::driver::{DriverError, LaunchHandle, WorkerState};
    use crate::store::memory::MemoryStore;
    use crate::store::types::{Feature, FeatureStatus, Project};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// A driver whose exit code for a launch depends on the worker's role
    /// and how many times that role has already been launched — lets a
    /// single pipeline run exercise the scenarios in spec §8 (S1-S3) where
    /// different stages, or repeat runs of the same stage, need different
    /// outcomes.
    struct ScriptedDriver {
        /// Per-role queue of exit codes; each launch of that role pops one.
        scripts: StdMutex<HashMap<AgentRole, VecDeque<i32>>>,
        launches: StdMutex<Vec<AgentRole>>,
        tokens: StdMutex<Vec<Option<String>>>,
    }

    impl ScriptedDriver {
        fn new(scripts: Vec<(AgentRole, Vec<i32>)>) -> Self {
            Self {
                scripts: StdMutex::new(
                    scripts.into_iter().map(|(role, codes)| (role, codes.into())).collect(),
                ),
                launches: StdMutex::new(Vec::new()),
                tokens: StdMutex::new(Vec::new()),
            }
        }

        fn launch_counts(&self) -> Vec<AgentRole> {
            self.launches.lock().unwrap().clone()
        }

        /// The `access_token` seen on each successive launch, in order.
        fn tokens_seen(&self) -> Vec<Option<String>> {
            self.tokens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerDriver for ScriptedDriver {
        async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle, DriverError> {
            self.launches.lock().unwrap().push(spec.role);
            self.tokens.lock().unwrap().push(spec.access_token.clone());
            let code = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&spec.role)
                .and_then(|q| q.pop_front())
                .unwrap_or(0);
            Ok(LaunchHandle(format!("{}-{}", spec.role.as_str(), code)))
        }

        async fn poll(&self, handle: &LaunchHandle) -> Result<WorkerState, DriverError> {
            let code: i32 = handle.0.rsplit('-').next().unwrap().parse().unwrap();
            Ok(if code == 0 {
                WorkerState::Completed { exit_code: 0 }
            } else {
                WorkerState::Failed { exit_code: Some(code) }
            })
        }

        async fn drain_output(&self, _handle: &LaunchHandle) -> Result<Vec<String>, DriverError> {
            Ok(Vec::new())
        }

        async fn terminate(&self, _handle: &LaunchHandle, _reason: &str) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn fast_monitor_config() -> MonitorConfig {
        MonitorConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            status_update_interval: Duration::from_millis(5),
        }
    }

    fn no_creds() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredentialProvider::new(None))
    }

    /// Returns a new token on every call — distinguishes "resolved once and
    /// cached" from "resolved fresh at the start of each stage."
    struct RotatingCredentialProvider {
        next: StdMutex<u32>,
    }

    impl RotatingCredentialProvider {
        fn new() -> Self {
            Self { next: StdMutex::new(0) }
        }
    }

    #[async_trait]
    impl CredentialProvider for RotatingCredentialProvider {
        async fn resolve_token(&self, _project_id: ProjectId) -> Option<String> {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            Some(format!("tok-{next}"))
        }
    }

    fn seed(store: &MemoryStore) -> (ProjectId, FeatureId) {
        let project_id = ProjectId(1);
        let feature_id = FeatureId(1);
        store.seed_project(Project {
            id: project_id,
            name: "demo".into(),
            repo_url: Some("https://example.invalid/repo.git".into()),
            default_branch: "main".into(),
            concurrency_cap: 1,
            issue_tracker_ref: None,
            active: true,
        });
        store.seed_feature(Feature {
            id: feature_id,
            project_id,
            name: "widget".into(),
            description: "add a widget".into(),
            priority: 1,
            category: "general".into(),
            status: FeatureStatus::Pending,
            dependencies: vec![],
            issue_tracker_ref: None,
            assigned_agent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        (project_id, feature_id)
    }

    fn config(project_id: ProjectId, feature_id: FeatureId) -> PipelineConfig {
        PipelineConfig {
            project_id,
            feature_id,
            repo_url: "https://example.invalid/repo.git".into(),
            feature_name: "widget".into(),
            feature_description: "add a widget".into(),
            base_branch: "main".into(),
            limits: PipelineLimits::default(),
            monitor: fast_monitor_config(),
            external_issue_id: None,
            issue_tracker_api_base: "https://example.invalid".into(),
        }
    }

    /// S1 — happy path: architect, coder, reviewer, tester all exit 0.
    #[tokio::test]
    async fn s1_happy_path_marks_feature_review_ready_with_pr_ready_message() {
        let store = Arc::new(MemoryStore::new());
        let (project_id, feature_id) = seed(&store);
        store.claim_feature(feature_id, "watcher").await.unwrap();

        let driver = Arc::new(ScriptedDriver::new(vec![
            (AgentRole::Architect, vec![0]),
            (AgentRole::Coder, vec![0]),
            (AgentRole::Reviewer, vec![0]),
            (AgentRole::Tester, vec![0]),
        ]));
        let engine = PipelineEngine::new(store.clone(), driver.clone(), StreamBus::new(), no_creds());

        engine.run(config(project_id, feature_id)).await.unwrap();

        let feature = store.get_feature(feature_id).await.unwrap();
        assert_eq!(feature.status, FeatureStatus::ReviewReady);
        assert_eq!(
            driver.launch_counts(),
            vec![AgentRole::Architect, AgentRole::Coder, AgentRole::Reviewer, AgentRole::Tester]
        );

        let runs_with_pr_ready: Vec<_> = store
            .list_messages(AgentRunId(4), None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.message_type == MessageType::PrReady)
            .collect();
        assert_eq!(runs_with_pr_ready.len(), 1);
    }

    /// S2 — review cycle: reviewer requests changes once, then approves.
    /// Total stage launches pinned at 6: architect, coder, reviewer,
    /// coder, reviewer, tester.
    #[tokio::test]
    async fn s2_review_cycle_reruns_coder_and_reviewer_once() {
        let store = Arc::new(MemoryStore::new());
        let (project_id, feature_id) = seed(&store);
        store.claim_feature(feature_id, "watcher").await.unwrap();

        let driver = Arc::new(ScriptedDriver::new(vec![
            (AgentRole::Architect, vec![0]),
            (AgentRole::Coder, vec![0, 0]),
            (AgentRole::Reviewer, vec![2, 0]),
            (AgentRole::Tester, vec![0]),
        ]));
        let engine = PipelineEngine::new(store.clone(), driver.clone(), StreamBus::new(), no_creds());

        engine.run(config(project_id, feature_id)).await.unwrap();

        let feature = store.get_feature(feature_id).await.unwrap();
        assert_eq!(feature.status, FeatureStatus::ReviewReady);
        assert_eq!(
            driver.launch_counts(),
            vec![
                AgentRole::Architect,
                AgentRole::Coder,
                AgentRole::Reviewer,
                AgentRole::Coder,
                AgentRole::Reviewer,
                AgentRole::Tester,
            ]
        );
    }

    /// S3 — coder persistent failure: architect succeeds, coder fails
    /// twice (initial + one retry), pipeline ends without a reviewer or
    /// tester run.
    #[tokio::test]
    async fn s3_persistent_coder_failure_marks_feature_failing() {
        let store = Arc::new(MemoryStore::new());
        let (project_id, feature_id) = seed(&store);
        store.claim_feature(feature_id, "watcher").await.unwrap();

        let driver = Arc::new(ScriptedDriver::new(vec![
            (AgentRole::Architect, vec![0]),
            (AgentRole::Coder, vec![1, 1]),
        ]));
        let engine = PipelineEngine::new(store.clone(), driver.clone(), StreamBus::new(), no_creds());

        engine.run(config(project_id, feature_id)).await.unwrap();

        let feature = store.get_feature(feature_id).await.unwrap();
        assert_eq!(feature.status, FeatureStatus::Failing);
        assert_eq!(driver.launch_counts(), vec![AgentRole::Architect, AgentRole::Coder, AgentRole::Coder]);

        // architect = run 1, first coder attempt = run 2, retry = run 3.
        let coder_run = store.get_agent_run(AgentRunId(3)).await.unwrap();
        assert_eq!(coder_run.status, AgentRunStatus::Failed);
        assert!(coder_run.error_message.as_deref().unwrap().contains("Exit code: 1"));

        // No reviewer or tester run was ever created.
        assert!(store.get_agent_run(AgentRunId(4)).await.is_err());
    }

    /// Each of the four stages in a happy-path run sees a distinct token —
    /// the credential provider is consulted fresh per stage, never cached
    /// on the engine or reused from a prior stage's resolution.
    #[tokio::test]
    async fn each_stage_launch_carries_a_freshly_resolved_token() {
        let store = Arc::new(MemoryStore::new());
        let (project_id, feature_id) = seed(&store);
        store.claim_feature(feature_id, "watcher").await.unwrap();

        let driver = Arc::new(ScriptedDriver::new(vec![
            (AgentRole::Architect, vec![0]),
            (AgentRole::Coder, vec![0]),
            (AgentRole::Reviewer, vec![0]),
            (AgentRole::Tester, vec![0]),
        ]));
        let engine = PipelineEngine::new(
            store.clone(),
            driver.clone(),
            StreamBus::new(),
            Arc::new(RotatingCredentialProvider::new()),
        );

        engine.run(config(project_id, feature_id)).await.unwrap();

        // The first resolution is spent on `on_pipeline_start`'s sync hook,
        // so the four stage launches see tokens 2 through 5 — all distinct,
        // none repeated, confirming resolution happens on every call site
        // rather than once up front.
        let tokens = driver.tokens_seen();
        assert_eq!(
            tokens,
            vec![
                Some("tok-2".to_string()),
                Some("tok-3".to_string()),
                Some("tok-4".to_string()),
                Some("tok-5".to_string()),
            ]
        );
    }
}
