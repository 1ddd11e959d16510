//! Feature Watcher — the periodic loop that discovers ready features and
//! admits them into the Pipeline Engine, gated by the Concurrency Manager
//! (§4.G). The only component that calls `ConcurrencyManager::acquire`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bus::StreamBus;
use crate::concurrency::ConcurrencyManager;
use crate::credentials::CredentialProvider;
use crate::driver::WorkerDriver;
use crate::monitor::MonitorConfig;
use crate::pipeline::{PipelineConfig, PipelineEngine, PipelineLimits};
use crate::store::types::Project;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    /// When `false`, the Watcher still runs its discovery cycle (useful for
    /// observability) but never acquires a slot or spawns a pipeline.
    pub auto_dispatch: bool,
    pub limits: PipelineLimits,
    pub monitor: MonitorConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            auto_dispatch: true,
            limits: PipelineLimits::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Drives the discovery-and-admission loop. Holds everything it needs to
/// build a [`PipelineConfig`] and spawn a [`PipelineEngine`] per admitted
/// feature.
pub struct FeatureWatcher {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkerDriver>,
    bus: StreamBus,
    concurrency: Arc<ConcurrencyManager>,
    credentials: Arc<dyn CredentialProvider>,
    config: WatcherConfig,
    running: Arc<AtomicBool>,
}

impl FeatureWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn WorkerDriver>,
        bus: StreamBus,
        concurrency: Arc<ConcurrencyManager>,
        credentials: Arc<dyn CredentialProvider>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            store,
            driver,
            bus,
            concurrency,
            credentials,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: calling `start` while already running is a no-op and
    /// returns `None` instead of a second task handle.
    pub fn start(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let store = self.store.clone();
        let driver = self.driver.clone();
        let bus = self.bus.clone();
        let concurrency = self.concurrency.clone();
        let credentials = self.credentials.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                run_cycle(&store, &driver, &bus, &concurrency, &credentials, &config).await;
            }
        }))
    }

    /// Cancels the timer. Pipelines already spawned from a prior cycle are
    /// not interrupted.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run exactly one discovery cycle. Exposed directly so tests need not
    /// wait on the interval timer.
    pub async fn run_once(&self) {
        run_cycle(
            &self.store,
            &self.driver,
            &self.bus,
            &self.concurrency,
            &self.credentials,
            &self.config,
        )
        .await;
    }
}

async fn run_cycle(
    store: &Arc<dyn Store>,
    driver: &Arc<dyn WorkerDriver>,
    bus: &StreamBus,
    concurrency: &Arc<ConcurrencyManager>,
    credentials: &Arc<dyn CredentialProvider>,
    config: &WatcherConfig,
) {
    let projects = match store.list_active_projects().await {
        Ok(p) => p,
        Err(e) => {
            warn!(target: "watcher", error = %e, "failed to list active projects, skipping cycle");
            return;
        }
    };

    for project in projects {
        if project.repo_url.is_none() {
            continue;
        }
        if let Err(e) = admit_ready_features(store, driver, bus, concurrency, credentials, config, &project).await {
            warn!(target: "watcher", project = %project.id, error = %e, "failed to list ready features, skipping project this cycle");
        }
    }
}

async fn admit_ready_features(
    store: &Arc<dyn Store>,
    driver: &Arc<dyn WorkerDriver>,
    bus: &StreamBus,
    concurrency: &Arc<ConcurrencyManager>,
    credentials: &Arc<dyn CredentialProvider>,
    config: &WatcherConfig,
    project: &Project,
) -> Result<(), crate::errors::StoreError> {
    if !concurrency.can_start(project.id, project.concurrency_cap) {
        return Ok(());
    }

    // list_ready_features already sorts by priority then created_at.
    let ready = store.list_ready_features(project.id).await?;

    for feature in ready {
        if !concurrency.can_start(project.id, project.concurrency_cap) {
            break;
        }
        if concurrency.is_active(project.id, feature.id) {
            continue;
        }
        if let Err(e) = concurrency.acquire(project.id, feature.id) {
            warn!(target: "watcher", feature = %feature.id, error = %e, "failed to acquire slot, skipping");
            continue;
        }

        if !config.auto_dispatch {
            info!(target: "watcher", feature = %feature.id, "auto_dispatch disabled, releasing slot without launching");
            concurrency.release(project.id, feature.id);
            continue;
        }

        if let Err(e) = store.claim_feature(feature.id, "watcher").await {
            warn!(target: "watcher", feature = %feature.id, error = %e, "claim_feature failed after acquire, releasing slot");
            concurrency.release(project.id, feature.id);
            continue;
        }

        let pipeline_config = PipelineConfig {
            project_id: project.id,
            feature_id: feature.id,
            repo_url: project.repo_url.clone().unwrap_or_default(),
            feature_name: feature.name.clone(),
            feature_description: feature.description.clone(),
            base_branch: project.default_branch.clone(),
            limits: config.limits,
            monitor: config.monitor,
            external_issue_id: feature.issue_tracker_ref.clone(),
            issue_tracker_api_base: project.issue_tracker_ref.clone().unwrap_or_default(),
        };

        let engine = PipelineEngine::new(store.clone(), driver.clone(), bus.clone(), credentials.clone());

        let concurrency = concurrency.clone();
        let project_id = project.id;
        let feature_id = feature.id;
        tokio::spawn(async move {
            // The slot must be released regardless of how the pipeline
            // ends, including a panic unwinding through this task.
            let _guard = SlotGuard {
                concurrency: concurrency.clone(),
                project_id,
                feature_id,
            };
            if let Err(e) = engine.run(pipeline_config).await {
                error!(target: "watcher", feature = %feature_id, error = %e, "pipeline returned an error");
            }
        });
    }

    Ok(())
}

/// RAII guard releasing a Concurrency Manager slot on drop, so a panic
/// inside the spawned pipeline task still frees the slot. Shared with the
/// HTTP surface's manual-assignment handler, which admits a single feature
/// outside the Watcher's own cycle but must honor the same release
/// guarantee (property 3).
pub(crate) struct SlotGuard {
    pub(crate) concurrency: Arc<ConcurrencyManager>,
    pub(crate) project_id: crate::ids::ProjectId,
    pub(crate) feature_id: crate::ids::FeatureId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.concurrency.release(self.project_id, self.feature_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::driver::local::LocalProcessDriver;
    use crate::store::memory::MemoryStore;
    use crate::store::types::{Feature, FeatureStatus};
    use chrono::Utc;
    use std::time::Duration;

    fn no_creds() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredentialProvider::new(None))
    }

    fn project(id: i64, cap: u32) -> Project {
        Project {
            id: crate::ids::ProjectId(id),
            name: "demo".into(),
            repo_url: Some("https://example.invalid/repo.git".into()),
            default_branch: "main".into(),
            concurrency_cap: cap,
            issue_tracker_ref: None,
            active: true,
        }
    }

    fn feature(id: i64, project_id: crate::ids::ProjectId, priority: i32) -> Feature {
        let now = Utc::now();
        Feature {
            id: crate::ids::FeatureId(id),
            project_id,
            name: format!("feature-{id}"),
            description: String::new(),
            priority,
            category: "general".into(),
            status: FeatureStatus::Pending,
            dependencies: vec![],
            issue_tracker_ref: None,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn admits_features_up_to_the_concurrency_cap() {
        let store = Arc::new(MemoryStore::new());
        let p = project(1, 1);
        store.seed_project(p.clone());
        store.seed_feature(feature(1, p.id, 1));
        store.seed_feature(feature(2, p.id, 2));

        let driver: Arc<dyn WorkerDriver> = Arc::new(LocalProcessDriver::new("sleep", "/tmp"));
        let bus = StreamBus::new();
        let concurrency = Arc::new(ConcurrencyManager::new());
        let config = WatcherConfig {
            poll_interval: Duration::from_secs(30),
            auto_dispatch: true,
            limits: PipelineLimits::default(),
            monitor: MonitorConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        };
        let watcher = FeatureWatcher::new(store.clone(), driver, bus, concurrency.clone(), no_creds(), config);

        watcher.run_once().await;

        // Cap is 1: exactly one feature should have been claimed (and thus
        // moved out of `pending`, making it no longer "ready").
        let remaining_ready = store.list_ready_features(p.id).await.unwrap();
        assert_eq!(remaining_ready.len(), 0);
        let f1 = store.get_feature(crate::ids::FeatureId(1)).await.unwrap();
        assert_eq!(f1.status, FeatureStatus::InProgress);
    }

    #[tokio::test]
    async fn auto_dispatch_off_does_not_claim_or_launch() {
        let store = Arc::new(MemoryStore::new());
        let p = project(1, 2);
        store.seed_project(p.clone());
        store.seed_feature(feature(1, p.id, 1));

        let driver: Arc<dyn WorkerDriver> = Arc::new(LocalProcessDriver::new("true", "/tmp"));
        let bus = StreamBus::new();
        let concurrency = Arc::new(ConcurrencyManager::new());
        let config = WatcherConfig {
            auto_dispatch: false,
            ..WatcherConfig::default()
        };
        let watcher = FeatureWatcher::new(store.clone(), driver, bus, concurrency.clone(), no_creds(), config);

        watcher.run_once().await;

        let f1 = store.get_feature(crate::ids::FeatureId(1)).await.unwrap();
        assert_eq!(f1.status, FeatureStatus::Pending);
        assert_eq!(concurrency.active_count(p.id), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let driver: Arc<dyn WorkerDriver> = Arc::new(LocalProcessDriver::new("true", "/tmp"));
        let watcher = FeatureWatcher::new(
            store,
            driver,
            StreamBus::new(),
            Arc::new(ConcurrencyManager::new()),
            no_creds(),
            WatcherConfig::default(),
        );
        let first = watcher.start();
        assert!(first.is_some());
        let second = watcher.start();
        assert!(second.is_none());
        watcher.stop();
        if let Some(handle) = first {
            handle.abort();
        }
    }
}
