//! Layered configuration: built-in defaults, then an optional `.toml` file,
//! then environment variable overrides — the same three-tier merge the
//! reference codebase's `SandboxConfig::load`/`ForgeConfig` use, generalized
//! from a phase-executor's settings to the control-plane's.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::monitor::MonitorConfig;
use crate::pipeline::PipelineLimits;
use crate::watcher::WatcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    Local,
    Container,
}

impl DriverMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "container" | "docker" => Some(Self::Container),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
}

impl StoreBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Fully resolved settings, ready to hand to the components that need them.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: String,
    pub store_backend: StoreBackend,
    pub driver_mode: DriverMode,
    pub container_image: String,
    pub worker_entrypoint: String,
    pub worker_working_dir: String,
    pub auto_dispatch: bool,
    pub watcher_poll_interval: Duration,
    pub monitor: MonitorConfig,
    pub limits: PipelineLimits,
    pub work_session_inactivity_timeout: Duration,
    pub queue_depth_poll_interval: Duration,
    pub shutdown_grace_period: Duration,
    /// Installation credential the Pipeline Engine re-resolves at the start
    /// of every stage (§9 "per-pipeline retry token refresh"). Secret-like;
    /// deliberately not settable from a committed `.toml` file, only from
    /// the environment (typically via a local `.env`, see `dotenvy` in
    /// `main.rs`).
    pub issue_tracker_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4041".to_string(),
            store_backend: StoreBackend::Memory,
            driver_mode: DriverMode::Local,
            container_image: "forge-worker:latest".to_string(),
            worker_entrypoint: "/usr/local/bin/forge-worker-entrypoint".to_string(),
            worker_working_dir: "/tmp/forge-workers".to_string(),
            auto_dispatch: true,
            watcher_poll_interval: Duration::from_secs(30),
            monitor: MonitorConfig::default(),
            limits: PipelineLimits::default(),
            work_session_inactivity_timeout: Duration::from_secs(30 * 60),
            queue_depth_poll_interval: Duration::from_secs(1),
            shutdown_grace_period: Duration::from_secs(10),
            issue_tracker_token: None,
        }
    }
}

/// Mirror of [`Settings`] with every field optional, deserialized straight
/// from a TOML file and merged onto the defaults one field at a time.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    bind_address: Option<String>,
    store_backend: Option<String>,
    driver_mode: Option<String>,
    container_image: Option<String>,
    worker_entrypoint: Option<String>,
    worker_working_dir: Option<String>,
    auto_dispatch: Option<bool>,
    watcher_poll_interval_secs: Option<u64>,
    monitor_timeout_secs: Option<u64>,
    monitor_poll_interval_secs: Option<u64>,
    monitor_status_update_interval_secs: Option<u64>,
    max_step_retries: Option<u32>,
    max_review_cycles: Option<u32>,
    work_session_inactivity_timeout_secs: Option<u64>,
    queue_depth_poll_interval_secs: Option<u64>,
    shutdown_grace_period_secs: Option<u64>,
}

impl Settings {
    /// Load defaults, overlay an optional `.toml` file at `path` (missing
    /// file is not an error), then overlay environment variables prefixed
    /// `FORGE_`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = Self::default();

        if let Some(path) = path
            && path.exists()
        {
            let text = std::fs::read_to_string(path)?;
            let raw: RawSettings = toml::from_str(&text)?;
            settings.merge(raw);
        }

        settings.merge_env();
        Ok(settings)
    }

    fn merge(&mut self, raw: RawSettings) {
        if let Some(v) = raw.bind_address {
            self.bind_address = v;
        }
        if let Some(v) = raw.store_backend.as_deref().and_then(StoreBackend::parse) {
            self.store_backend = v;
        }
        if let Some(v) = raw.driver_mode.as_deref().and_then(DriverMode::parse) {
            self.driver_mode = v;
        }
        if let Some(v) = raw.container_image {
            self.container_image = v;
        }
        if let Some(v) = raw.worker_entrypoint {
            self.worker_entrypoint = v;
        }
        if let Some(v) = raw.worker_working_dir {
            self.worker_working_dir = v;
        }
        if let Some(v) = raw.auto_dispatch {
            self.auto_dispatch = v;
        }
        if let Some(v) = raw.watcher_poll_interval_secs {
            self.watcher_poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.monitor_timeout_secs {
            self.monitor.timeout = Duration::from_secs(v);
        }
        if let Some(v) = raw.monitor_poll_interval_secs {
            self.monitor.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.monitor_status_update_interval_secs {
            self.monitor.status_update_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.max_step_retries {
            self.limits.max_step_retries = v;
        }
        if let Some(v) = raw.max_review_cycles {
            self.limits.max_review_cycles = v;
        }
        if let Some(v) = raw.work_session_inactivity_timeout_secs {
            self.work_session_inactivity_timeout = Duration::from_secs(v);
        }
        if let Some(v) = raw.queue_depth_poll_interval_secs {
            self.queue_depth_poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.shutdown_grace_period_secs {
            self.shutdown_grace_period = Duration::from_secs(v);
        }
    }

    fn merge_env(&mut self) {
        if let Ok(v) = std::env::var("FORGE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = std::env::var("FORGE_STORE_BACKEND")
            && let Some(v) = StoreBackend::parse(&v)
        {
            self.store_backend = v;
        }
        if let Ok(v) = std::env::var("FORGE_DRIVER_MODE")
            && let Some(v) = DriverMode::parse(&v)
        {
            self.driver_mode = v;
        }
        if let Ok(v) = std::env::var("FORGE_CONTAINER_IMAGE") {
            self.container_image = v;
        }
        if let Ok(v) = std::env::var("FORGE_WORKER_ENTRYPOINT") {
            self.worker_entrypoint = v;
        }
        if let Ok(v) = std::env::var("FORGE_WORKER_WORKING_DIR") {
            self.worker_working_dir = v;
        }
        if let Ok(v) = std::env::var("AUTO_DISPATCH") {
            self.auto_dispatch = v != "0" && !v.eq_ignore_ascii_case("false") && !v.eq_ignore_ascii_case("off");
        }
        if let Ok(v) = std::env::var("FORGE_ISSUE_TRACKER_TOKEN") {
            self.issue_tracker_token = Some(v);
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: self.watcher_poll_interval,
            auto_dispatch: self.auto_dispatch,
            limits: self.limits,
            monitor: self.monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.bind_address, "127.0.0.1:4041");
        assert!(settings.auto_dispatch);
        assert_eq!(settings.store_backend, StoreBackend::Memory);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load(Some(Path::new("/nonexistent/forge.toml"))).unwrap();
        assert_eq!(settings.bind_address, Settings::default().bind_address);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.toml");
        std::fs::write(
            &path,
            "bind_address = \"0.0.0.0:9000\"\nauto_dispatch = false\nmax_step_retries = 3\n",
        )
        .unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.bind_address, "0.0.0.0:9000");
        assert!(!settings.auto_dispatch);
        assert_eq!(settings.limits.max_step_retries, 3);
    }
}
