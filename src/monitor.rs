//! Agent-Run Monitor — drives one launched worker to a terminal state,
//! polling the Worker Driver, mapping its state to the normalized
//! `AgentRunStatus` progression, and publishing both to the Store and the
//! Stream Bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bus::{BusEvent, StreamBus};
use crate::driver::{LaunchHandle, WorkerDriver, WorkerState};
use crate::ids::AgentRunId;
use crate::store::Store;
use crate::store::types::AgentRunStatus;

/// Tuning knobs the Pipeline Engine and Work-Session Manager may override
/// per use; defaults match §4.E.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub status_update_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(10),
            status_update_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of driving a worker to terminal.
#[derive(Debug, Clone)]
pub enum MonitorOutcome {
    Completed { exit_code: i32 },
    Failed { exit_code: Option<i32>, reason: String },
    TimedOut,
}

/// Maps a driver-level [`WorkerState`] to the transient `AgentRunStatus`
/// the Monitor publishes while the worker is still running. The terminal
/// mapping (`Completed`/`Failed`) is handled separately in the poll loop
/// because it also needs the exit code for the summary/reason.
fn transient_status(state: &WorkerState, role_default: AgentRunStatus) -> Option<AgentRunStatus> {
    match state {
        WorkerState::Started => Some(AgentRunStatus::Started),
        WorkerState::Coding => Some(role_default),
        WorkerState::Completed { .. } | WorkerState::Failed { .. } => None,
    }
}

/// Drives one worker, identified by `handle`, to terminal. `role_status` is
/// the transient status published while the worker is running and not yet
/// `Started` — the Pipeline Engine passes `Coding`/`Reviewing`/`Testing`
/// depending on which stage this Monitor belongs to; the Work-Session
/// Manager always passes `Coding`.
pub struct AgentRunMonitor {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkerDriver>,
    bus: StreamBus,
    config: MonitorConfig,
    cancelled: Arc<AtomicBool>,
}

impl AgentRunMonitor {
    pub fn new(store: Arc<dyn Store>, driver: Arc<dyn WorkerDriver>, bus: StreamBus, config: MonitorConfig) -> Self {
        Self {
            store,
            driver,
            bus,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cloneable cancellation flag; the next loop iteration after it is
    /// set finalizes the run as `failed` with reason `"cancelled"`.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub async fn run(
        &self,
        run_id: AgentRunId,
        handle: &LaunchHandle,
        role_status: AgentRunStatus,
    ) -> MonitorOutcome {
        let topic = run_id.to_string();
        let start = Instant::now();
        let mut last_published: Option<AgentRunStatus> = None;
        let mut last_published_at = Instant::now();

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return self.finalize_failed(run_id, None, "cancelled").await;
            }

            if start.elapsed() > self.config.timeout {
                warn!(target: "monitor", run_id = %run_id, "worker timed out");
                let _ = self.driver.terminate(handle, "timed out").await;
                self.finalize_failed(run_id, None, "timed out").await;
                return MonitorOutcome::TimedOut;
            }

            let state = match self.driver.poll(handle).await {
                Ok(state) => state,
                Err(crate::errors::DriverError::NotFound) => {
                    return self.finalize_failed(run_id, None, "Task not found").await;
                }
                Err(e) => {
                    warn!(target: "monitor", run_id = %run_id, error = %e, "poll failed, retrying");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if let Some(new_status) = transient_status(&state, role_status) {
                let changed = last_published != Some(new_status);
                let interval_elapsed = last_published_at.elapsed() >= self.config.status_update_interval;
                if changed || interval_elapsed {
                    if let Err(e) = self.store.update_agent_status(run_id, new_status).await {
                        warn!(target: "monitor", run_id = %run_id, error = %e, "best-effort status update failed");
                    }
                    last_published = Some(new_status);
                    last_published_at = Instant::now();
                }
            }

            for line in self.driver.drain_output(handle).await.unwrap_or_default() {
                self.bus.emit(&topic, BusEvent::Token(line));
            }

            match state {
                WorkerState::Completed { exit_code } => {
                    self.finalize_terminal(
                        run_id,
                        AgentRunStatus::Completed,
                        Some(format!("exit code: {exit_code}")),
                        None,
                    )
                    .await;
                    return MonitorOutcome::Completed { exit_code };
                }
                WorkerState::Failed { exit_code } => {
                    let reason = format!("Exit code: {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()));
                    self.finalize_terminal(run_id, AgentRunStatus::Failed, None, Some(reason.clone()))
                        .await;
                    return MonitorOutcome::Failed { exit_code, reason };
                }
                WorkerState::Started | WorkerState::Coding => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// The terminal completion call is mandatory and retried on transient
    /// failure, bounded at 3 attempts per §4.E.
    async fn finalize_terminal(
        &self,
        run_id: AgentRunId,
        status: AgentRunStatus,
        summary: Option<String>,
        error_message: Option<String>,
    ) {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .complete_agent_run(run_id, status, summary.clone(), error_message.clone())
                .await
            {
                Ok(()) => {
                    info!(target: "monitor", run_id = %run_id, status = %status.as_str(), "agent run finalized");
                    return;
                }
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(target: "monitor", run_id = %run_id, attempt, error = %e, "retrying terminal completion");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!(target: "monitor", run_id = %run_id, error = %e, "failed to finalize agent run after retries");
                    return;
                }
            }
        }
    }

    async fn finalize_failed(&self, run_id: AgentRunId, exit_code: Option<i32>, reason: &str) -> MonitorOutcome {
        self.finalize_terminal(run_id, AgentRunStatus::Failed, None, Some(reason.to_string()))
            .await;
        MonitorOutcome::Failed {
            exit_code,
            reason: reason.to_string(),
        }
    }
}
