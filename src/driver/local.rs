//! Local-process Worker Driver variant. Spawns the fixed worker entrypoint
//! script as a child process and tracks its stdout lines for replay.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::driver::{DriverError, LaunchHandle, WorkerDriver, WorkerSpec, WorkerState};

struct RunningProcess {
    child: Child,
    lines: Arc<Mutex<Vec<String>>>,
    /// `None` once `poll` observes the child has exited and drops it, or for
    /// a driver never asked to accept input.
    stdin: Option<ChildStdin>,
}

/// Launches workers as OS processes via `tokio::process::Command`, the
/// backing mechanism for single-machine or bare-metal installations that
/// have no container runtime available.
pub struct LocalProcessDriver {
    entrypoint: String,
    working_dir: String,
    running: Arc<Mutex<HashMap<String, RunningProcess>>>,
}

impl LocalProcessDriver {
    pub fn new(entrypoint: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            working_dir: working_dir.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkerDriver for LocalProcessDriver {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchHandle, DriverError> {
        let mut cmd = Command::new(&self.entrypoint);
        cmd.current_dir(&self.working_dir)
            .args(&spec.argv_extra)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in spec.env_map() {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(DriverError::Io)?;
        let pid = child.id().ok_or(DriverError::LaunchFailed(
            "child exited before pid was observed".to_string(),
        ))?;
        let handle = LaunchHandle(pid.to_string());
        let stdin = child.stdin.take();

        let lines = Arc::new(Mutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            let lines = lines.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().await.push(line);
                }
            });
        }

        self.running
            .lock()
            .await
            .insert(handle.0.clone(), RunningProcess { child, lines, stdin });
        Ok(handle)
    }

    async fn poll(&self, handle: &LaunchHandle) -> Result<WorkerState, DriverError> {
        let mut running = self.running.lock().await;
        let entry = running.get_mut(&handle.0).ok_or(DriverError::NotFound)?;
        let state = match entry.child.try_wait().map_err(DriverError::Io)? {
            None => WorkerState::Coding,
            Some(status) => {
                let code = status.code();
                match code {
                    Some(0) => WorkerState::Completed { exit_code: 0 },
                    other => WorkerState::Failed { exit_code: other },
                }
            }
        };
        // A terminal state is never re-observed by any caller — both the
        // Agent-Run Monitor and the Work-Session Manager return as soon as
        // `poll` reports one — so this is the one safe place to reap the
        // entry and stop holding the child/stdin open for the rest of the
        // daemon's lifetime.
        if state.is_terminal() {
            running.remove(&handle.0);
        }
        Ok(state)
    }

    async fn drain_output(&self, handle: &LaunchHandle) -> Result<Vec<String>, DriverError> {
        let running = self.running.lock().await;
        let entry = running.get(&handle.0).ok_or(DriverError::NotFound)?;
        let mut lines = entry.lines.lock().await;
        Ok(std::mem::take(&mut *lines))
    }

    async fn terminate(&self, handle: &LaunchHandle, _reason: &str) -> Result<(), DriverError> {
        let mut running = self.running.lock().await;
        if let Some(entry) = running.get_mut(&handle.0) {
            let _ = entry.child.start_kill();
        }
        running.remove(&handle.0);
        Ok(())
    }

    async fn send_input(&self, handle: &LaunchHandle, text: &str) -> Result<(), DriverError> {
        let mut running = self.running.lock().await;
        let entry = running.get_mut(&handle.0).ok_or(DriverError::NotFound)?;
        let stdin = entry
            .stdin
            .as_mut()
            .ok_or_else(|| DriverError::LaunchFailed("worker has no stdin pipe".to_string()))?;
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(DriverError::Io)?;
        stdin.flush().await.map_err(DriverError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{FeatureId, ProjectId};
    use crate::store::types::AgentRole;

    fn sample_spec() -> WorkerSpec {
        WorkerSpec {
            role: AgentRole::Coder,
            repo_url: "https://example.invalid/repo.git".into(),
            feature_id: FeatureId(1),
            project_id: ProjectId(1),
            feature_name: "add widget".into(),
            feature_description: "add a widget".into(),
            base_branch: "main".into(),
            argv_extra: vec![],
            access_token: None,
        }
    }

    #[tokio::test]
    async fn launch_and_poll_a_short_lived_process() {
        let driver = LocalProcessDriver::new("true", "/tmp");
        let handle = driver.launch(&sample_spec()).await.unwrap();
        // Give the process a moment to exit.
        for _ in 0..50 {
            let state = driver.poll(&handle).await.unwrap();
            if state.is_terminal() {
                assert_eq!(state, WorkerState::Completed { exit_code: 0 });
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("process never reached a terminal state");
    }

    #[tokio::test]
    async fn poll_unknown_handle_is_not_found() {
        let driver = LocalProcessDriver::new("true", "/tmp");
        let err = driver.poll(&LaunchHandle("nope".into())).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound));
    }
}
