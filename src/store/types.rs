//! Domain types shared by the Store Gateway contract and everything that
//! calls it: `Project`, `Feature`, `AgentRun`, `AgentMessage`, `AgentThread`,
//! `QueueEntry`, plus their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentRunId, FeatureId, JobId, ProjectId, ThreadId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub repo_url: Option<String>,
    pub default_branch: String,
    pub concurrency_cap: u32,
    pub issue_tracker_ref: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    ReviewReady,
    Passing,
    Failing,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::ReviewReady => "review_ready",
            Self::Passing => "passing",
            Self::Failing => "failing",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "review_ready" => Ok(Self::ReviewReady),
            "passing" => Ok(Self::Passing),
            "failing" => Ok(Self::Failing),
            _ => Err(format!("invalid feature status: {}", s)),
        }
    }

    /// Whether `self` may transition to `target` per the DAG in the data model.
    pub fn can_transition_to(&self, target: FeatureStatus) -> bool {
        use FeatureStatus::*;
        matches!(
            (self, target),
            (Pending, InProgress)
                | (InProgress, ReviewReady)
                | (InProgress, Failing)
                | (ReviewReady, Passing)
                | (Failing, Pending)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub project_id: ProjectId,
    pub name: String,
    pub description: String,
    pub priority: i32,
    pub category: String,
    pub status: FeatureStatus,
    pub dependencies: Vec<FeatureId>,
    pub issue_tracker_ref: Option<String>,
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Coder,
    Reviewer,
    Tester,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Started,
    Thinking,
    Coding,
    Testing,
    Reviewing,
    Completed,
    Failed,
}

impl AgentRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::Coding => "coding",
            Self::Testing => "testing",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: AgentRunId,
    pub project_id: ProjectId,
    pub feature_id: FeatureId,
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Message,
    Status,
    Error,
    Quiz,
    PrReady,
    PrCreated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: i64,
    pub run_id: AgentRunId,
    pub thread_id: Option<ThreadId>,
    pub sender: MessageSender,
    pub message_type: MessageType,
    pub role: AgentRole,
    pub content: String,
    /// Monotonic per-run sequence number, used as the SSE `Last-Event-ID`.
    pub seq: u64,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Chat,
    Work,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThread {
    pub id: ThreadId,
    pub agent_id: String,
    pub project_id: ProjectId,
    pub title: String,
    pub mode: ThreadMode,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueuedBy {
    User,
    Auto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub agent_id: String,
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub prompt: String,
    pub thread_id: Option<ThreadId>,
    pub queued_by: QueuedBy,
    pub status: JobStatus,
    pub position: i64,
    pub queued_at: DateTime<Utc>,
    pub feature_id: Option<FeatureId>,
}

/// Sparse position step used for new enqueues — leaves gaps for O(1) reorder.
pub const QUEUE_POSITION_STEP: i64 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_status_transition_dag() {
        assert!(FeatureStatus::Pending.can_transition_to(FeatureStatus::InProgress));
        assert!(FeatureStatus::InProgress.can_transition_to(FeatureStatus::ReviewReady));
        assert!(FeatureStatus::InProgress.can_transition_to(FeatureStatus::Failing));
        assert!(FeatureStatus::ReviewReady.can_transition_to(FeatureStatus::Passing));
        assert!(FeatureStatus::Failing.can_transition_to(FeatureStatus::Pending));
    }

    #[test]
    fn feature_status_rejects_transitions_out_of_terminal_states() {
        assert!(!FeatureStatus::Passing.can_transition_to(FeatureStatus::Pending));
        assert!(!FeatureStatus::ReviewReady.can_transition_to(FeatureStatus::Failing));
    }

    #[test]
    fn feature_status_round_trips_through_as_str() {
        for status in [
            FeatureStatus::Pending,
            FeatureStatus::InProgress,
            FeatureStatus::ReviewReady,
            FeatureStatus::Passing,
            FeatureStatus::Failing,
        ] {
            assert_eq!(FeatureStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn agent_run_status_terminality() {
        assert!(AgentRunStatus::Completed.is_terminal());
        assert!(AgentRunStatus::Failed.is_terminal());
        assert!(!AgentRunStatus::Thinking.is_terminal());
    }
}
