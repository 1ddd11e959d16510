//! Typed error hierarchy for the orchestrator control-plane.
//!
//! Four top-level enums cover the four seams described in the design:
//! - `StoreError` — the Store Gateway's contract made concrete
//! - `DriverError` — worker launch/poll/terminate failures
//! - `PipelineError` — a single pipeline stage run
//! - `ApiError` — the HTTP surface's response mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::ids::{FeatureId, ProjectId};

/// Errors surfaced by the Store Gateway.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The store itself is unavailable or overloaded; the caller should retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The store rejected the operation outright; retrying will not help.
    #[error("permanent store error: {0}")]
    Permanent(String),

    /// A conditional claim lost its race (CAS precondition violated).
    #[error("feature {0:?} already claimed")]
    AlreadyClaimed(FeatureId),

    /// A status transition was attempted that the state machine forbids.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Adding a dependency edge would create a cycle in the feature graph.
    #[error("adding dependency {dependency:?} to {feature:?} would create a cycle")]
    CyclicDependency { feature: FeatureId, dependency: FeatureId },
}

impl StoreError {
    /// Whether retrying the same call, unchanged, might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors surfaced by a `WorkerDriver` implementation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("worker not found")]
    NotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from running a single pipeline stage to completion.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {role} failed: exit code {exit_code:?}, {reason}")]
    Stage {
        role: crate::store::types::AgentRole,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors returned to HTTP clients by the control-plane surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("concurrency cap reached for project {0:?}")]
    TooManyRequests(ProjectId),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyClaimed(id) => {
                ApiError::Conflict(format!("feature {:?} already claimed", id))
            }
            StoreError::InvalidTransition { from, to } => {
                ApiError::Conflict(format!("invalid transition from {} to {}", from, to))
            }
            StoreError::NotFound { kind, id } => ApiError::NotFound(format!("{} {} not found", kind, id)),
            StoreError::CyclicDependency { feature, dependency } => ApiError::Conflict(format!(
                "adding dependency {:?} to {:?} would create a cycle",
                dependency, feature
            )),
            StoreError::Permanent(msg) => ApiError::Internal(msg),
            StoreError::Transient(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(project_id) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("concurrency cap reached for project {:?}", project_id),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_transient_is_matchable() {
        let err = StoreError::Transient("timeout".into());
        assert!(err.is_transient());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn store_error_already_claimed_carries_id() {
        let err = StoreError::AlreadyClaimed(FeatureId(7));
        assert!(err.to_string().contains("7"));
    }

    #[test]
    fn api_error_maps_already_claimed_to_conflict() {
        let err: ApiError = StoreError::AlreadyClaimed(FeatureId(3)).into();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn api_error_maps_not_found() {
        let err: ApiError = StoreError::NotFound {
            kind: "feature",
            id: "9".into(),
        }
        .into();
        match err {
            ApiError::NotFound(msg) => assert!(msg.contains("feature")),
            _ => panic!("expected NotFound"),
        }
    }

    #[test]
    fn pipeline_error_converts_from_store_error() {
        let inner = StoreError::Permanent("disk full".into());
        let err: PipelineError = inner.into();
        match err {
            PipelineError::Store(StoreError::Permanent(msg)) => assert_eq!(msg, "disk full"),
            _ => panic!("expected PipelineError::Store"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::Permanent("x".into()));
        assert_std_error(&DriverError::NotFound);
        assert_std_error(&ApiError::Internal("x".into()));
    }
}
