//! Installation-credential resolution for the Pipeline Engine's per-stage
//! token refresh (§9 "per-pipeline retry token refresh"): the external-
//! system token used by the Worker Driver and the Sync Hook may expire
//! between stages, so the Pipeline re-resolves it at the start of every
//! stage rather than caching one token for the whole run.
//!
//! This is the same kind of seam `Store` is for persistence: a trait the
//! Pipeline Engine depends on, with an in-process implementation standing
//! in for the real collaborator (an installation-token-minting service,
//! analogous to the teacher's GitHub device-flow token exchange in
//! `factory::github`) until one exists.

use async_trait::async_trait;

use crate::ids::ProjectId;

/// Resolves a fresh access token for a project's installation on demand.
/// `None` means the project has no external-system integration configured
/// (the common case for this reference implementation), not an error —
/// callers already treat a missing token as "sync hook disabled."
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve_token(&self, project_id: ProjectId) -> Option<String>;
}

/// Returns the same configured token for every project, every call. Stands
/// in for a real installation-token broker (one that would mint/refresh a
/// short-lived token per project from a stored installation credential);
/// this control-plane core has no such broker, so every stage's refresh
/// re-reads the one statically configured token instead of minting a new
/// one. The re-resolution call still happens per stage, so swapping in a
/// real broker later is a change to this impl alone.
pub struct StaticCredentialProvider {
    token: Option<String>,
}

impl StaticCredentialProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn resolve_token(&self, _project_id: ProjectId) -> Option<String> {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_the_configured_token_for_any_project() {
        let provider = StaticCredentialProvider::new(Some("tok-123".to_string()));
        assert_eq!(provider.resolve_token(ProjectId(1)).await, Some("tok-123".to_string()));
        assert_eq!(provider.resolve_token(ProjectId(2)).await, Some("tok-123".to_string()));
    }

    #[tokio::test]
    async fn static_provider_with_no_token_configured_resolves_none() {
        let provider = StaticCredentialProvider::new(None);
        assert_eq!(provider.resolve_token(ProjectId(1)).await, None);
    }
}
