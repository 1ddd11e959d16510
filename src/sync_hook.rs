//! External-System Sync Hook — best-effort, strictly non-blocking status
//! and comment pushes to the issue tracker a feature is linked to. Every
//! event handler swallows its own errors; nothing here ever affects a
//! pipeline's outcome.

use reqwest::Client;
use tracing::warn;

/// One sync hook call's worth of config. The Pipeline Engine builds a fresh
/// value of this (via its `CredentialProvider`) before every call it makes
/// into this module, rather than holding one `ExternalSyncHook` for the
/// life of a run — the access token may expire between stages, per the
/// "per-pipeline retry token refresh" design note.
#[derive(Debug, Clone)]
pub struct SyncHookConfig {
    pub access_token: Option<String>,
    pub external_issue_id: Option<String>,
    pub feature_name: String,
    pub api_base: String,
}

/// Best-effort sync hook. On missing credentials every method is a no-op.
pub struct ExternalSyncHook {
    config: SyncHookConfig,
    client: Client,
}

impl ExternalSyncHook {
    pub fn new(config: SyncHookConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn enabled(&self) -> bool {
        self.config.access_token.is_some() && self.config.external_issue_id.is_some()
    }

    pub async fn on_pipeline_start(&self) {
        if !self.enabled() {
            return;
        }
        if let Err(e) = self.set_state("in progress").await {
            warn!(target: "sync_hook", feature = %self.config.feature_name, error = %e, "failed to report pipeline start");
        }
    }

    pub async fn on_pipeline_success(&self, pr_url: Option<&str>) {
        if !self.enabled() {
            return;
        }
        if let Err(e) = self.set_state("done").await {
            warn!(target: "sync_hook", feature = %self.config.feature_name, error = %e, "failed to report pipeline success");
        }
        let comment = match pr_url {
            Some(url) => format!("All pipeline stages passed. Pull request: {url}"),
            None => "All pipeline stages passed; ready for review.".to_string(),
        };
        if let Err(e) = self.post_comment(&comment).await {
            warn!(target: "sync_hook", feature = %self.config.feature_name, error = %e, "failed to post success comment");
        }
    }

    pub async fn on_pipeline_failure(&self, failed_step: &str, message: &str) {
        if !self.enabled() {
            return;
        }
        if let Err(e) = self.set_state("failing").await {
            warn!(target: "sync_hook", feature = %self.config.feature_name, error = %e, "failed to report pipeline failure");
        }
        let comment = format!("Pipeline failed at step `{failed_step}`: {message}");
        if let Err(e) = self.post_comment(&comment).await {
            warn!(target: "sync_hook", feature = %self.config.feature_name, error = %e, "failed to post failure comment");
        }
    }

    async fn set_state(&self, state: &str) -> Result<(), reqwest::Error> {
        let Some(token) = &self.config.access_token else {
            return Ok(());
        };
        let Some(issue_id) = &self.config.external_issue_id else {
            return Ok(());
        };
        let url = format!("{}/issues/{}/state", self.config.api_base, issue_id);
        self.client
            .patch(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "state": state }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_comment(&self, body: &str) -> Result<(), reqwest::Error> {
        let Some(token) = &self.config.access_token else {
            return Ok(());
        };
        let Some(issue_id) = &self.config.external_issue_id else {
            return Ok(());
        };
        let url = format!("{}/issues/{}/comments", self.config.api_base, issue_id);
        self.client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_creds_config() -> SyncHookConfig {
        SyncHookConfig {
            access_token: None,
            external_issue_id: None,
            feature_name: "widget".into(),
            api_base: "https://example.invalid".into(),
        }
    }

    #[tokio::test]
    async fn missing_credentials_make_every_method_a_no_op() {
        let hook = ExternalSyncHook::new(no_creds_config());
        // None of these should attempt network I/O or panic.
        hook.on_pipeline_start().await;
        hook.on_pipeline_success(Some("https://example.invalid/pr/1")).await;
        hook.on_pipeline_failure("coder", "exit code 1").await;
    }
}
