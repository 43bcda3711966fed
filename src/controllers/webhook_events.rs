/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/webhook_events.rs
*
* Deserialization types for the GitHub webhook payloads the autoscaler acts
* on. Only the fields the dispatcher consumes are modeled; everything else
* in a delivery is ignored.
*
* SPDX-License-Identifier: Apache-2.0
*/

use serde::Deserialize;

/// Repository block shared by all repository-scoped events.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    pub owner: Option<WebhookAccount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAccount {
    #[serde(default)]
    pub login: String,
    /// `User` or `Organization`.
    #[serde(default, rename = "type")]
    pub account_type: String,
}

/// Extracts `(repo_name, owner_login, owner_type)` with empty-string
/// defaults for anything the payload omitted.
pub fn repo_context(repository: &Option<WebhookRepository>) -> (String, String, String) {
    let Some(repository) = repository else {
        return (String::new(), String::new(), String::new());
    };
    let (login, account_type) = match &repository.owner {
        Some(owner) => (owner.login.clone(), owner.account_type.clone()),
        None => (String::new(), String::new()),
    };
    (repository.name.clone(), login, account_type)
}

#[derive(Debug, Deserialize)]
pub struct PushEvent {
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    pub repository: Option<WebhookRepository>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: Option<String>,
    pub repository: Option<WebhookRepository>,
    pub pull_request: Option<PullRequest>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub base: Option<GitReference>,
}

#[derive(Debug, Deserialize)]
pub struct GitReference {
    #[serde(default, rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunEvent {
    pub action: Option<String>,
    pub check_run: Option<CheckRun>,
    pub repository: Option<WebhookRepository>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRun {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: Option<String>,
    pub workflow_job: Option<WorkflowJob>,
    pub repository: Option<WebhookRepository>,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowJob {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct PingEvent {
    #[serde(default)]
    pub zen: String,
}

/// Minimal shape for recovering the enterprise slug, which is not uniformly
/// present in the typed events.
#[derive(Debug, Default, Deserialize)]
pub struct EnterpriseFragment {
    pub enterprise: Option<EnterpriseInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnterpriseInfo {
    #[serde(default)]
    pub slug: String,
}

impl EnterpriseFragment {
    pub fn slug(&self) -> String {
        self.enterprise
            .as_ref()
            .map(|e| e.slug.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workflow_job_event() {
        let payload = r#"{
            "action": "queued",
            "workflow_job": {
                "id": 2832853555,
                "status": "queued",
                "labels": ["self-hosted", "linux"]
            },
            "repository": {
                "name": "web",
                "full_name": "acme/web",
                "owner": {"login": "acme", "type": "Organization"}
            }
        }"#;

        let event: WorkflowJobEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.action.as_deref(), Some("queued"));
        assert_eq!(
            event.workflow_job.unwrap().labels,
            vec!["self-hosted", "linux"]
        );
        let (repo, owner, owner_type) = repo_context(&event.repository);
        assert_eq!(repo, "web");
        assert_eq!(owner, "acme");
        assert_eq!(owner_type, "Organization");
    }

    #[test]
    fn test_parse_check_run_event() {
        let payload = r#"{
            "action": "created",
            "check_run": {"status": "queued"},
            "repository": {
                "name": "web",
                "owner": {"login": "octocat", "type": "User"}
            }
        }"#;

        let event: CheckRunEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.action.as_deref(), Some("created"));
        assert_eq!(event.check_run.unwrap().status, "queued");
        let (_, _, owner_type) = repo_context(&event.repository);
        assert_eq!(owner_type, "User");
    }

    #[test]
    fn test_enterprise_slug_extraction() {
        let fragment: EnterpriseFragment =
            serde_json::from_str(r#"{"enterprise": {"slug": "contoso"}}"#).unwrap();
        assert_eq!(fragment.slug(), "contoso");

        let fragment: EnterpriseFragment = serde_json::from_str("{}").unwrap();
        assert_eq!(fragment.slug(), "");
    }

    #[test]
    fn test_repo_context_defaults_when_absent() {
        let (repo, owner, owner_type) = repo_context(&None);
        assert!(repo.is_empty() && owner.is_empty() && owner_type.is_empty());
    }
}
