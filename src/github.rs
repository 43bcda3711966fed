/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/github.rs
*
* Authenticated client for the GitHub REST API, scoped to what the runner
* operator needs: issuing runner registration tokens, listing and removing
* runners, discovering the runner groups a repository can reach, and listing
* workflow runs.
*
* Architecture:
* - Three authentication modes are supported, selected in priority order:
*   basic auth, a static bearer token, and GitHub App installation auth
*   (an RS256-signed app JWT exchanged for a cached installation token).
* - Enterprise deployments get their API base URL normalized (`api/v3/`
*   appended unless the host already is an API host), and the browser-facing
*   base URL is derived from it by stripping that suffix back off.
* - Registration tokens are cached per (enterprise, org, repo) scope under a
*   single async lock; a successful issuance spawns a sweep that drops
*   expired entries under the same lock.
* - All list endpoints paginate with `per_page=100`, following the `Link`
*   header until no `rel="next"` remains.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::metrics;

const USER_AGENT: &str = "ph-runner-operator";

/// Grace period granted to runners that are just starting up and may miss a
/// token expiration date by a bit.
const RUNNER_STARTUP_GRACE: i64 = 3;

// --- Errors ---

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("enterprise, organization and repository are all empty")]
    EmptyScope,

    #[error("invalid repository name: '{0}'")]
    InvalidRepositoryName(String),

    #[error("unexpected status: {0}")]
    UnexpectedStatus(u16),

    #[error("runner {name:?} not found")]
    RunnerNotFound { name: String },

    /// The runner exists but is offline. `busy` still reflects the state the
    /// API reported for it.
    #[error("runner {name:?} offline")]
    RunnerOffline { name: String, busy: bool },

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("authentication failed: using private key at {path}: {reason}")]
    AppAuthFile { path: String, reason: String },

    #[error("authentication failed: using private key of size {key_size} ({first_line}...): {reason}")]
    AppAuth {
        key_size: usize,
        first_line: String,
        reason: String,
    },

    #[error("signing app jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("app installation token request failed with status {0}")]
    InstallationToken(u16),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{what}: {source}")]
    Wrapped {
        what: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

fn wrap(what: &'static str) -> impl FnOnce(Error) -> Error {
    move |source| Error::Wrapped {
        what,
        source: Box::new(source),
    }
}

// --- Configuration ---

/// Connection and authentication settings for the GitHub client.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub enterprise_url: String,
    pub app_id: i64,
    pub app_installation_id: i64,
    /// Path to a PEM file if one exists at this value, otherwise the PEM
    /// bytes themselves.
    pub app_private_key: String,
    pub token: String,
    pub url: String,
    pub upload_url: String,
    pub basicauth_username: String,
    pub basicauth_password: String,
    pub runner_github_url: String,
}

impl Config {
    /// Load the client configuration from `GITHUB_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            enterprise_url: env_or_default("GITHUB_ENTERPRISE_URL"),
            app_id: env_i64("GITHUB_APP_ID"),
            app_installation_id: env_i64("GITHUB_APP_INSTALLATION_ID"),
            app_private_key: env_or_default("GITHUB_APP_PRIVATE_KEY"),
            token: env_or_default("GITHUB_TOKEN"),
            url: env_or_default("GITHUB_URL"),
            upload_url: env_or_default("GITHUB_UPLOAD_URL"),
            basicauth_username: env_or_default("GITHUB_BASICAUTH_USERNAME"),
            basicauth_password: env_or_default("GITHUB_BASICAUTH_PASSWORD"),
            runner_github_url: env_or_default("GITHUB_RUNNER_GITHUB_URL"),
        }
    }

    /// Whether any authentication mode is configured at all. Without one the
    /// operator runs webhook-only and skips runner-group visibility checks.
    pub fn is_configured(&self) -> bool {
        (!self.basicauth_username.is_empty() && !self.basicauth_password.is_empty())
            || !self.token.is_empty()
            || !self.app_private_key.is_empty()
    }

    /// Build a [`Client`] from this configuration.
    pub fn new_client(&self) -> Result<Client> {
        let auth = if !self.basicauth_username.is_empty() && !self.basicauth_password.is_empty() {
            Auth::Basic {
                username: self.basicauth_username.clone(),
                password: self.basicauth_password.clone(),
            }
        } else if !self.token.is_empty() {
            Auth::Token(self.token.clone())
        } else {
            Auth::App(self.app_auth()?)
        };

        let (api_base, github_base_url) = if !self.enterprise_url.is_empty() {
            let api = format!(
                "{}/",
                enterprise_api_url(&self.enterprise_url).map_err(wrap("enterprise url incorrect"))?
            );
            let browser = api
                .strip_suffix("api/v3/")
                .unwrap_or(api.as_str())
                .to_string();
            (Url::parse(&api)?, browser)
        } else {
            let base = if self.url.is_empty() {
                "https://api.github.com/".to_string()
            } else {
                ensure_trailing_slash(&self.url)
            };
            // The upload URL is not consumed by any operator endpoint; it is
            // still parsed so a misconfiguration surfaces at startup.
            if !self.upload_url.is_empty() {
                Url::parse(&ensure_trailing_slash(&self.upload_url))?;
            }
            let browser = if self.runner_github_url.is_empty() {
                "https://github.com/".to_string()
            } else {
                ensure_trailing_slash(&self.runner_github_url)
            };
            (Url::parse(&base)?, browser)
        };

        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Client {
            http,
            auth,
            api_base,
            github_base_url,
            reg_tokens: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn app_auth(&self) -> Result<AppAuth> {
        let key = if Path::new(&self.app_private_key).is_file() {
            let pem = std::fs::read(&self.app_private_key).map_err(|e| Error::AppAuthFile {
                path: self.app_private_key.clone(),
                reason: e.to_string(),
            })?;
            EncodingKey::from_rsa_pem(&pem).map_err(|e| Error::AppAuthFile {
                path: self.app_private_key.clone(),
                reason: e.to_string(),
            })?
        } else {
            EncodingKey::from_rsa_pem(self.app_private_key.as_bytes()).map_err(|e| {
                Error::AppAuth {
                    key_size: self.app_private_key.len(),
                    first_line: self
                        .app_private_key
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .to_string(),
                    reason: e.to_string(),
                }
            })?
        };

        Ok(AppAuth {
            app_id: self.app_id,
            installation_id: self.app_installation_id,
            key,
            cached: Mutex::new(None),
        })
    }
}

fn env_or_default(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_i64(name: &str) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

// --- Authentication ---

enum Auth {
    Basic { username: String, password: String },
    Token(String),
    App(AppAuth),
}

struct AppAuth {
    app_id: i64,
    installation_id: i64,
    key: EncodingKey,
    cached: Mutex<Option<InstallationToken>>,
}

#[derive(Debug, Clone, Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

impl AppAuth {
    fn signed_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppJwtClaims {
            // Allow for clock drift between us and GitHub.
            iat: now - 60,
            exp: now + 9 * 60,
            iss: self.app_id.to_string(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }
}

// --- API models ---

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub busy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerGroup {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub visibility: String,
    /// True for enterprise runner groups inherited by the organization.
    #[serde(default)]
    pub inherited: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct RunnerPage {
    #[serde(default)]
    runners: Vec<Runner>,
}

#[derive(Debug, Deserialize)]
struct RunnerGroupPage {
    #[serde(default)]
    runner_groups: Vec<RunnerGroup>,
}

#[derive(Debug, Deserialize)]
struct GroupRepositoryPage {
    #[serde(default)]
    repositories: Vec<GroupRepository>,
}

#[derive(Debug, Deserialize)]
struct GroupRepository {
    #[serde(default)]
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

// --- Scope dispatch ---

/// The endpoint family a call targets. Repository scope wins over
/// organization scope, which wins over enterprise scope.
#[derive(Debug, Clone, PartialEq)]
enum Scope {
    Repo { owner: String, repo: String },
    Org(String),
    Enterprise(String),
}

impl Scope {
    fn runners_root(&self) -> String {
        match self {
            Scope::Repo { owner, repo } => format!("repos/{owner}/{repo}/actions/runners"),
            Scope::Org(org) => format!("orgs/{org}/actions/runners"),
            Scope::Enterprise(enterprise) => {
                format!("enterprises/{enterprise}/actions/runners")
            }
        }
    }

    fn registration_token_path(&self) -> String {
        format!("{}/registration-token", self.runners_root())
    }

    fn runner_path(&self, runner_id: i64) -> String {
        format!("{}/{}", self.runners_root(), runner_id)
    }
}

fn resolve_scope(enterprise: &str, org: &str, repo: &str) -> Result<Scope> {
    if !repo.is_empty() {
        let (owner, name) = split_owner_and_repo(repo)?;
        return Ok(Scope::Repo {
            owner: owner.to_string(),
            repo: name.to_string(),
        });
    }
    if !org.is_empty() {
        return Ok(Scope::Org(org.to_string()));
    }
    if !enterprise.is_empty() {
        return Ok(Scope::Enterprise(enterprise.to_string()));
    }
    Err(Error::EmptyScope)
}

fn split_owner_and_repo(repo: &str) -> Result<(&str, &str)> {
    let mut chunks = repo.split('/');
    match (chunks.next(), chunks.next(), chunks.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() || !name.is_empty() => {
            Ok((owner, name))
        }
        _ => Err(Error::InvalidRepositoryName(repo.to_string())),
    }
}

fn registration_key(org: &str, repo: &str, enterprise: &str) -> String {
    format!("org={org},repo={repo},enterprise={enterprise}")
}

fn token_is_fresh(token: &RegistrationToken, now: DateTime<Utc>) -> bool {
    token.expires_at > now + ChronoDuration::minutes(RUNNER_STARTUP_GRACE)
}

// --- Client ---

/// GitHub API client with a registration token cache.
pub struct Client {
    http: reqwest::Client,
    auth: Auth,
    api_base: Url,
    /// Browser-facing GitHub base URL, without the API suffix. Runner pods
    /// use it to reach the web UI side of the deployment.
    pub github_base_url: String,
    reg_tokens: Arc<Mutex<HashMap<String, RegistrationToken>>>,
}

impl Client {
    /// Returns a registration token for the given scope, reusing a cached
    /// token while it stays comfortably ahead of its expiration.
    pub async fn get_registration_token(
        &self,
        enterprise: &str,
        org: &str,
        repo: &str,
        name: &str,
    ) -> Result<RegistrationToken> {
        let mut tokens = self.reg_tokens.lock().await;

        let key = registration_key(org, repo, enterprise);
        if let Some(cached) = tokens.get(&key) {
            if token_is_fresh(cached, Utc::now()) {
                metrics::REGISTRATION_TOKEN_CACHE_TOTAL
                    .with_label_values(&["hit"])
                    .inc();
                debug!(runner = %name, key = %key, "registration token cache hit");
                return Ok(cached.clone());
            }
        }
        metrics::REGISTRATION_TOKEN_CACHE_TOTAL
            .with_label_values(&["miss"])
            .inc();

        let scope = resolve_scope(enterprise, org, repo)?;
        let res = self
            .send(Method::POST, self.url(&scope.registration_token_path())?)
            .await
            .map_err(wrap("failed to create registration token"))?;
        if res.status().as_u16() != 201 {
            return Err(Error::UnexpectedStatus(res.status().as_u16()));
        }
        let token: RegistrationToken = res
            .json()
            .await
            .map_err(Error::from)
            .map_err(wrap("failed to create registration token"))?;

        tokens.insert(key, token.clone());

        let cache = Arc::clone(&self.reg_tokens);
        tokio::spawn(async move {
            cleanup_expired_tokens(cache).await;
        });

        info!(runner = %name, "issued new registration token");
        Ok(token)
    }

    /// Removes the runner with the given id from the scope.
    pub async fn remove_runner(
        &self,
        enterprise: &str,
        org: &str,
        repo: &str,
        runner_id: i64,
    ) -> Result<()> {
        let scope = resolve_scope(enterprise, org, repo)?;
        let res = self
            .send(Method::DELETE, self.url(&scope.runner_path(runner_id))?)
            .await
            .map_err(wrap("failed to remove runner"))?;
        if res.status().as_u16() != 204 {
            return Err(Error::UnexpectedStatus(res.status().as_u16()));
        }
        Ok(())
    }

    /// Lists every runner registered in the scope.
    pub async fn list_runners(
        &self,
        enterprise: &str,
        org: &str,
        repo: &str,
    ) -> Result<Vec<Runner>> {
        let scope = resolve_scope(enterprise, org, repo)?;
        let first = self.url(&format!("{}?per_page=100", scope.runners_root()))?;
        self.paginated::<RunnerPage, Runner>(first, "failed to list runners", |p| p.runners)
            .await
    }

    /// Whether the named runner is currently executing a job.
    pub async fn is_runner_busy(
        &self,
        enterprise: &str,
        org: &str,
        repo: &str,
        name: &str,
    ) -> Result<bool> {
        let runners = self.list_runners(enterprise, org, repo).await?;
        runner_busy_status(&runners, name)
    }

    /// Returns the enterprise and organization runner groups reachable from
    /// `owner/repo`, restricted to the supplied candidate group names.
    ///
    /// A group with `visibility == "all"` is reachable outright; otherwise
    /// the group's repository access list must contain the repository. An
    /// empty `org` yields `([], [])` without any API call.
    pub async fn get_runner_groups_from_repository(
        &self,
        org: &str,
        repo: &str,
        candidate_enterprise_groups: &[String],
        candidate_org_groups: &[String],
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut enterprise_groups = Vec::new();
        let mut org_groups = Vec::new();

        if org.is_empty() {
            return Ok((enterprise_groups, org_groups));
        }

        for group in self.organization_runner_groups(org).await? {
            if group.inherited {
                if !candidate_enterprise_groups.contains(&group.name) {
                    continue;
                }
                if group.visibility == "all"
                    || self
                        .group_has_repo_access(org, group.id, repo)
                        .await?
                {
                    enterprise_groups.push(group.name);
                }
            } else {
                if !candidate_org_groups.contains(&group.name) {
                    continue;
                }
                if group.visibility == "all"
                    || self
                        .group_has_repo_access(org, group.id, repo)
                        .await?
                {
                    org_groups.push(group.name);
                }
            }
        }

        Ok((enterprise_groups, org_groups))
    }

    /// Lists the repository's queued and in-progress workflow runs.
    pub async fn list_repository_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let mut runs = self
            .workflow_runs_by_status(owner, repo, "queued")
            .await
            .map_err(wrap("listing queued workflow runs"))?;
        let in_progress = self
            .workflow_runs_by_status(owner, repo, "in_progress")
            .await
            .map_err(wrap("listing in_progress workflow runs"))?;
        runs.extend(in_progress);
        Ok(runs)
    }

    // --- endpoint helpers ---

    async fn organization_runner_groups(&self, org: &str) -> Result<Vec<RunnerGroup>> {
        let first = self.url(&format!("orgs/{org}/actions/runner-groups?per_page=100"))?;
        self.paginated::<RunnerGroupPage, RunnerGroup>(
            first,
            "failed to list organization runner groups",
            |p| p.runner_groups,
        )
        .await
    }

    async fn group_has_repo_access(&self, org: &str, group_id: i64, repo: &str) -> Result<bool> {
        let mut url = self.url(&format!(
            "orgs/{org}/actions/runner-groups/{group_id}/repositories?per_page=100"
        ))?;
        loop {
            let res = self
                .send(Method::GET, url)
                .await
                .map_err(wrap("failed to list repository access for runner group"))?;
            let next = next_page_url(res.headers());
            let page: GroupRepositoryPage = res
                .json()
                .await
                .map_err(Error::from)
                .map_err(wrap("failed to list repository access for runner group"))?;
            if page.repositories.iter().any(|r| r.full_name == repo) {
                return Ok(true);
            }
            match next {
                Some(n) => url = Url::parse(&n)?,
                None => return Ok(false),
            }
        }
    }

    async fn workflow_runs_by_status(
        &self,
        owner: &str,
        repo: &str,
        status: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let first = self.url(&format!(
            "repos/{owner}/{repo}/actions/runs?status={status}&per_page=100"
        ))?;
        self.paginated::<WorkflowRunPage, WorkflowRun>(
            first,
            "failed to list workflow runs",
            |p| p.workflow_runs,
        )
        .await
    }

    // --- transport ---

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.api_base.join(path)?)
    }

    async fn paginated<P, T>(
        &self,
        first: Url,
        what: &'static str,
        extract: fn(P) -> Vec<T>,
    ) -> Result<Vec<T>>
    where
        P: serde::de::DeserializeOwned,
    {
        let mut url = first;
        let mut items = Vec::new();
        loop {
            let res = self.send(Method::GET, url).await.map_err(wrap(what))?;
            let next = next_page_url(res.headers());
            let page: P = res
                .json()
                .await
                .map_err(Error::from)
                .map_err(wrap(what))?;
            items.extend(extract(page));
            match next {
                Some(n) => url = Url::parse(&n)?,
                None => break,
            }
        }
        Ok(items)
    }

    async fn send(&self, method: Method, url: Url) -> Result<reqwest::Response> {
        let mut req = self.http.request(method.clone(), url);
        req = match &self.auth {
            Auth::Basic { username, password } => req.basic_auth(username, Some(password)),
            Auth::Token(token) => req.bearer_auth(token),
            Auth::App(app) => req.bearer_auth(self.installation_token(app).await?),
        };
        let res = req
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await?;
        metrics::GITHUB_API_REQUESTS_TOTAL
            .with_label_values(&[method.as_str(), res.status().as_str()])
            .inc();
        Ok(res)
    }

    async fn installation_token(&self, app: &AppAuth) -> Result<String> {
        let mut cached = app.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() + ChronoDuration::minutes(1) {
                return Ok(token.token.clone());
            }
        }

        let jwt = app.signed_jwt()?;
        let url = self.url(&format!(
            "app/installations/{}/access_tokens",
            app.installation_id
        ))?;
        let res = self
            .http
            .post(url)
            .bearer_auth(jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await?;
        metrics::GITHUB_API_REQUESTS_TOTAL
            .with_label_values(&["POST", res.status().as_str()])
            .inc();
        if res.status().as_u16() != 201 {
            return Err(Error::InstallationToken(res.status().as_u16()));
        }

        let token: InstallationToken = res.json().await?;
        let value = token.token.clone();
        *cached = Some(token);
        debug!(installation = app.installation_id, "refreshed app installation token");
        Ok(value)
    }
}

/// Drops every cache entry whose expiration has passed.
async fn cleanup_expired_tokens(cache: Arc<Mutex<HashMap<String, RegistrationToken>>>) {
    let mut tokens = cache.lock().await;
    let now = Utc::now();
    tokens.retain(|_, token| token.expires_at >= now);
}

fn runner_busy_status(runners: &[Runner], name: &str) -> Result<bool> {
    for runner in runners {
        if runner.name == name {
            if runner.status == "offline" {
                return Err(Error::RunnerOffline {
                    name: name.to_string(),
                    busy: runner.busy,
                });
            }
            return Ok(runner.busy);
        }
    }
    Err(Error::RunnerNotFound {
        name: name.to_string(),
    })
}

fn next_page_url(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    for entry in link.split(',') {
        let mut parts = entry.split(';');
        let target = parts.next().unwrap_or_default().trim();
        if parts.any(|p| p.trim() == "rel=\"next\"")
            && target.starts_with('<')
            && target.ends_with('>')
        {
            return Some(target[1..target.len() - 1].to_string());
        }
    }
    None
}

fn ensure_trailing_slash(s: &str) -> String {
    if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{s}/")
    }
}

/// Normalizes an enterprise base URL into its REST API base: a trailing
/// slash is ensured, `api/v3/` is appended unless the path already ends in
/// it or the host itself is an API host, and the trailing slash is stripped
/// so joining a token endpoint does not produce a double slash.
fn enterprise_api_url(base: &str) -> Result<String> {
    let parsed = Url::parse(base)?;
    let host = parsed.host_str().unwrap_or_default();
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path = parsed.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    if !path.ends_with("/api/v3/") && !host.starts_with("api.") && !host.contains(".api.") {
        path.push_str("api/v3/");
    }
    let path = path.strip_suffix('/').unwrap_or(&path);

    Ok(format!("{}://{}{}", parsed.scheme(), authority, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_client() -> Client {
        Config {
            token: "test-token".to_string(),
            ..Default::default()
        }
        .new_client()
        .unwrap()
    }

    #[test]
    fn test_enterprise_api_url_appends_api_v3() {
        assert_eq!(
            enterprise_api_url("https://ghe.example.com").unwrap(),
            "https://ghe.example.com/api/v3"
        );
        assert_eq!(
            enterprise_api_url("https://ghe.example.com/").unwrap(),
            "https://ghe.example.com/api/v3"
        );
        assert_eq!(
            enterprise_api_url("https://ghe.example.com:8443/base").unwrap(),
            "https://ghe.example.com:8443/base/api/v3"
        );
    }

    #[test]
    fn test_enterprise_api_url_skips_api_hosts() {
        assert_eq!(
            enterprise_api_url("https://api.ghe.example.com/").unwrap(),
            "https://api.ghe.example.com"
        );
        assert_eq!(
            enterprise_api_url("https://ghe.api.example.com/").unwrap(),
            "https://ghe.api.example.com"
        );
    }

    #[test]
    fn test_enterprise_api_url_is_idempotent_after_first_pass() {
        let once = enterprise_api_url("https://ghe.example.com").unwrap();
        let twice = enterprise_api_url(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_registration_key_renders_empty_fields() {
        assert_eq!(
            registration_key("acme", "", ""),
            "org=acme,repo=,enterprise="
        );
        assert_eq!(
            registration_key("", "acme/web", "contoso"),
            "org=,repo=acme/web,enterprise=contoso"
        );
    }

    #[test]
    fn test_split_owner_and_repo() {
        assert_eq!(split_owner_and_repo("acme/web").unwrap(), ("acme", "web"));
        assert!(matches!(
            split_owner_and_repo("acme"),
            Err(Error::InvalidRepositoryName(_))
        ));
        assert!(matches!(
            split_owner_and_repo("acme/web/extra"),
            Err(Error::InvalidRepositoryName(_))
        ));
    }

    #[test]
    fn test_invalid_repository_name_message() {
        let err = split_owner_and_repo("acme").unwrap_err();
        assert_eq!(err.to_string(), "invalid repository name: 'acme'");
    }

    #[test]
    fn test_resolve_scope_prefers_repository() {
        let scope = resolve_scope("contoso", "acme", "acme/web").unwrap();
        assert_eq!(
            scope,
            Scope::Repo {
                owner: "acme".to_string(),
                repo: "web".to_string()
            }
        );

        let scope = resolve_scope("contoso", "acme", "").unwrap();
        assert_eq!(scope, Scope::Org("acme".to_string()));

        let scope = resolve_scope("contoso", "", "").unwrap();
        assert_eq!(scope, Scope::Enterprise("contoso".to_string()));
    }

    #[test]
    fn test_resolve_scope_rejects_all_empty() {
        let err = resolve_scope("", "", "").unwrap_err();
        assert_eq!(
            err.to_string(),
            "enterprise, organization and repository are all empty"
        );
    }

    #[test]
    fn test_scope_endpoint_paths() {
        let repo = Scope::Repo {
            owner: "acme".to_string(),
            repo: "web".to_string(),
        };
        assert_eq!(
            repo.registration_token_path(),
            "repos/acme/web/actions/runners/registration-token"
        );
        assert_eq!(
            Scope::Org("acme".to_string()).runner_path(12),
            "orgs/acme/actions/runners/12"
        );
        assert_eq!(
            Scope::Enterprise("contoso".to_string()).runners_root(),
            "enterprises/contoso/actions/runners"
        );
    }

    #[test]
    fn test_token_freshness_boundary() {
        let now = Utc::now();
        let fresh = RegistrationToken {
            token: "t".to_string(),
            expires_at: now + ChronoDuration::minutes(3) + ChronoDuration::seconds(1),
        };
        let boundary = RegistrationToken {
            token: "t".to_string(),
            expires_at: now + ChronoDuration::minutes(3),
        };

        assert!(token_is_fresh(&fresh, now));
        // A token expiring exactly at the grace boundary must be re-issued.
        assert!(!token_is_fresh(&boundary, now));
    }

    #[test]
    fn test_next_page_url() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::LINK,
            "<https://api.github.com/a?page=2>; rel=\"next\", <https://api.github.com/a?page=5>; rel=\"last\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            next_page_url(&headers).as_deref(),
            Some("https://api.github.com/a?page=2")
        );

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::LINK,
            "<https://api.github.com/a?page=5>; rel=\"last\"".parse().unwrap(),
        );
        assert_eq!(next_page_url(&headers), None);

        assert_eq!(next_page_url(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn test_runner_busy_status() {
        let runners = vec![
            Runner {
                id: 1,
                name: "runner-a".to_string(),
                os: "linux".to_string(),
                status: "online".to_string(),
                busy: true,
            },
            Runner {
                id: 2,
                name: "runner-b".to_string(),
                os: "linux".to_string(),
                status: "offline".to_string(),
                busy: true,
            },
        ];

        assert!(runner_busy_status(&runners, "runner-a").unwrap());

        match runner_busy_status(&runners, "runner-b") {
            Err(Error::RunnerOffline { name, busy }) => {
                assert_eq!(name, "runner-b");
                assert!(busy);
            }
            other => panic!("expected RunnerOffline, got {other:?}"),
        }

        match runner_busy_status(&runners, "runner-c") {
            Err(Error::RunnerNotFound { name }) => assert_eq!(name, "runner-c"),
            other => panic!("expected RunnerNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registration_token_cache_hit_skips_api() {
        let client = token_client();
        let token = RegistrationToken {
            token: "cached".to_string(),
            expires_at: Utc::now() + ChronoDuration::minutes(10),
        };
        client.reg_tokens.lock().await.insert(
            registration_key("acme", "acme/web", ""),
            token,
        );

        // The client has no reachable API; a cache miss would fail here.
        let got = client
            .get_registration_token("", "acme", "acme/web", "runner-1")
            .await
            .unwrap();
        assert_eq!(got.token, "cached");
    }

    #[tokio::test]
    async fn test_runner_groups_empty_org_short_circuits() {
        let client = token_client();
        let (enterprise_groups, org_groups) = client
            .get_runner_groups_from_repository("", "acme/web", &[], &[])
            .await
            .unwrap();
        assert!(enterprise_groups.is_empty());
        assert!(org_groups.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_expired_tokens() {
        let cache = Arc::new(Mutex::new(HashMap::new()));
        cache.lock().await.insert(
            "org=a,repo=,enterprise=".to_string(),
            RegistrationToken {
                token: "stale".to_string(),
                expires_at: Utc::now() - ChronoDuration::minutes(1),
            },
        );
        cache.lock().await.insert(
            "org=b,repo=,enterprise=".to_string(),
            RegistrationToken {
                token: "live".to_string(),
                expires_at: Utc::now() + ChronoDuration::minutes(30),
            },
        );

        cleanup_expired_tokens(Arc::clone(&cache)).await;

        let tokens = cache.lock().await;
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains_key("org=b,repo=,enterprise="));
    }
}
