/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/webhook_autoscaler.rs
*
* Purpose:
*   This file implements the webhook side of runner autoscaling. It is the
*   core of the scale-on-demand logic within the operator and is built from
*   three cooperating pieces:
*
*   1. Webhook Server (using `warp`):
*      - Exposes a single HTTP endpoint that answers GET with a health
*        message and accepts GitHub webhook deliveries on POST.
*      - When a webhook secret is configured, the payload signature is
*        verified (HMAC-SHA256) before anything else happens.
*
*   2. Scale-Target Resolution:
*      - Each delivery is classified by event kind and reduced to at most
*        one (autoscaler, amount, duration) scale target, by consulting the
*        scaleTarget index in a fixed order: repository scope, organization
*        scope, enterprise scope, then named runner groups.
*      - Runner-group resolution asks GitHub which candidate groups the
*        repository can actually reach; without GitHub credentials every
*        declaratively discovered candidate is assumed reachable.
*      - A key matching more than one autoscaler is ambiguous and resolves
*        to no target at all, forcing the operator to disambiguate.
*
*   3. Capacity-Reservation Engine:
*      - A resolved target mutates the autoscaler's capacityReservations
*        list: expired entries are purged, a positive amount appends a
*        time-bounded reservation, and a negative amount cancels the oldest
*        reservation of the same magnitude (queued/completed deliveries
*        carry no correlation id, so magnitude order is the best available
*        pairing).
*      - The change is submitted as a merge patch; conflict handling is left
*        to the storage backend's optimistic concurrency.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    ResourceExt,
};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};
use warp::{http::StatusCode, Filter};

use crate::controllers::scale_target_index::{
    enterprise_key, enterprise_runner_group_key, load_workload_scope,
    organizational_runner_group_key, ScaleTargetIndex, WorkloadScope,
};
use crate::controllers::webhook_events::{
    repo_context, CheckRunEvent, EnterpriseFragment, PingEvent, PullRequestEvent, PushEvent,
    WorkflowJobEvent,
};
use crate::crds::{CapacityReservation, HorizontalRunnerAutoscaler, ScaleUpTrigger};
use crate::{github, metrics};

type HmacSha256 = Hmac<Sha256>;

/// Fallback reservation lifetime for workflow-job scaling. GitHub usually
/// sends the matching `completed` event, but nothing is guaranteed, and
/// reserved capacity must not survive a lost one forever.
const DEFAULT_JOB_SCALE_DURATION_MINUTES: i64 = 10;

// --- Custom Error Types ---

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("could not parse webhook payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    #[error("signature validation failed: {0}")]
    Signature(&'static str),

    #[error("unsupported scaleTargetRef.kind: {0}")]
    UnsupportedScaleTargetKind(String),

    #[error("failed to get {kind} {name:?}: not found")]
    WorkloadNotFound { kind: &'static str, name: String },

    #[error("missing object key '{0}' in resource")]
    MissingObjectKey(&'static str),

    #[error("failed to parse duration string '{0}': {1}")]
    DurationParse(String, String),

    #[error("GitHub API error: {0}")]
    GitHub(#[from] github::Error),

    #[error("patching horizontalrunnerautoscaler to add capacity reservation: {0}")]
    Patch(#[source] kube::Error),
}

// --- Scale target ---

/// The one autoscaler a webhook delivery resolved to, with the replica
/// delta and reservation lifetime to apply.
#[derive(Debug, Clone)]
pub struct ScaleTarget {
    pub hra: HorizontalRunnerAutoscaler,
    pub amount: i32,
    pub duration: ChronoDuration,
}

/// How autoscalers found under an index key are filtered down to targets.
enum TargetQuery<'a> {
    /// Match a configured scale-up trigger against the event.
    Trigger(&'a (dyn Fn(&ScaleUpTrigger) -> bool + Sync)),
    /// Match the workload's declared labels against a workflow job's
    /// requested labels.
    WorkflowJob { labels: &'a [String] },
}

// --- The webhook autoscaler ---

pub struct WebhookAutoscaler {
    client: Client,
    index: Arc<ScaleTargetIndex>,
    github_client: Option<Arc<github::Client>>,
    webhook_secret: Option<Vec<u8>>,
}

impl WebhookAutoscaler {
    pub fn new(
        client: Client,
        index: Arc<ScaleTargetIndex>,
        github_client: Option<Arc<github::Client>>,
        webhook_secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            client,
            index,
            github_client,
            webhook_secret,
        }
    }

    /// Handles one webhook delivery end to end. `Ok` carries the 200 body;
    /// every error surfaces as a 500 with the error text.
    async fn process(
        &self,
        event_kind: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<String, Error> {
        if let Some(secret) = &self.webhook_secret {
            validate_signature(secret, body, signature)?;
        }

        // The enterprise slug is not uniformly present in the typed events,
        // so it is recovered from a minimal shape of its own.
        let enterprise_slug = match serde_json::from_slice::<EnterpriseFragment>(body) {
            Ok(fragment) => fragment.slug(),
            Err(e) => {
                warn!(error = %e, "could not parse webhook payload for extracting enterprise slug");
                String::new()
            }
        };

        let target = match event_kind {
            "push" => {
                let event: PushEvent = serde_json::from_slice(body)?;
                let (repo, owner, owner_type) = repo_context(&event.repository);
                debug!(git_ref = %event.git_ref, "handling push event");
                self.get_scale_up_target(
                    &repo,
                    &owner,
                    &owner_type,
                    &enterprise_slug,
                    &TargetQuery::Trigger(&match_push_event),
                )
                .await?
            }
            "pull_request" => {
                let event: PullRequestEvent = serde_json::from_slice(body)?;
                let (repo, owner, owner_type) = repo_context(&event.repository);
                if let Some(pull_request) = &event.pull_request {
                    debug!(
                        base_ref = %pull_request.base.as_ref().map(|b| b.git_ref.as_str()).unwrap_or(""),
                        action = ?event.action,
                        "handling pull_request event"
                    );
                }
                let action = event.action.clone();
                let matches =
                    |trigger: &ScaleUpTrigger| match_pull_request_event(trigger, action.as_deref());
                self.get_scale_up_target(
                    &repo,
                    &owner,
                    &owner_type,
                    &enterprise_slug,
                    &TargetQuery::Trigger(&matches),
                )
                .await?
            }
            "check_run" => {
                let event: CheckRunEvent = serde_json::from_slice(body)?;
                let (repo, owner, owner_type) = repo_context(&event.repository);
                if let Some(check_run) = &event.check_run {
                    debug!(
                        status = %check_run.status,
                        action = ?event.action,
                        "handling check_run event"
                    );
                }
                let action = event.action.clone();
                let matches =
                    |trigger: &ScaleUpTrigger| match_check_run_event(trigger, action.as_deref());
                self.get_scale_up_target(
                    &repo,
                    &owner,
                    &owner_type,
                    &enterprise_slug,
                    &TargetQuery::Trigger(&matches),
                )
                .await?
            }
            "workflow_job" => {
                let event: WorkflowJobEvent = serde_json::from_slice(body)?;
                let (repo, owner, owner_type) = repo_context(&event.repository);
                let action = event.action.as_deref().unwrap_or("");
                let labels = event
                    .workflow_job
                    .as_ref()
                    .map(|job| job.labels.clone())
                    .unwrap_or_default();
                if let Some(job) = &event.workflow_job {
                    debug!(
                        status = %job.status,
                        labels = ?job.labels,
                        action = %action,
                        enterprise = %enterprise_slug,
                        "handling workflow_job event"
                    );
                }

                match action {
                    "queued" | "completed" => {
                        let mut target = self
                            .get_scale_up_target(
                                &repo,
                                &owner,
                                &owner_type,
                                &enterprise_slug,
                                &TargetQuery::WorkflowJob { labels: &labels },
                            )
                            .await?;
                        if let Some(target) = target.as_mut() {
                            // A negative amount is a scale-down request. It
                            // erases the oldest reservation with the same
                            // magnitude, so the desired replica count
                            // decreases by one.
                            target.amount = if action == "queued" { 1 } else { -1 };
                        }
                        target
                    }
                    _ => {
                        debug!(
                            action = %action,
                            "received and ignored a workflow_job event as it triggers neither scale-up nor scale-down"
                        );
                        return Ok(String::new());
                    }
                }
            }
            "ping" => {
                let zen = serde_json::from_slice::<PingEvent>(body)
                    .map(|ping| ping.zen)
                    .unwrap_or_default();
                info!(zen = %zen, "received ping event");
                return Ok("pong".to_string());
            }
            other => {
                info!(event_type = %other, "unknown event type");
                return Err(Error::UnknownEventType(other.to_string()));
            }
        };

        let Some(target) = target else {
            info!(
                "Scale target not found. If this is unexpected, ensure that there is exactly one \
                 repository-wide or organizational runner deployment that matches this webhook event"
            );
            return Ok("no horizontalrunnerautoscaler to scale for this github event".to_string());
        };

        let amount = self.try_scale(&target).await?;
        let message = format!("scaled {} by {}", target.hra.name_any(), amount);
        info!("{}", message);
        Ok(message)
    }

    // --- Scale-target resolution ---

    /// Resolves the event context to at most one scale target, searching
    /// repository scope, then organization scope, then enterprise scope,
    /// then named runner groups.
    async fn get_scale_up_target(
        &self,
        repo: &str,
        owner: &str,
        owner_type: &str,
        enterprise: &str,
        query: &TargetQuery<'_>,
    ) -> Result<Option<ScaleTarget>, Error> {
        let repository_runner_key = format!("{owner}/{repo}");

        if let Some(target) = self
            .scale_target_for_key(&repository_runner_key, query)
            .await?
        {
            info!(repository = %repository_runner_key, "scale up target is repository-wide runners");
            return Ok(Some(target));
        }

        if owner_type == "User" {
            debug!(owner = %owner, "user repositories not supported");
            return Ok(None);
        }

        if let Some(target) = self.scale_target_for_key(owner, query).await? {
            info!(organization = %owner, "scale up target is organizational runners");
            return Ok(Some(target));
        }

        if !enterprise.is_empty() {
            if let Some(target) = self
                .scale_target_for_key(&enterprise_key(enterprise), query)
                .await?
            {
                info!(enterprise = %enterprise, "scale up target is default enterprise runners");
                return Ok(Some(target));
            }
        }

        // No default organization or enterprise runners matched; search the
        // named runner groups. Candidates come from the declarative set
        // first, so GitHub API queries are not spent needlessly.
        let (available_enterprise_groups, available_org_groups) = self
            .potential_groups_from_hras(enterprise, owner)
            .await?;
        if available_enterprise_groups.is_empty() && available_org_groups.is_empty() {
            debug!(
                repository = %repository_runner_key,
                organization = %owner,
                enterprise = %enterprise,
                "no candidate runner groups declared"
            );
        }

        let (enterprise_groups, org_groups) = match &self.github_client {
            Some(github_client) => {
                match github_client
                    .get_runner_groups_from_repository(
                        owner,
                        &repository_runner_key,
                        &available_enterprise_groups,
                        &available_org_groups,
                    )
                    .await
                {
                    Ok(groups) => groups,
                    Err(e) => {
                        error!(
                            error = %e,
                            organization = %owner,
                            repository = %repo,
                            "unable to find runner groups from repository"
                        );
                        return Ok(None);
                    }
                }
            }
            // Without GitHub credentials group visibility cannot be
            // checked; every declaratively discovered candidate group is
            // assumed reachable.
            None => (available_enterprise_groups, available_org_groups),
        };
        debug!(
            enterprise_groups = ?enterprise_groups,
            organization_groups = ?org_groups,
            "searching in runner groups"
        );

        for group in &org_groups {
            if let Some(target) = self
                .scale_target_for_key(&organizational_runner_group_key(owner, group), query)
                .await?
            {
                info!(organization = %owner, group = %group, "scale up target is organizational runner group");
                return Ok(Some(target));
            }
        }
        for group in &enterprise_groups {
            if let Some(target) = self
                .scale_target_for_key(&enterprise_runner_group_key(enterprise, group), query)
                .await?
            {
                info!(enterprise = %enterprise, group = %group, "scale up target is enterprise runner group");
                return Ok(Some(target));
            }
        }

        debug!(
            repository = %repository_runner_key,
            organization = %owner,
            enterprise = %enterprise,
            "no repository, organizational or enterprise runner found"
        );
        Ok(None)
    }

    async fn scale_target_for_key(
        &self,
        key: &str,
        query: &TargetQuery<'_>,
    ) -> Result<Option<ScaleTarget>, Error> {
        match query {
            TargetQuery::Trigger(matches) => self.get_scale_target(key, *matches).await,
            TargetQuery::WorkflowJob { labels } => self.get_job_scale_target(key, labels).await,
        }
    }

    async fn get_scale_target(
        &self,
        key: &str,
        matches: &(dyn Fn(&ScaleUpTrigger) -> bool + Sync),
    ) -> Result<Option<ScaleTarget>, Error> {
        let hras = self.index.find_by_key(key).await;
        debug!(key = %key, count = hras.len(), "found autoscalers by key");

        Ok(select_unambiguous(search_scale_targets(&hras, matches)))
    }

    /// Workflow-job specific target selection: the autoscaler must have at
    /// most one trigger, and its workload must declare every label the job
    /// requests (apart from the implicit `self-hosted`).
    async fn get_job_scale_target(
        &self,
        key: &str,
        labels: &[String],
    ) -> Result<Option<ScaleTarget>, Error> {
        let hras = self.index.find_by_key(key).await;
        debug!(key = %key, count = hras.len(), "found autoscalers by key");

        for hra in hras {
            if hra.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if hra.spec.scale_up_triggers.len() > 1 {
                debug!(
                    hra = %hra.name_any(),
                    "skipping autoscaler with multiple triggers, which workflow_job scaling does not support"
                );
                continue;
            }

            let duration = job_scale_duration(hra.spec.scale_up_triggers.first());

            let namespace = hra.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
            let scope = match load_workload_scope(
                &self.client,
                &namespace,
                &hra.spec.scale_target_ref,
            )
            .await?
            {
                WorkloadScope::Found(scope) => scope,
                WorkloadScope::Missing { kind, name } => {
                    return Err(Error::WorkloadNotFound { kind, name });
                }
                WorkloadScope::UnsupportedKind(kind) => {
                    return Err(Error::UnsupportedScaleTargetKind(kind));
                }
            };

            if !labels_satisfied(labels, &scope.labels) {
                continue;
            }

            return Ok(Some(ScaleTarget {
                hra,
                amount: 0,
                duration,
            }));
        }

        Ok(None)
    }

    /// Collects candidate runner-group names from the declared autoscaler
    /// set: each workload with a group contributes it to the enterprise
    /// bucket when its enterprise matches, and to the organization bucket
    /// when its organization matches.
    ///
    /// Returns `(enterprise_groups, org_groups)`.
    async fn potential_groups_from_hras(
        &self,
        enterprise: &str,
        org: &str,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let mut enterprise_groups = Vec::new();
        let mut org_groups = Vec::new();

        for hra in self.index.all().await {
            let namespace = hra.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
            let scope = match load_workload_scope(
                &self.client,
                &namespace,
                &hra.spec.scale_target_ref,
            )
            .await?
            {
                WorkloadScope::Found(scope) => scope,
                WorkloadScope::Missing { kind, name } => {
                    return Err(Error::WorkloadNotFound { kind, name });
                }
                WorkloadScope::UnsupportedKind(_) => continue,
            };

            if scope.group.is_empty() {
                continue;
            }
            if scope.organization == org {
                org_groups.push(scope.group.clone());
            }
            if scope.enterprise == enterprise {
                enterprise_groups.push(scope.group.clone());
            }
        }

        Ok((enterprise_groups, org_groups))
    }

    // --- Capacity-reservation engine ---

    /// Applies the target's replica delta to its reservation list and
    /// submits a merge patch. Returns the effective amount.
    async fn try_scale(&self, target: &ScaleTarget) -> Result<i32, Error> {
        let mut amount = target.amount;
        if amount == 0 {
            amount = 1;
        }

        let now = Utc::now();
        let before = &target.hra.spec.capacity_reservations;
        let after = apply_capacity_reservation(before, amount, target.duration, now);

        info!(
            hra = %target.hra.name_any(),
            before = ?before,
            after = ?after,
            "patching autoscaler for capacity reservations update"
        );

        let namespace = target
            .hra
            .namespace()
            .ok_or(Error::MissingObjectKey("namespace"))?;
        let api: Api<HorizontalRunnerAutoscaler> =
            Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "spec": { "capacityReservations": after } });
        api.patch(
            &target.hra.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::Patch)?;

        let direction = if amount > 0 { "up" } else { "down" };
        metrics::SCALE_OPERATIONS_TOTAL
            .with_label_values(&[direction])
            .inc();
        Ok(amount)
    }
}

/// Transforms a reservation list for a signed replica delta. Expired
/// reservations are always purged; a positive amount appends a reservation
/// expiring after `duration`; a negative amount drops the first reservation
/// whose replicas cancel it exactly, preserving every other entry in order.
fn apply_capacity_reservation(
    existing: &[CapacityReservation],
    amount: i32,
    duration: ChronoDuration,
    now: DateTime<Utc>,
) -> Vec<CapacityReservation> {
    let valid: Vec<CapacityReservation> = existing
        .iter()
        .filter(|r| r.expiration_time.0 > now)
        .cloned()
        .collect();

    if amount > 0 {
        let mut reservations = valid;
        reservations.push(CapacityReservation {
            expiration_time: Time(now + duration),
            replicas: amount,
        });
        reservations
    } else if amount < 0 {
        let mut reservations = Vec::with_capacity(valid.len());
        let mut found = false;
        for reservation in valid {
            if !found && reservation.replicas + amount == 0 {
                found = true;
            } else {
                reservations.push(reservation);
            }
        }
        reservations
    } else {
        valid
    }
}

// --- Trigger predicates ---

/// An empty type list matches every action; a missing action matches only
/// an empty type list.
fn match_trigger_condition_against_event(types: &[String], event_action: Option<&str>) -> bool {
    if types.is_empty() {
        return true;
    }
    match event_action {
        None => false,
        Some(action) => types.iter().any(|t| t == action),
    }
}

fn match_push_event(trigger: &ScaleUpTrigger) -> bool {
    trigger
        .github_event
        .as_ref()
        .and_then(|event| event.push.as_ref())
        .is_some()
}

fn match_pull_request_event(trigger: &ScaleUpTrigger, action: Option<&str>) -> bool {
    match trigger
        .github_event
        .as_ref()
        .and_then(|event| event.pull_request.as_ref())
    {
        Some(pull_request) => match_trigger_condition_against_event(&pull_request.types, action),
        None => false,
    }
}

fn match_check_run_event(trigger: &ScaleUpTrigger, action: Option<&str>) -> bool {
    match trigger
        .github_event
        .as_ref()
        .and_then(|event| event.check_run.as_ref())
    {
        Some(check_run) => match_trigger_condition_against_event(&check_run.types, action),
        None => false,
    }
}

fn search_scale_targets(
    hras: &[HorizontalRunnerAutoscaler],
    matches: &(dyn Fn(&ScaleUpTrigger) -> bool + Sync),
) -> Vec<ScaleTarget> {
    let mut matched = Vec::new();
    for hra in hras {
        if hra.metadata.deletion_timestamp.is_some() {
            continue;
        }
        for trigger in &hra.spec.scale_up_triggers {
            if !matches(trigger) {
                continue;
            }
            matched.push(ScaleTarget {
                hra: hra.clone(),
                amount: trigger.amount,
                duration: trigger_duration(trigger),
            });
        }
    }
    matched
}

/// A key matching more than one autoscaler is ambiguous and deliberately
/// resolves to no target, forcing the operator to disambiguate.
fn select_unambiguous(mut targets: Vec<ScaleTarget>) -> Option<ScaleTarget> {
    if targets.len() > 1 {
        let scale_target_ids: Vec<String> = targets.iter().map(|t| t.hra.name_any()).collect();
        info!(
            scale_targets = %scale_target_ids.join(","),
            "Found too many scale targets: It must be exactly one to avoid ambiguity. Either \
             set WATCH_NAMESPACE to let the webhook server only find autoscalers in that \
             namespace, or update the repository, organization, or enterprise fields of your \
             runner workloads to fix the ambiguity."
        );
        return None;
    }
    targets.pop()
}

/// Every label the job requests must be declared by the workload. The
/// literal `self-hosted` is implicit for every runner here and ignored.
fn labels_satisfied(required: &[String], provided: &[String]) -> bool {
    for label in required {
        if label == "self-hosted" {
            continue;
        }
        if !provided.iter().any(|l| l == label) {
            return false;
        }
    }
    true
}

fn trigger_duration(trigger: &ScaleUpTrigger) -> ChronoDuration {
    match trigger.duration.as_deref() {
        None => ChronoDuration::zero(),
        Some(s) => match parse_duration(s) {
            Ok(duration) => duration,
            Err(e) => {
                warn!(error = %e, "ignoring malformed scale up trigger duration");
                ChronoDuration::zero()
            }
        },
    }
}

fn job_scale_duration(trigger: Option<&ScaleUpTrigger>) -> ChronoDuration {
    let configured = trigger
        .map(trigger_duration)
        .unwrap_or_else(ChronoDuration::zero);
    if configured > ChronoDuration::zero() {
        configured
    } else {
        ChronoDuration::minutes(DEFAULT_JOB_SCALE_DURATION_MINUTES)
    }
}

/// Parses a simple duration string (e.g. "30s", "5m", "1h").
fn parse_duration(s: &str) -> Result<ChronoDuration, Error> {
    let s = s.trim();
    let numeric_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (numeric, unit) = s.split_at(numeric_end);

    let value: i64 = numeric.parse().map_err(|_| {
        Error::DurationParse(s.to_string(), "invalid numeric part".to_string())
    })?;

    match unit {
        "s" => Ok(ChronoDuration::seconds(value)),
        "m" => Ok(ChronoDuration::minutes(value)),
        "h" => Ok(ChronoDuration::hours(value)),
        _ => Err(Error::DurationParse(
            s.to_string(),
            format!("unsupported unit '{unit}'"),
        )),
    }
}

// --- Signature validation ---

fn validate_signature(secret: &[u8], payload: &[u8], header: Option<&str>) -> Result<(), Error> {
    let header = header.ok_or(Error::MissingHeader("X-Hub-Signature-256"))?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(Error::Signature("unsupported signature format"))?;
    let expected =
        hex::decode(hex_digest).map_err(|_| Error::Signature("malformed signature hex"))?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| Error::Signature("signature mismatch"))
}

// --- Webhook Server Implementation ---

/// A helper function to inject the shared autoscaler into warp filters.
fn with_autoscaler(
    autoscaler: Arc<WebhookAutoscaler>,
) -> impl Filter<Extract = (Arc<WebhookAutoscaler>,), Error = Infallible> + Clone {
    warp::any().map(move || autoscaler.clone())
}

/// Initializes and runs the warp-based HTTP server receiving GitHub
/// webhook deliveries. GET answers with a health message.
pub async fn run_webhook_server(autoscaler: Arc<WebhookAutoscaler>, addr: SocketAddr) {
    let health = warp::get()
        .and(warp::path::end())
        .map(|| "webhook server is running");

    let hook = warp::post()
        .and(warp::path::end())
        .and(warp::header::optional::<String>("x-github-event"))
        .and(warp::header::optional::<String>("x-hub-signature-256"))
        .and(warp::header::optional::<String>("x-github-hook-id"))
        .and(warp::header::optional::<String>("x-github-delivery"))
        .and(warp::body::bytes())
        .and(with_autoscaler(autoscaler))
        .and_then(handle_webhook);

    info!(address = %addr, "starting github webhook server");
    warp::serve(health.or(hook)).run(addr).await;
}

/// The main handler for incoming webhook deliveries.
async fn handle_webhook(
    event_kind: Option<String>,
    signature: Option<String>,
    hook_id: Option<String>,
    delivery: Option<String>,
    body: bytes::Bytes,
    autoscaler: Arc<WebhookAutoscaler>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let event_kind = event_kind.unwrap_or_default();
    metrics::WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[event_kind.as_str()])
        .inc();

    let span = tracing::info_span!(
        "webhook",
        event = %event_kind,
        hook_id = %hook_id.as_deref().unwrap_or(""),
        delivery = %delivery.as_deref().unwrap_or(""),
    );

    match autoscaler
        .process(&event_kind, &body, signature.as_deref())
        .instrument(span)
        .await
    {
        Ok(message) => Ok(warp::reply::with_status(message, StatusCode::OK)),
        Err(e) => {
            error!(error = %e, event = %event_kind, "failed to handle webhook delivery");
            Ok(warp::reply::with_status(
                e.to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        GitHubEventScaleUpTriggerSpec, HorizontalRunnerAutoscalerSpec, PullRequestSpec, PushSpec,
    };

    fn reservation(expires_in: ChronoDuration, replicas: i32, now: DateTime<Utc>) -> CapacityReservation {
        CapacityReservation {
            expiration_time: Time(now + expires_in),
            replicas,
        }
    }

    fn trigger_for_pull_request(types: &[&str]) -> ScaleUpTrigger {
        ScaleUpTrigger {
            github_event: Some(GitHubEventScaleUpTriggerSpec {
                pull_request: Some(PullRequestSpec {
                    types: types.iter().map(|t| t.to_string()).collect(),
                }),
                ..Default::default()
            }),
            amount: 1,
            duration: Some("5m".to_string()),
        }
    }

    fn hra_with_triggers(
        name: &str,
        triggers: Vec<ScaleUpTrigger>,
    ) -> HorizontalRunnerAutoscaler {
        let mut hra = HorizontalRunnerAutoscaler::new(
            name,
            HorizontalRunnerAutoscalerSpec {
                scale_up_triggers: triggers,
                ..Default::default()
            },
        );
        hra.metadata.namespace = Some("default".to_string());
        hra
    }

    // --- capacity reservation engine ---

    #[test]
    fn test_scale_up_appends_reservation() {
        let now = Utc::now();
        let existing = vec![reservation(ChronoDuration::minutes(5), 1, now)];

        let after = apply_capacity_reservation(&existing, 1, ChronoDuration::minutes(5), now);

        assert_eq!(after.len(), 2);
        assert_eq!(after[0], existing[0]);
        assert_eq!(after[1].replicas, 1);
        assert_eq!(after[1].expiration_time.0, now + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_expired_reservations_are_purged_on_every_write() {
        let now = Utc::now();
        let existing = vec![
            reservation(-ChronoDuration::minutes(1), 1, now),
            reservation(ChronoDuration::minutes(5), 1, now),
        ];

        let after = apply_capacity_reservation(&existing, 1, ChronoDuration::minutes(5), now);

        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|r| r.expiration_time.0 > now));
    }

    #[test]
    fn test_scale_down_removes_oldest_matching_reservation() {
        let now = Utc::now();
        let first = reservation(ChronoDuration::minutes(3), 1, now);
        let second = reservation(ChronoDuration::minutes(5), 1, now);
        let existing = vec![first, second.clone()];

        let after = apply_capacity_reservation(&existing, -1, ChronoDuration::minutes(5), now);

        assert_eq!(after, vec![second]);
    }

    #[test]
    fn test_scale_down_skips_mismatched_magnitudes() {
        let now = Utc::now();
        let triple = reservation(ChronoDuration::minutes(3), 3, now);
        let existing = vec![triple.clone()];

        let after = apply_capacity_reservation(&existing, -1, ChronoDuration::minutes(5), now);
        assert_eq!(after, vec![triple]);

        let single = reservation(ChronoDuration::minutes(3), 1, now);
        let double = reservation(ChronoDuration::minutes(4), 2, now);
        let after = apply_capacity_reservation(
            &[single.clone(), double],
            -2,
            ChronoDuration::minutes(5),
            now,
        );
        assert_eq!(after, vec![single]);
    }

    #[test]
    fn test_scale_down_with_no_match_leaves_list_unchanged() {
        let now = Utc::now();
        let existing = vec![reservation(ChronoDuration::minutes(3), 2, now)];

        let after = apply_capacity_reservation(&existing, -1, ChronoDuration::minutes(5), now);

        assert_eq!(after, existing);
    }

    // --- trigger predicates ---

    #[test]
    fn test_match_trigger_condition_against_event() {
        assert!(match_trigger_condition_against_event(&[], None));
        assert!(match_trigger_condition_against_event(&[], Some("anything")));

        let types = vec!["created".to_string(), "rerequested".to_string()];
        assert!(!match_trigger_condition_against_event(&types, None));
        assert!(match_trigger_condition_against_event(&types, Some("created")));
        assert!(!match_trigger_condition_against_event(&types, Some("completed")));
    }

    #[test]
    fn test_match_push_event_requires_push_trigger() {
        let push_trigger = ScaleUpTrigger {
            github_event: Some(GitHubEventScaleUpTriggerSpec {
                push: Some(PushSpec {}),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(match_push_event(&push_trigger));

        assert!(!match_push_event(&ScaleUpTrigger::default()));
        assert!(!match_push_event(&trigger_for_pull_request(&[])));
    }

    #[test]
    fn test_match_pull_request_event_by_action() {
        let trigger = trigger_for_pull_request(&["opened", "synchronize"]);
        assert!(match_pull_request_event(&trigger, Some("opened")));
        assert!(!match_pull_request_event(&trigger, Some("closed")));
        assert!(!match_pull_request_event(&trigger, None));

        let untyped = trigger_for_pull_request(&[]);
        assert!(match_pull_request_event(&untyped, Some("closed")));
        assert!(!match_pull_request_event(&ScaleUpTrigger::default(), Some("opened")));
    }

    // --- target search ---

    #[test]
    fn test_search_scale_targets_skips_deleted_autoscalers() {
        let healthy = hra_with_triggers("healthy", vec![trigger_for_pull_request(&[])]);
        let mut deleted = hra_with_triggers("deleted", vec![trigger_for_pull_request(&[])]);
        deleted.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let targets = search_scale_targets(&[healthy, deleted], &|_: &ScaleUpTrigger| true);

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].hra.name_any(), "healthy");
        assert_eq!(targets[0].amount, 1);
        assert_eq!(targets[0].duration, ChronoDuration::minutes(5));
    }

    #[test]
    fn test_search_scale_targets_applies_predicate_per_trigger() {
        let hra = hra_with_triggers(
            "multi",
            vec![
                trigger_for_pull_request(&["opened"]),
                trigger_for_pull_request(&["closed"]),
            ],
        );

        let matches =
            |trigger: &ScaleUpTrigger| match_pull_request_event(trigger, Some("closed"));
        let targets = search_scale_targets(std::slice::from_ref(&hra), &matches);

        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_ambiguous_targets_resolve_to_none() {
        let a = hra_with_triggers("a", vec![trigger_for_pull_request(&[])]);
        let b = hra_with_triggers("b", vec![trigger_for_pull_request(&[])]);
        let targets = search_scale_targets(&[a, b], &|_: &ScaleUpTrigger| true);
        assert_eq!(targets.len(), 2);

        assert!(select_unambiguous(targets).is_none());
    }

    #[test]
    fn test_single_target_is_selected() {
        let a = hra_with_triggers("a", vec![trigger_for_pull_request(&[])]);
        let targets = search_scale_targets(std::slice::from_ref(&a), &|_: &ScaleUpTrigger| true);

        let selected = select_unambiguous(targets).unwrap();
        assert_eq!(selected.hra.name_any(), "a");

        assert!(select_unambiguous(Vec::new()).is_none());
    }

    // --- label matching ---

    #[test]
    fn test_labels_satisfied_ignores_only_self_hosted() {
        let provided = vec!["linux".to_string(), "x64".to_string()];

        let required = vec!["self-hosted".to_string(), "linux".to_string()];
        assert!(labels_satisfied(&required, &provided));

        let required = vec!["self-hosted".to_string(), "gpu".to_string()];
        assert!(!labels_satisfied(&required, &provided));

        assert!(labels_satisfied(&["self-hosted".to_string()], &[]));
    }

    // --- durations ---

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), ChronoDuration::seconds(30));
        assert_eq!(parse_duration("5m").unwrap(), ChronoDuration::minutes(5));
        assert_eq!(parse_duration("2h").unwrap(), ChronoDuration::hours(2));

        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn test_job_scale_duration_defaults_to_ten_minutes() {
        assert_eq!(job_scale_duration(None), ChronoDuration::minutes(10));

        let zero = ScaleUpTrigger {
            duration: Some("0s".to_string()),
            ..Default::default()
        };
        assert_eq!(
            job_scale_duration(Some(&zero)),
            ChronoDuration::minutes(10)
        );

        let five = ScaleUpTrigger {
            duration: Some("5m".to_string()),
            ..Default::default()
        };
        assert_eq!(job_scale_duration(Some(&five)), ChronoDuration::minutes(5));
    }

    // --- signature validation ---

    #[test]
    fn test_validate_signature() {
        let secret = b"webhook-secret";
        let payload = br#"{"action":"queued"}"#;

        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(payload);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(validate_signature(secret, payload, Some(&signature)).is_ok());
        assert!(matches!(
            validate_signature(b"other-secret", payload, Some(&signature)),
            Err(Error::Signature(_))
        ));
        assert!(matches!(
            validate_signature(secret, payload, None),
            Err(Error::MissingHeader(_))
        ));
        assert!(matches!(
            validate_signature(secret, payload, Some("sha1=abcdef")),
            Err(Error::Signature(_))
        ));
    }
}
