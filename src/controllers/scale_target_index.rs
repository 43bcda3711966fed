/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/scale_target_index.rs
*
* Purpose:
*   Maintains the `scaleTarget` secondary index the webhook server consults
*   to resolve an event to at most one HorizontalRunnerAutoscaler. Each
*   autoscaler is indexed under string keys derived from the scope fields of
*   its referenced runner workload:
*
*     repository runners            "<owner>/<repo>"
*     organization runners          "<owner>"
*     organization runner groups    "<owner>/group/<groupname>"
*     enterprise runners            "enterprises/<slug>"
*     enterprise runner groups      "enterprises/<slug>/group/<groupname>"
*
*   These literal formats are observable in logs and must stay stable.
*
* Architecture:
*   The index is an in-memory cache behind an `Arc<RwLock<...>>`, shared
*   between the webhook handler tasks and a reconciler that keeps it current.
*   The reconciler watches HorizontalRunnerAutoscalers, re-reads each changed
*   object, loads its referenced workload to derive the keys, and swaps the
*   entry. A missing workload indexes zero keys. Deletions are observed as a
*   failed re-read and drop the entry.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::StreamExt;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    ResourceExt,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::crds::{HorizontalRunnerAutoscaler, RunnerDeployment, RunnerScope, RunnerSet, ScaleTargetRef};

const KEY_PREFIX_ENTERPRISE: &str = "enterprises/";
const KEY_RUNNER_GROUP: &str = "/group/";

pub fn enterprise_key(name: &str) -> String {
    format!("{KEY_PREFIX_ENTERPRISE}{name}")
}

pub fn organizational_runner_group_key(owner: &str, group: &str) -> String {
    format!("{owner}{KEY_RUNNER_GROUP}{group}")
}

pub fn enterprise_runner_group_key(enterprise: &str, group: &str) -> String {
    format!("{KEY_PREFIX_ENTERPRISE}{enterprise}{KEY_RUNNER_GROUP}{group}")
}

// --- Errors ---

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("missing object key '{0}' in resource")]
    MissingObjectKey(&'static str),
}

// --- Workload resolution ---

/// Outcome of resolving an autoscaler's `scaleTargetRef` to the scope fields
/// of its workload.
#[derive(Debug)]
pub enum WorkloadScope {
    Found(RunnerScope),
    Missing { kind: &'static str, name: String },
    UnsupportedKind(String),
}

/// Loads the runner workload referenced by `target` and returns its scope.
pub async fn load_workload_scope(
    client: &Client,
    namespace: &str,
    target: &ScaleTargetRef,
) -> Result<WorkloadScope, kube::Error> {
    match target.kind.as_str() {
        "" | "RunnerDeployment" => {
            if target.name.is_empty() {
                return Ok(WorkloadScope::Missing {
                    kind: "RunnerDeployment",
                    name: String::new(),
                });
            }
            let api: Api<RunnerDeployment> = Api::namespaced(client.clone(), namespace);
            match api.get_opt(&target.name).await? {
                Some(rd) => Ok(WorkloadScope::Found(rd.runner_scope())),
                None => Ok(WorkloadScope::Missing {
                    kind: "RunnerDeployment",
                    name: target.name.clone(),
                }),
            }
        }
        "RunnerSet" => {
            if target.name.is_empty() {
                return Ok(WorkloadScope::Missing {
                    kind: "RunnerSet",
                    name: String::new(),
                });
            }
            let api: Api<RunnerSet> = Api::namespaced(client.clone(), namespace);
            match api.get_opt(&target.name).await? {
                Some(rs) => Ok(WorkloadScope::Found(rs.runner_scope())),
                None => Ok(WorkloadScope::Missing {
                    kind: "RunnerSet",
                    name: target.name.clone(),
                }),
            }
        }
        other => Ok(WorkloadScope::UnsupportedKind(other.to_string())),
    }
}

/// Derives the index keys of a workload. A pure function of its scope
/// fields; re-indexing the same workload yields the same key set.
pub fn index_keys(scope: &RunnerScope) -> Vec<String> {
    let mut keys = Vec::new();
    if !scope.repository.is_empty() {
        // Repository runners
        keys.push(scope.repository.clone());
    }
    if !scope.organization.is_empty() {
        if scope.group.is_empty() {
            // Organization runners
            keys.push(scope.organization.clone());
        } else {
            // Organization runner groups
            keys.push(organizational_runner_group_key(
                &scope.organization,
                &scope.group,
            ));
        }
    }
    if !scope.enterprise.is_empty() {
        if scope.group.is_empty() {
            // Enterprise runners
            keys.push(enterprise_key(&scope.enterprise));
        } else {
            // Enterprise runner groups
            keys.push(enterprise_runner_group_key(&scope.enterprise, &scope.group));
        }
    }
    keys
}

// --- The index itself ---

/// Namespace/name pair identifying an indexed autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

struct IndexedEntry {
    keys: Vec<String>,
    hra: HorizontalRunnerAutoscaler,
}

#[derive(Default)]
struct IndexInner {
    by_key: HashMap<String, BTreeSet<ObjectKey>>,
    entries: HashMap<ObjectKey, IndexedEntry>,
}

/// Shared `scaleTarget → HorizontalRunnerAutoscaler` index.
#[derive(Default)]
pub struct ScaleTargetIndex {
    inner: RwLock<IndexInner>,
}

impl ScaleTargetIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the indexed entry for one autoscaler.
    pub async fn apply(
        &self,
        object_key: ObjectKey,
        keys: Vec<String>,
        hra: HorizontalRunnerAutoscaler,
    ) {
        let mut inner = self.inner.write().await;
        unlink(&mut inner, &object_key);
        for key in &keys {
            inner
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(object_key.clone());
        }
        inner.entries.insert(object_key, IndexedEntry { keys, hra });
    }

    /// Drops an autoscaler from the index entirely.
    pub async fn remove(&self, object_key: &ObjectKey) {
        let mut inner = self.inner.write().await;
        unlink(&mut inner, object_key);
        inner.entries.remove(object_key);
    }

    /// Returns every autoscaler indexed under `value`. An empty value
    /// matches nothing.
    pub async fn find_by_key(&self, value: &str) -> Vec<HorizontalRunnerAutoscaler> {
        if value.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().await;
        let Some(object_keys) = inner.by_key.get(value) else {
            return Vec::new();
        };
        object_keys
            .iter()
            .filter_map(|k| inner.entries.get(k))
            .map(|e| e.hra.clone())
            .collect()
    }

    /// Returns every indexed autoscaler, in deterministic order.
    pub async fn all(&self) -> Vec<HorizontalRunnerAutoscaler> {
        let inner = self.inner.read().await;
        let mut object_keys: Vec<&ObjectKey> = inner.entries.keys().collect();
        object_keys.sort();
        object_keys
            .into_iter()
            .filter_map(|k| inner.entries.get(k))
            .map(|e| e.hra.clone())
            .collect()
    }
}

fn unlink(inner: &mut IndexInner, object_key: &ObjectKey) {
    if let Some(existing) = inner.entries.get(object_key) {
        let stale: Vec<String> = existing.keys.clone();
        for key in stale {
            if let Some(set) = inner.by_key.get_mut(&key) {
                set.remove(object_key);
                if set.is_empty() {
                    inner.by_key.remove(&key);
                }
            }
        }
    }
}

// --- Reconciler keeping the index current ---

pub struct IndexContext {
    pub client: Client,
    pub index: Arc<ScaleTargetIndex>,
}

async fn reconcile(
    hra: Arc<HorizontalRunnerAutoscaler>,
    ctx: Arc<IndexContext>,
) -> Result<Action, Error> {
    let namespace = hra.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = hra.name_any();
    let object_key = ObjectKey {
        namespace: namespace.clone(),
        name: name.clone(),
    };

    let api: Api<HorizontalRunnerAutoscaler> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(latest) = api.get_opt(&name).await? else {
        ctx.index.remove(&object_key).await;
        debug!(hra = %name, "dropped deleted autoscaler from scale target index");
        return Ok(Action::await_change());
    };

    let keys = match load_workload_scope(&ctx.client, &namespace, &latest.spec.scale_target_ref)
        .await?
    {
        WorkloadScope::Found(scope) => index_keys(&scope),
        WorkloadScope::Missing { kind, name: workload } => {
            debug!(hra = %name, kind, workload = %workload, "scale target workload not found; indexing no keys");
            Vec::new()
        }
        WorkloadScope::UnsupportedKind(kind) => {
            warn!(hra = %name, kind = %kind, "unsupported scaleTargetRef kind; indexing no keys");
            Vec::new()
        }
    };

    debug!(hra = %name, keys = ?keys, "indexed scale target keys");
    ctx.index.apply(object_key, keys, latest).await;

    Ok(Action::requeue(Duration::from_secs(3600)))
}

fn error_policy(
    _hra: Arc<HorizontalRunnerAutoscaler>,
    error: &Error,
    _ctx: Arc<IndexContext>,
) -> Action {
    warn!("scale target index reconciliation failed: {}", error);
    Action::requeue(Duration::from_secs(15))
}

/// Runs the index controller until the watch stream ends.
pub async fn run(client: Client, namespace: Option<String>, index: Arc<ScaleTargetIndex>) {
    let api: Api<HorizontalRunnerAutoscaler> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    Controller::new(api, watcher::Config::default())
        .run(reconcile, error_policy, Arc::new(IndexContext { client, index }))
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("reconciled scale target index entry for {:?}", obj),
                Err(e) => warn!("scale target index controller error: {}", e),
            }
        })
        .await;
}
