/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to the Custom
* Resource Definitions (CRDs) the runner operator works with. By using the
* `kube::CustomResource` derive macro, we create a strongly-typed
* representation of our custom APIs, enabling safe and idiomatic interaction
* with the Kubernetes API server.
*
* Architecture:
* - `HorizontalRunnerAutoscaler` describes *how* a runner workload scales:
*   which workload it targets (`scaleTargetRef`), which webhook events may
*   trigger a scale-up (`scaleUpTriggers`), and the list of currently active
*   `capacityReservations` the webhook server maintains.
* - `RunnerDeployment` and `RunnerSet` are the two scalable runner workload
*   kinds. The webhook server only ever reads them; their reconciliation is
*   owned by a separate controller.
* - `serde` attributes map between idiomatic Rust `snake_case` and idiomatic
*   Kubernetes `camelCase`.
* - `schemars` generates an OpenAPI v3 schema from the Rust types, which is
*   embedded into the CRD manifest for server-side validation.
*
* SPDX-License-Identifier: Apache-2.0
*/

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// --- HorizontalRunnerAutoscaler Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ph.io",
    version = "v1alpha1",
    kind = "HorizontalRunnerAutoscaler",
    namespaced,
    status = "HorizontalRunnerAutoscalerStatus",
    printcolumn = r#"{"name":"Min", "type":"integer", "jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Max", "type":"integer", "jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "hra"
)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerSpec {
    /// Reference to the scalable runner workload. An empty `kind` is treated
    /// as `RunnerDeployment`.
    #[serde(default)]
    pub scale_target_ref: ScaleTargetRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Webhook-driven scale-up triggers. Workflow-job based scaling supports
    /// at most one trigger per autoscaler.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_up_triggers: Vec<ScaleUpTrigger>,

    /// Time-bounded capacity reservations managed by the webhook server.
    /// Entries whose expiration has passed are purged on the next write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capacity_reservations: Vec<CapacityReservation>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// `RunnerDeployment`, `RunnerSet`, or empty (defaults to
    /// `RunnerDeployment`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_event: Option<GitHubEventScaleUpTriggerSpec>,

    /// Number of replicas to add per matching event. Zero is treated as one.
    #[serde(default)]
    pub amount: i32,

    /// How long the added capacity is reserved, e.g. "5m" or "1h".
    /// Workflow-job scaling falls back to ten minutes when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitHubEventScaleUpTriggerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_run: Option<CheckRunSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_job: Option<WorkflowJobSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckRunSpec {
    /// Event actions that trigger a scale-up. Empty matches every action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSpec {
    /// Event actions that trigger a scale-up. Empty matches every action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowJobSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReservation {
    pub expiration_time: Time,
    pub replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_scale_out_time: Option<Time>,
}

// --- RunnerDeployment Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ph.io",
    version = "v1alpha1",
    kind = "RunnerDeployment",
    namespaced,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "rdeploy"
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Exactly one of `repository`, `organization` and `enterprise` is
    /// expected to be set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub enterprise: String,

    /// Runner group name. Meaningful only for organization and enterprise
    /// scoped runners.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

// --- RunnerSet Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "ph.io",
    version = "v1alpha1",
    kind = "RunnerSet",
    namespaced,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub enterprise: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

// --- Shared scope view over the two workload kinds ---

/// The scope fields of a runner workload, independent of its kind. The
/// scale-target index and the webhook resolver only ever need these.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerScope {
    pub repository: String,
    pub organization: String,
    pub enterprise: String,
    pub group: String,
    pub labels: Vec<String>,
}

impl RunnerDeployment {
    pub fn runner_scope(&self) -> RunnerScope {
        RunnerScope {
            repository: self.spec.repository.clone(),
            organization: self.spec.organization.clone(),
            enterprise: self.spec.enterprise.clone(),
            group: self.spec.group.clone(),
            labels: self.spec.labels.clone(),
        }
    }
}

impl RunnerSet {
    pub fn runner_scope(&self) -> RunnerScope {
        RunnerScope {
            repository: self.spec.repository.clone(),
            organization: self.spec.organization.clone(),
            enterprise: self.spec.enterprise.clone(),
            group: self.spec.group.clone(),
            labels: self.spec.labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_capacity_reservation_uses_camel_case_wire_names() {
        let reservation = CapacityReservation {
            expiration_time: Time(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
            replicas: 3,
        };

        let value = serde_json::to_value(&reservation).unwrap();
        assert!(value.get("expirationTime").is_some());
        assert_eq!(value["replicas"], 3);
    }

    #[test]
    fn test_scale_up_trigger_defaults() {
        let trigger: ScaleUpTrigger = serde_json::from_str("{}").unwrap();
        assert_eq!(trigger.amount, 0);
        assert!(trigger.duration.is_none());
        assert!(trigger.github_event.is_none());
    }

    #[test]
    fn test_runner_scope_from_both_workload_kinds() {
        let rd = RunnerDeployment::new(
            "rd",
            RunnerDeploymentSpec {
                organization: "acme".to_string(),
                group: "gpu".to_string(),
                labels: vec!["linux".to_string()],
                ..Default::default()
            },
        );
        let rs = RunnerSet::new(
            "rs",
            RunnerSetSpec {
                organization: "acme".to_string(),
                group: "gpu".to_string(),
                labels: vec!["linux".to_string()],
                ..Default::default()
            },
        );

        assert_eq!(rd.runner_scope(), rs.runner_scope());
    }
}
