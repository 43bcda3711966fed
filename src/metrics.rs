/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines and registers the custom Prometheus metrics that the
* runner operator exposes. These metrics provide insights into the webhook
* traffic the operator receives, the scaling decisions it takes, and its
* interactions with the GitHub API.
*
* Using `lazy_static`, we ensure that the metrics are created only once and
* are available globally and safely across all concurrent webhook handler
* tasks and reconciliation loops.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec, Registry};

// --- Metric Definitions ---

lazy_static! {
    /// Webhook deliveries received, labeled by event kind.
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "ph_runner_webhook_events_total",
            "Total number of webhook deliveries received.",
            &["event"]
        ).unwrap();

    /// Capacity-reservation patches applied, labeled by scaling direction.
    pub static ref SCALE_OPERATIONS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "ph_runner_scale_operations_total",
            "Total number of capacity reservation patches applied.",
            &["direction"]
        ).unwrap();

    /// Outbound GitHub API requests, labeled by method and response status.
    pub static ref GITHUB_API_REQUESTS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "ph_runner_github_api_requests_total",
            "Total number of GitHub API requests issued.",
            &["method", "status"]
        ).unwrap();

    /// Registration token issuance outcomes, labeled hit or miss.
    pub static ref REGISTRATION_TOKEN_CACHE_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "ph_runner_registration_token_cache_total",
            "Registration token cache lookups by outcome.",
            &["result"]
        ).unwrap();
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()))?;
    r.register(Box::new(SCALE_OPERATIONS_TOTAL.clone()))?;
    r.register(Box::new(GITHUB_API_REQUESTS_TOTAL.clone()))?;
    r.register(Box::new(REGISTRATION_TOKEN_CACHE_TOTAL.clone()))?;
    Ok(r)
}
