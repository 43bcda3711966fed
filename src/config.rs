/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* Operator-level configuration, loaded from environment variables with
* defaults suitable for in-cluster deployment.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::net::SocketAddr;

/// Runtime configuration for the webhook server and the index controller.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Bind address of the webhook endpoint (default: `0.0.0.0:8000`).
    pub webhook_addr: SocketAddr,
    /// Bind address of the Prometheus `/metrics` endpoint
    /// (default: `0.0.0.0:8080`).
    pub metrics_addr: SocketAddr,
    /// Namespace to watch for HorizontalRunnerAutoscalers. `None` watches
    /// all namespaces.
    pub watch_namespace: Option<String>,
    /// Webhook secret bytes. When unset, payload signatures are not
    /// validated.
    pub webhook_secret: Option<Vec<u8>>,
}

impl OperatorConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                       | Default        |
    /// |-------------------------------|----------------|
    /// | `WEBHOOK_ADDR`                | `0.0.0.0:8000` |
    /// | `METRICS_ADDR`                | `0.0.0.0:8080` |
    /// | `WATCH_NAMESPACE`             | all namespaces |
    /// | `GITHUB_WEBHOOK_SECRET_TOKEN` | unset          |
    pub fn from_env() -> Self {
        let webhook_addr: SocketAddr = std::env::var("WEBHOOK_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".into())
            .parse()
            .expect("WEBHOOK_ADDR must be a valid socket address");

        let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".into())
            .parse()
            .expect("METRICS_ADDR must be a valid socket address");

        let watch_namespace = std::env::var("WATCH_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty());

        let webhook_secret = std::env::var("GITHUB_WEBHOOK_SECRET_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .map(String::into_bytes);

        Self {
            webhook_addr,
            metrics_addr,
            watch_namespace,
            webhook_secret,
        }
    }
}
