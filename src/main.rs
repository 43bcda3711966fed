/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* Archive: src/main.rs
*
* This file is the main entry point for the runner autoscaler operator. It is
* responsible for wiring up and running the long-lived pieces of the system:
*
* 1.  **Initialization**: a Kubernetes client is created and `tracing` is set
*     up for structured logging.
* 2.  **GitHub Client**: when credentials are configured, a GitHub API client
*     is constructed. Without one the operator still runs webhook-only, but
*     runner-group visibility checks are skipped.
* 3.  **Scale-Target Index**: a controller watches HorizontalRunnerAutoscaler
*     resources and maintains the in-memory `scaleTarget` index the webhook
*     server resolves events against.
* 4.  **Webhook Server**: an embedded HTTP server receives GitHub webhook
*     deliveries and turns them into capacity-reservation patches.
* 5.  **Metrics**: custom Prometheus metrics are registered and served on a
*     dedicated `/metrics` endpoint.
*
* All of these run concurrently on the `tokio` runtime; if any of them exits
* the others are torn down with it.
*
* SPDX-License-Identifier: Apache-2.0 */

use std::sync::Arc;

use anyhow::Context as _;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;

use ph_runner_operator::config::OperatorConfig;
use ph_runner_operator::controllers::scale_target_index::{self, ScaleTargetIndex};
use ph_runner_operator::controllers::webhook_autoscaler::{self, WebhookAutoscaler};
use ph_runner_operator::{github, metrics};

/// Initializes the tracing subscriber with an env-driven filter and a JSON
/// formatting layer.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder
        .encode(&registry.gather(), &mut buffer)
        .expect("Failed to encode metrics");

    let response = String::from_utf8(buffer).expect("Failed to convert metrics to string");
    Ok(warp::reply::with_header(
        response,
        "Content-Type",
        encoder.format_type(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let operator_config = OperatorConfig::from_env();
    let github_config = github::Config::from_env();

    let registry = Arc::new(
        metrics::create_and_register_metrics().context("registering prometheus metrics")?,
    );

    let client = kube::Client::try_default()
        .await
        .context("initializing kubernetes client")?;

    let github_client = if github_config.is_configured() {
        let client = github_config
            .new_client()
            .context("constructing github client")?;
        info!(base_url = %client.github_base_url, "github client configured");
        Some(Arc::new(client))
    } else {
        info!("no github credentials configured; runner group visibility checks are disabled");
        None
    };

    let index = ScaleTargetIndex::new();

    let autoscaler = Arc::new(WebhookAutoscaler::new(
        client.clone(),
        index.clone(),
        github_client,
        operator_config.webhook_secret.clone(),
    ));

    let registry_filter = {
        let registry = registry.clone();
        warp::any().map(move || registry.clone())
    };
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(registry_filter)
        .and_then(metrics_handler);
    let metrics_server = warp::serve(metrics_route).run(operator_config.metrics_addr);

    info!(
        webhook_addr = %operator_config.webhook_addr,
        metrics_addr = %operator_config.metrics_addr,
        namespace = %operator_config.watch_namespace.as_deref().unwrap_or("<all>"),
        "starting runner autoscaler operator"
    );

    tokio::select! {
        _ = scale_target_index::run(
            client,
            operator_config.watch_namespace.clone(),
            index.clone(),
        ) => {
            warn!("scale target index controller has unexpectedly exited");
        }
        _ = webhook_autoscaler::run_webhook_server(
            autoscaler,
            operator_config.webhook_addr,
        ) => {
            warn!("webhook server has unexpectedly exited");
        }
        _ = metrics_server => {
            warn!("metrics server has unexpectedly exited");
        }
    }

    Ok(())
}
