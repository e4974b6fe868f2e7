//! `harvestd` -- standalone job polling and delivery daemon.
//!
//! Polls a remote processing API for completed generation jobs and
//! appends each delivered result to a JSON-lines file. Jobs to track can
//! be seeded via `HARVEST_JOBS`; embedders register them through the
//! coordinator API instead.
//!
//! # Environment variables
//!
//! | Variable               | Required | Default                  | Description                              |
//! |------------------------|----------|--------------------------|------------------------------------------|
//! | `HARVEST_REMOTE_URL`   | yes      | --                       | Base URL of the remote API               |
//! | `HARVEST_SCOPE_KEY`    | no       | `default`                | Scope for bulk polls and the idle probe  |
//! | `HARVEST_RESULTS_FILE` | no       | `harvest-results.jsonl`  | Where delivered results are appended     |
//! | `HARVEST_JOBS`         | no       | (empty)                  | Comma-separated job ids to track         |
//!
//! Scheduling knobs (`HARVEST_BASE_INTERVAL_SECS`, `HARVEST_MAX_RETRIES`,
//! ...) are documented on `CoordinatorConfig::from_env`.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harvest_coordinator::poller::Coordinator;
use harvest_core::config::CoordinatorConfig;
use harvest_core::types::{JobKind, PollMode};
use harvest_daemon::store::{JsonLinesStore, TracingApplier};
use harvest_remote::api::HttpRemoteApi;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvestd=info,harvest_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::var("HARVEST_REMOTE_URL").is_err() {
        tracing::error!("HARVEST_REMOTE_URL environment variable is required");
        std::process::exit(1);
    }
    let config = CoordinatorConfig::from_env();

    let results_path = std::env::var("HARVEST_RESULTS_FILE")
        .unwrap_or_else(|_| "harvest-results.jsonl".into());
    let seed_jobs: Vec<String> = std::env::var("HARVEST_JOBS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    tracing::info!(
        remote = %config.base_url,
        scope = %config.scope_key,
        results = %results_path,
        "Starting harvestd",
    );

    let remote = Arc::new(HttpRemoteApi::new(
        config.base_url.clone(),
        config.request_timeout,
    ));
    let store = Arc::new(JsonLinesStore::new(results_path));
    let applier = Arc::new(TracingApplier);

    let coordinator = Coordinator::new(config, remote, store, applier);
    for job_id in seed_jobs {
        if let Err(e) = coordinator
            .register_job(job_id.clone(), JobKind::Single, PollMode::Pull)
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Could not register seed job");
        }
    }

    let mut events = coordinator.subscribe();
    coordinator.start().await;
    tracing::info!("harvestd running, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                if let Ok(event) = event {
                    tracing::debug!(?event, "Coordinator event");
                }
            }
        }
    }

    coordinator.stop().await;
    tracing::info!("harvestd stopped");
}
